use querylife_error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    Queries,
    QuerySelects,
    QueryInserts,
    Errors,
    ResultRows,
    ResultBytes,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::Queries => "queries",
            QuotaKind::QuerySelects => "query_selects",
            QuotaKind::QueryInserts => "query_inserts",
            QuotaKind::Errors => "errors",
            QuotaKind::ResultRows => "result_rows",
            QuotaKind::ResultBytes => "result_bytes",
        }
    }
}

/// Resource quota of the user running a query.
pub trait Quota: Sync + Send {
    /// Charge `amount` units. If `check_exceeded` is set, fail with
    /// `QuotaExceeded` when the charge puts the user over the limit.
    fn used(&self, kind: QuotaKind, amount: u64, check_exceeded: bool) -> Result<()>;

    /// Fail if the quota of the given kind is already exceeded.
    fn check_exceeded(&self, kind: QuotaKind) -> Result<()>;
}

use crate::context::ExecutionContext;
use crate::interpreter::OutputSchema;
use crate::statement::Statement;
use crate::txn::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingScope {
    PerUser,
    /// Readable by every user.
    Shared,
}

/// Identity of a cached result.
///
/// Readers and writers must build keys with [`CacheKey::new`], any
/// difference in construction means hits never happen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub statement_fingerprint: [u8; 16],
    pub schema_fingerprint: [u8; 16],
    /// User owning the entry, `None` for shared entries.
    pub principal: Option<String>,
    pub scope: SharingScope,
    /// Set when the statement runs inside an explicit session transaction,
    /// so results that may observe uncommitted writes stay within it.
    pub transaction: Option<TxnId>,
}

impl CacheKey {
    pub fn new(stmt: &Statement, schema: &OutputSchema, ctx: &ExecutionContext) -> Self {
        let scope = if ctx.settings.query_cache_share_between_users {
            SharingScope::Shared
        } else {
            SharingScope::PerUser
        };
        let principal = match scope {
            SharingScope::PerUser => Some(ctx.client.user.clone()),
            SharingScope::Shared => None,
        };

        CacheKey {
            statement_fingerprint: stmt.fingerprint(),
            schema_fingerprint: schema.fingerprint(),
            principal,
            scope,
            transaction: ctx.explicit_transaction().map(|txn| txn.id),
        }
    }
}

//! Errors produced while sequencing and finalizing a query.
use std::fmt;

/// Numeric error code attached to every error.
///
/// Codes travel across nodes, so a code received from a remote participant
/// may not correspond to any variant of [`ExecError`] produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const LOGICAL_ERROR: ErrorCode = ErrorCode(49);
    pub const UNKNOWN_SETTING: ErrorCode = ErrorCode(115);
    pub const TIMEOUT_EXCEEDED: ErrorCode = ErrorCode(159);
    pub const SYNTAX_ERROR: ErrorCode = ErrorCode(62);
    pub const TOO_DEEP_AST: ErrorCode = ErrorCode(167);
    pub const TOO_BIG_AST: ErrorCode = ErrorCode(168);
    pub const TOO_DEEP_RECURSION: ErrorCode = ErrorCode(306);
    pub const QUERY_IS_TOO_LARGE: ErrorCode = ErrorCode(369);
    pub const QUOTA_EXPIRED: ErrorCode = ErrorCode(201);
    pub const SOCKET_TIMEOUT: ErrorCode = ErrorCode(209);
    pub const NETWORK_ERROR: ErrorCode = ErrorCode(210);
    pub const QUERY_WAS_CANCELLED: ErrorCode = ErrorCode(394);
    pub const TOO_MANY_ROWS_OR_BYTES: ErrorCode = ErrorCode(396);
    pub const INVALID_SETTING_VALUE: ErrorCode = ErrorCode(471);
    pub const ROUTING_FAILURE: ErrorCode = ErrorCode(5001);
    pub const QUEUE_QUERY_FAILURE: ErrorCode = ErrorCode(5002);
    pub const TRANSACTION_CONFLICT: ErrorCode = ErrorCode(5003);
    pub const OPTIMIZER_FAILURE: ErrorCode = ErrorCode(5004);
    pub const PERFECT_SHARD_FAILURE: ErrorCode = ErrorCode(5005);
    pub const EXECUTION_FAILURE: ErrorCode = ErrorCode(5006);
    pub const AMBIGUOUS_DISTRIBUTED_ERROR: ErrorCode = ErrorCode(5007);

    /// Whether an error with this code, observed on one node, may hide a
    /// different root cause on another participating node.
    pub const fn is_ambiguous(&self) -> bool {
        matches!(
            *self,
            Self::NETWORK_ERROR
                | Self::SOCKET_TIMEOUT
                | Self::QUERY_WAS_CANCELLED
                | Self::AMBIGUOUS_DISTRIBUTED_ERROR
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the admission queue refused a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    Timeout,
    Capacity,
}

impl fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting in queue"),
            Self::Capacity => write!(f, "queue is full"),
        }
    }
}

/// Size limit checked while parsing a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    QuerySize,
    ParserDepth,
    AstDepth,
    AstElements,
}

impl SizeLimit {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::QuerySize => ErrorCode::QUERY_IS_TOO_LARGE,
            Self::ParserDepth => ErrorCode::TOO_DEEP_RECURSION,
            Self::AstDepth => ErrorCode::TOO_DEEP_AST,
            Self::AstElements => ErrorCode::TOO_BIG_AST,
        }
    }
}

impl fmt::Display for SizeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuerySize => write!(f, "query size"),
            Self::ParserDepth => write!(f, "parser depth"),
            Self::AstDepth => write!(f, "ast depth"),
            Self::AstElements => write!(f, "ast elements"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("{what} exceeds limit: {actual} > {limit}")]
    SizeLimitExceeded {
        what: SizeLimit,
        limit: u64,
        actual: u64,
    },

    #[error("routing failure: {0}")]
    Routing(String),

    #[error("query queue failed for query_id {query_id}: {reason}")]
    Admission {
        query_id: String,
        reason: AdmissionRejection,
    },

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("optimizer failure: {0}")]
    Optimizer(String),

    #[error("perfect-shard failure: {0}")]
    PerfectShard(String),

    #[error("execution failure: {0}")]
    Execution(String),

    #[error("Query '{query_id}' is killed in pending state")]
    Cancelled { query_id: String },

    #[error("ambiguous distributed error ({code}): {message}")]
    AmbiguousDistributed { code: ErrorCode, message: String },

    /// A summarized error reported by another participating node.
    #[error("{message} (code {code})")]
    Remote { code: ErrorCode, message: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("limit for result exceeded: {what} {actual} > {limit}")]
    ResultLimitExceeded {
        what: &'static str,
        limit: u64,
        actual: u64,
    },

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("invalid value for setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::SYNTAX_ERROR,
            Self::SizeLimitExceeded { what, .. } => what.code(),
            Self::Routing(_) => ErrorCode::ROUTING_FAILURE,
            Self::Admission { .. } => ErrorCode::QUEUE_QUERY_FAILURE,
            Self::TransactionConflict(_) => ErrorCode::TRANSACTION_CONFLICT,
            Self::Optimizer(_) => ErrorCode::OPTIMIZER_FAILURE,
            Self::PerfectShard(_) => ErrorCode::PERFECT_SHARD_FAILURE,
            Self::Execution(_) => ErrorCode::EXECUTION_FAILURE,
            Self::Cancelled { .. } => ErrorCode::QUERY_WAS_CANCELLED,
            Self::AmbiguousDistributed { code, .. } => *code,
            Self::Remote { code, .. } => *code,
            Self::QuotaExceeded(_) => ErrorCode::QUOTA_EXPIRED,
            Self::ResultLimitExceeded { .. } => ErrorCode::TOO_MANY_ROWS_OR_BYTES,
            Self::UnknownSetting(_) => ErrorCode::UNKNOWN_SETTING,
            Self::InvalidSetting { .. } => ErrorCode::INVALID_SETTING_VALUE,
            Self::Internal(_) => ErrorCode::LOGICAL_ERROR,
        }
    }

    /// Whether the locally observed error may not be the true root cause
    /// across the nodes participating in the query.
    pub fn is_ambiguous(&self) -> bool {
        self.code().is_ambiguous()
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::ExecError::Internal(std::format!($($arg)*))
    };
}

/// Extension for turning a missing value into an internal error.
pub trait OptionExt<T> {
    fn required(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &'static str) -> Result<T> {
        self.ok_or_else(|| ExecError::Internal(format!("Missing required value: {what}")))
    }
}

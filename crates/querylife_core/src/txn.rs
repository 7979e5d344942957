use std::fmt;
use std::sync::Arc;

use querylife_error::Result;

use crate::routing::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical timestamp issued by the transaction log.
///
/// Zero means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Where a transaction handle came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOrigin {
    /// Created by this node.
    Local,
    /// Bound to a transaction hosted by another server.
    Remote(Host),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHandle {
    pub id: TxnId,
    pub read_only: bool,
    /// Id of the explicit session transaction this one is nested in.
    pub primary_id: Option<TxnId>,
    pub origin: TransactionOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateTransactionOptions {
    pub read_only: bool,
    pub force_clean_by_dm: bool,
    pub async_post_commit: bool,
    pub primary_id: Option<TxnId>,
}

/// Process-wide transaction manager.
pub trait TransactionManager: Sync + Send {
    /// Create a new transaction on this node.
    fn create(&self, opts: CreateTransactionOptions) -> Result<Arc<TransactionHandle>>;

    /// Bind to the transaction context of the server owning a table. `None`
    /// means the table is owned by this node.
    fn create_for_host(&self, host: Option<&Host>) -> Result<Arc<TransactionHandle>>;

    /// Request completion of a transaction.
    ///
    /// Completing an already completed transaction is a no-op.
    fn finish(&self, txn: &TransactionHandle);

    /// Commit an explicit session transaction.
    fn commit(&self, txn: &TransactionHandle) -> Result<()>;
}

use querylife_error::Result;

use crate::routing::Host;
use crate::statement::TableRef;
use crate::txn::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub table: TableRef,
    /// Whether writes to the table go through the transaction log.
    pub transactional: bool,
    /// Server hosting the table's write transactions, `None` if local.
    pub owner: Option<Host>,
}

/// Table metadata the coordinator needs.
pub trait Catalog: Sync + Send {
    fn table_info(&self, table: &TableRef) -> Result<Option<TableInfo>>;

    /// Commit time of the most recent write to a table.
    fn last_update_time(&self, table: &TableRef) -> Result<Timestamp>;
}

use std::fmt;

use querylife_error::Result;

use crate::config::SettingValue;
use crate::context::{ExecutionContext, ExecutionGroup};
use crate::result::Output;
use crate::statement::Statement;

/// Address of a server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    pub rpc_address: String,
    pub tcp_address: String,
}

impl Host {
    pub fn new(rpc_address: impl Into<String>, tcp_address: impl Into<String>) -> Self {
        Host {
            rpc_address: rpc_address.into(),
            tcp_address: tcp_address.into(),
        }
    }

    /// Check if this host is the server with the given rpc address.
    pub fn is_local(&self, local_address: &str) -> bool {
        self.rpc_address == local_address
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rpc_address)
    }
}

/// Resolves which server should run a statement.
pub trait Router: Sync + Send {
    /// Resolve the host owning the statement's tables, `None` if any server
    /// can run it.
    fn resolve(&self, stmt: &Statement, ctx: &ExecutionContext) -> Result<Option<Host>>;

    /// Pick the execution group for a statement that doesn't have one yet.
    fn resolve_execution_group(
        &self,
        stmt: &Statement,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionGroup>>;
}

/// Runs a statement on another server, end to end.
pub trait RemoteDispatcher: Sync + Send {
    fn execute_remote(&self, host: &Host, stmt: &Statement, ctx: &ExecutionContext)
    -> Result<Output>;
}

/// Setting overrides configured for the scope (database, table, tenant) a
/// statement targets.
pub trait ScopeSettings: Sync + Send {
    fn overrides_for(
        &self,
        stmt: &Statement,
        ctx: &ExecutionContext,
    ) -> Option<Vec<(String, SettingValue)>>;
}

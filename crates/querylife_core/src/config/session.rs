use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use querylife_error::{ExecError, Result};

use super::value::SettingValue;
use crate::telemetry::QueryLogType;

/// What to do when a result exceeds `max_result_rows` or `max_result_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowMode {
    /// Fail the query.
    #[default]
    Throw,
    /// Stop producing rows and finish normally.
    Break,
}

impl OverflowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throw => "throw",
            Self::Break => "break",
        }
    }
}

impl FromStr for OverflowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "throw" => Ok(Self::Throw),
            "break" => Ok(Self::Break),
            other => Err(format!("unknown overflow mode '{other}'")),
        }
    }
}

/// Settings read while sequencing a single statement.
///
/// Settings start from the process defaults, then get modified by per-scope
/// overrides, session `SET`s and statement SETTINGS clauses.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_query_size: u64,
    pub max_parser_depth: u64,
    pub max_ast_depth: u64,
    pub max_ast_elements: u64,

    pub enable_optimizer: bool,
    pub enable_optimizer_fallback: bool,
    pub distributed_perfect_shard: bool,
    pub fallback_perfect_shard: bool,
    pub enable_distributed_stages: bool,
    pub enable_auto_query_forwarding: bool,

    pub use_query_cache: bool,
    pub enable_reads_from_query_cache: bool,
    pub enable_writes_to_query_cache: bool,
    pub enable_transactional_query_cache: bool,
    pub query_cache_min_query_runs: u64,
    pub query_cache_min_query_duration_ms: u64,
    pub query_cache_ttl_secs: u64,
    pub query_cache_share_between_users: bool,
    pub query_cache_compress_entries: bool,
    pub query_cache_squash_partial_results: bool,
    pub query_cache_store_results_of_queries_with_nondeterministic_functions: bool,
    pub query_cache_max_size_in_bytes: u64,
    pub query_cache_max_entries: u64,
    pub query_cache_max_entry_size_in_rows: u64,
    pub query_cache_max_entry_size_in_bytes: u64,
    pub max_block_size: u64,

    pub enable_query_queue: bool,
    pub query_queue_timeout_ms: u64,

    pub max_result_rows: u64,
    pub max_result_bytes: u64,
    pub result_overflow_mode: OverflowMode,

    pub log_queries: bool,
    pub log_queries_min_type: QueryLogType,
    pub log_queries_min_query_duration_ms: u64,
    pub log_queries_cut_to_length: u64,
    pub log_comment: String,

    pub force_clean_transaction_by_dm: bool,
    pub async_post_commit: bool,
    pub ambiguous_error_wait_timeout_ms: u64,

    /// Names of settings explicitly changed from their defaults.
    changed: HashSet<&'static str>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_query_size: 262_144,
            max_parser_depth: 1000,
            max_ast_depth: 1000,
            max_ast_elements: 50_000,
            enable_optimizer: true,
            enable_optimizer_fallback: true,
            distributed_perfect_shard: false,
            fallback_perfect_shard: true,
            enable_distributed_stages: false,
            enable_auto_query_forwarding: false,
            use_query_cache: false,
            enable_reads_from_query_cache: true,
            enable_writes_to_query_cache: true,
            enable_transactional_query_cache: true,
            query_cache_min_query_runs: 0,
            query_cache_min_query_duration_ms: 0,
            query_cache_ttl_secs: 60,
            query_cache_share_between_users: false,
            query_cache_compress_entries: true,
            query_cache_squash_partial_results: true,
            query_cache_store_results_of_queries_with_nondeterministic_functions: false,
            query_cache_max_size_in_bytes: 1024 * 1024 * 1024,
            query_cache_max_entries: 1024,
            query_cache_max_entry_size_in_rows: 30_000_000,
            query_cache_max_entry_size_in_bytes: 1024 * 1024,
            max_block_size: DEFAULT_BLOCK_SIZE,
            enable_query_queue: false,
            query_queue_timeout_ms: 100_000,
            max_result_rows: 0,
            max_result_bytes: 0,
            result_overflow_mode: OverflowMode::Throw,
            log_queries: true,
            log_queries_min_type: QueryLogType::QueryStart,
            log_queries_min_query_duration_ms: 0,
            log_queries_cut_to_length: 100_000,
            log_comment: String::new(),
            force_clean_transaction_by_dm: false,
            async_post_commit: false,
            ambiguous_error_wait_timeout_ms: 10_000,
            changed: HashSet::new(),
        }
    }
}

impl SessionConfig {
    /// Set a setting by name, marking it as explicitly changed.
    pub fn set(&mut self, name: &str, value: SettingValue) -> Result<()> {
        let (name, func) = lookup(name)?;
        (func.set)(value, self)?;
        self.changed.insert(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<SettingValue> {
        let (_, func) = lookup(name)?;
        Ok((func.get)(self))
    }

    /// Apply a list of settings (e.g. a SETTINGS clause) in order.
    pub fn apply_all<'a, I>(&mut self, settings: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a (String, SettingValue)>,
    {
        for (name, value) in settings {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Overwrite default values with the provided settings.
    ///
    /// Settings that were explicitly changed are left untouched, and applied
    /// values are not marked as changed. Returns the number of settings
    /// applied.
    pub fn apply_defaults<'a, I>(&mut self, settings: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a (String, SettingValue)>,
    {
        let mut applied = 0;
        for (name, value) in settings {
            let (name, func) = lookup(name)?;
            if self.changed.contains(name) {
                continue;
            }
            (func.set)(value.clone(), self)?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn is_changed(&self, name: &str) -> bool {
        self.changed.contains(name)
    }

    /// Reset a setting back to the process default.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let (name, func) = lookup(name)?;
        let def_conf = Self::default();
        (func.set)((func.get)(&def_conf), self)?;
        self.changed.remove(name);
        Ok(())
    }

    pub fn query_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.query_queue_timeout_ms)
    }

    pub fn query_cache_min_query_duration(&self) -> Duration {
        Duration::from_millis(self.query_cache_min_query_duration_ms)
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }

    pub fn ambiguous_error_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ambiguous_error_wait_timeout_ms)
    }
}

pub const DEFAULT_BLOCK_SIZE: u64 = 65_505;

struct SettingFunctions {
    set: fn(value: SettingValue, conf: &mut SessionConfig) -> Result<()>,
    get: fn(conf: &SessionConfig) -> SettingValue,
}

impl SettingFunctions {
    const fn new<S: SessionSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_value as _,
            get: S::get_as_value as _,
        }
    }
}

fn lookup(name: &str) -> Result<(&'static str, &'static SettingFunctions)> {
    GET_SET_FUNCTIONS
        .get_key_value(name)
        .map(|(k, v)| (*k, v))
        .ok_or_else(|| ExecError::UnknownSetting(name.to_string()))
}

fn insert_setting<S: SessionSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<MaxQuerySize>(&mut map);
    insert_setting::<MaxParserDepth>(&mut map);
    insert_setting::<MaxAstDepth>(&mut map);
    insert_setting::<MaxAstElements>(&mut map);
    insert_setting::<EnableOptimizer>(&mut map);
    insert_setting::<EnableOptimizerFallback>(&mut map);
    insert_setting::<DistributedPerfectShard>(&mut map);
    insert_setting::<FallbackPerfectShard>(&mut map);
    insert_setting::<EnableDistributedStages>(&mut map);
    insert_setting::<EnableAutoQueryForwarding>(&mut map);
    insert_setting::<UseQueryCache>(&mut map);
    insert_setting::<EnableReadsFromQueryCache>(&mut map);
    insert_setting::<EnableWritesToQueryCache>(&mut map);
    insert_setting::<EnableTransactionalQueryCache>(&mut map);
    insert_setting::<QueryCacheMinQueryRuns>(&mut map);
    insert_setting::<QueryCacheMinQueryDurationMs>(&mut map);
    insert_setting::<QueryCacheTtlSecs>(&mut map);
    insert_setting::<QueryCacheShareBetweenUsers>(&mut map);
    insert_setting::<QueryCacheCompressEntries>(&mut map);
    insert_setting::<QueryCacheSquashPartialResults>(&mut map);
    insert_setting::<QueryCacheStoreNondeterministic>(&mut map);
    insert_setting::<QueryCacheMaxSizeInBytes>(&mut map);
    insert_setting::<QueryCacheMaxEntries>(&mut map);
    insert_setting::<QueryCacheMaxEntrySizeInRows>(&mut map);
    insert_setting::<QueryCacheMaxEntrySizeInBytes>(&mut map);
    insert_setting::<MaxBlockSize>(&mut map);
    insert_setting::<EnableQueryQueue>(&mut map);
    insert_setting::<QueryQueueTimeoutMs>(&mut map);
    insert_setting::<MaxResultRows>(&mut map);
    insert_setting::<MaxResultBytes>(&mut map);
    insert_setting::<ResultOverflowMode>(&mut map);
    insert_setting::<LogQueries>(&mut map);
    insert_setting::<LogQueriesMinType>(&mut map);
    insert_setting::<LogQueriesMinQueryDurationMs>(&mut map);
    insert_setting::<LogQueriesCutToLength>(&mut map);
    insert_setting::<LogComment>(&mut map);
    insert_setting::<ForceCleanTransactionByDm>(&mut map);
    insert_setting::<AsyncPostCommit>(&mut map);
    insert_setting::<AmbiguousErrorWaitTimeoutMs>(&mut map);

    map
});

pub trait SessionSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()>;
    fn get_as_value(conf: &SessionConfig) -> SettingValue;
}

macro_rules! bool_setting {
    ($ty:ident, $field:ident, $desc:expr) => {
        pub struct $ty;

        impl SessionSetting for $ty {
            const NAME: &'static str = stringify!($field);
            const DESCRIPTION: &'static str = $desc;

            fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()> {
                conf.$field = value.try_as_bool(Self::NAME)?;
                Ok(())
            }

            fn get_as_value(conf: &SessionConfig) -> SettingValue {
                conf.$field.into()
            }
        }
    };
}

macro_rules! u64_setting {
    ($ty:ident, $field:ident, $desc:expr) => {
        pub struct $ty;

        impl SessionSetting for $ty {
            const NAME: &'static str = stringify!($field);
            const DESCRIPTION: &'static str = $desc;

            fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()> {
                conf.$field = value.try_as_u64(Self::NAME)?;
                Ok(())
            }

            fn get_as_value(conf: &SessionConfig) -> SettingValue {
                conf.$field.into()
            }
        }
    };
}

u64_setting!(
    MaxQuerySize,
    max_query_size,
    "Maximum size in bytes of client query text parsed by the coordinator"
);
u64_setting!(
    MaxParserDepth,
    max_parser_depth,
    "Maximum recursion depth of the parser"
);
u64_setting!(
    MaxAstDepth,
    max_ast_depth,
    "Maximum depth of a parsed statement, 0 for unlimited"
);
u64_setting!(
    MaxAstElements,
    max_ast_elements,
    "Maximum number of elements in a parsed statement, 0 for unlimited"
);
bool_setting!(
    EnableOptimizer,
    enable_optimizer,
    "Controls if the cost-based optimizer is used"
);
bool_setting!(
    EnableOptimizerFallback,
    enable_optimizer_fallback,
    "Retry once without the optimizer if an optimized plan fails"
);
bool_setting!(
    DistributedPerfectShard,
    distributed_perfect_shard,
    "Execute distributed queries using perfect sharding"
);
bool_setting!(
    FallbackPerfectShard,
    fallback_perfect_shard,
    "Retry once without perfect sharding if a perfect-shard plan fails"
);
bool_setting!(
    EnableDistributedStages,
    enable_distributed_stages,
    "Legacy alias that turns on the optimizer"
);
bool_setting!(
    EnableAutoQueryForwarding,
    enable_auto_query_forwarding,
    "Forward statements to the server owning their tables"
);
bool_setting!(
    UseQueryCache,
    use_query_cache,
    "Enables the query result cache"
);
bool_setting!(
    EnableReadsFromQueryCache,
    enable_reads_from_query_cache,
    "Serve eligible results from the query cache"
);
bool_setting!(
    EnableWritesToQueryCache,
    enable_writes_to_query_cache,
    "Store eligible results in the query cache"
);
bool_setting!(
    EnableTransactionalQueryCache,
    enable_transactional_query_cache,
    "Invalidate cached results using table update timestamps"
);
u64_setting!(
    QueryCacheMinQueryRuns,
    query_cache_min_query_runs,
    "Number of runs a query needs before its result is cached"
);
u64_setting!(
    QueryCacheMinQueryDurationMs,
    query_cache_min_query_duration_ms,
    "Minimum run time in milliseconds before a result is cached"
);
u64_setting!(
    QueryCacheTtlSecs,
    query_cache_ttl_secs,
    "Seconds a cached result stays valid"
);
bool_setting!(
    QueryCacheShareBetweenUsers,
    query_cache_share_between_users,
    "Allow cached results to be read by other users"
);
bool_setting!(
    QueryCacheCompressEntries,
    query_cache_compress_entries,
    "Mark cache entries for compression"
);
bool_setting!(
    QueryCacheSquashPartialResults,
    query_cache_squash_partial_results,
    "Squash partial result blocks into blocks of max_block_size rows"
);
bool_setting!(
    QueryCacheStoreNondeterministic,
    query_cache_store_results_of_queries_with_nondeterministic_functions,
    "Cache results of statements with non-deterministic functions"
);
u64_setting!(
    QueryCacheMaxSizeInBytes,
    query_cache_max_size_in_bytes,
    "Maximum total size of the query cache"
);
u64_setting!(
    QueryCacheMaxEntries,
    query_cache_max_entries,
    "Maximum number of query cache entries"
);
u64_setting!(
    QueryCacheMaxEntrySizeInRows,
    query_cache_max_entry_size_in_rows,
    "Maximum number of rows in a single cache entry"
);
u64_setting!(
    QueryCacheMaxEntrySizeInBytes,
    query_cache_max_entry_size_in_bytes,
    "Maximum number of bytes in a single cache entry"
);
bool_setting!(
    EnableQueryQueue,
    enable_query_queue,
    "Queue statements against their execution group before running"
);
u64_setting!(
    QueryQueueTimeoutMs,
    query_queue_timeout_ms,
    "Milliseconds to wait for admission"
);
u64_setting!(
    MaxResultRows,
    max_result_rows,
    "Maximum result rows, 0 for unlimited"
);
u64_setting!(
    MaxResultBytes,
    max_result_bytes,
    "Maximum result bytes, 0 for unlimited"
);
bool_setting!(
    LogQueries,
    log_queries,
    "Write query log records"
);
u64_setting!(
    LogQueriesMinQueryDurationMs,
    log_queries_min_query_duration_ms,
    "Minimum duration for a query to be logged"
);
u64_setting!(
    LogQueriesCutToLength,
    log_queries_cut_to_length,
    "Truncate logged query text to this many bytes"
);
bool_setting!(
    ForceCleanTransactionByDm,
    force_clean_transaction_by_dm,
    "Let the daemon manager clean up the transaction"
);
bool_setting!(
    AsyncPostCommit,
    async_post_commit,
    "Run post-commit work asynchronously"
);
u64_setting!(
    AmbiguousErrorWaitTimeoutMs,
    ambiguous_error_wait_timeout_ms,
    "Milliseconds to wait for the root cause of an ambiguous distributed error"
);

const MIN_BLOCK_SIZE: u64 = 1;

pub struct MaxBlockSize;

impl SessionSetting for MaxBlockSize {
    const NAME: &'static str = "max_block_size";
    const DESCRIPTION: &'static str = "Target number of rows in a block";

    fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()> {
        let val = value.try_as_u64(Self::NAME)?;
        if val < MIN_BLOCK_SIZE {
            return Err(ExecError::InvalidSetting {
                name: Self::NAME.to_string(),
                reason: format!("Block size cannot be less than {MIN_BLOCK_SIZE}"),
            });
        }
        conf.max_block_size = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> SettingValue {
        conf.max_block_size.into()
    }
}

pub struct ResultOverflowMode;

impl SessionSetting for ResultOverflowMode {
    const NAME: &'static str = "result_overflow_mode";
    const DESCRIPTION: &'static str = "What to do when a result limit is exceeded (throw, break)";

    fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()> {
        let val = value.try_into_string(Self::NAME)?;
        conf.result_overflow_mode = val.parse::<OverflowMode>().map_err(|reason| ExecError::InvalidSetting {
            name: Self::NAME.to_string(),
            reason,
        })?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> SettingValue {
        conf.result_overflow_mode.as_str().into()
    }
}

pub struct LogQueriesMinType;

impl SessionSetting for LogQueriesMinType {
    const NAME: &'static str = "log_queries_min_type";
    const DESCRIPTION: &'static str = "Minimum query log record type to write";

    fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()> {
        let val = value.try_into_string(Self::NAME)?;
        conf.log_queries_min_type = val.parse::<QueryLogType>().map_err(|reason| ExecError::InvalidSetting {
            name: Self::NAME.to_string(),
            reason,
        })?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> SettingValue {
        conf.log_queries_min_type.as_str().into()
    }
}

pub struct LogComment;

impl SessionSetting for LogComment {
    const NAME: &'static str = "log_comment";
    const DESCRIPTION: &'static str = "Comment attached to query log records";

    fn set_from_value(value: SettingValue, conf: &mut SessionConfig) -> Result<()> {
        conf.log_comment = value.try_into_string(Self::NAME)?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> SettingValue {
        conf.log_comment.clone().into()
    }
}

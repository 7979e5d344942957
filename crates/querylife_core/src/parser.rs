use querylife_error::Result;

use crate::statement::Statement;

/// Limits enforced while parsing client text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Maximum number of bytes parsed, 0 for unlimited.
    pub max_query_size: u64,
    pub max_parser_depth: u64,
}

pub trait Parser: Sync + Send {
    /// Parse a single statement.
    ///
    /// Text beyond `max_query_size` is only allowed for INSERT with inline
    /// data, in which case the parsed statement has `has_tail` set and the
    /// remainder is passed to the engine as embedded data.
    fn parse(&self, text: &str, limits: ParseLimits) -> Result<Statement>;
}

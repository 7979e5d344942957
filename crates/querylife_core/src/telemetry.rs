//! Query log records, spans and profile counters.
//!
//! Emission is best effort. A failing sink is logged and otherwise ignored,
//! it never prevents a query from being finalized.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use querylife_error::{ExecError, Result, internal};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::context::ClientInfo;

/// Type of a query log record.
///
/// Ordered, `log_queries_min_type` filters out records of a lower type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QueryLogType {
    QueryStart = 1,
    QueryFinish = 2,
    ExceptionBeforeStart = 3,
    ExceptionWhileProcessing = 4,
}

impl QueryLogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryStart => "QueryStart",
            Self::QueryFinish => "QueryFinish",
            Self::ExceptionBeforeStart => "ExceptionBeforeStart",
            Self::ExceptionWhileProcessing => "ExceptionWhileProcessing",
        }
    }
}

impl fmt::Display for QueryLogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueryLogType {
    type Err = String;

    /// Accepts both `QueryFinish` and `query_finish` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "querystart" => Ok(Self::QueryStart),
            "queryfinish" => Ok(Self::QueryFinish),
            "exceptionbeforestart" => Ok(Self::ExceptionBeforeStart),
            "exceptionwhileprocessing" => Ok(Self::ExceptionWhileProcessing),
            _ => Err(format!("unknown query log type '{s}'")),
        }
    }
}

/// A single record of the query log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLogElement {
    #[serde(rename = "type")]
    pub log_type: QueryLogType,
    pub event_time: DateTime<Utc>,
    pub query_start_time: DateTime<Utc>,
    pub query_duration_ms: u64,

    pub query_id: String,
    pub initial_query_id: String,
    pub user: String,
    pub client_address: String,
    pub current_database: String,
    pub query: String,
    pub normalized_query_hash: u64,
    pub query_kind: &'static str,
    pub is_internal: bool,

    pub read_rows: u64,
    pub read_bytes: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
    pub result_rows: u64,
    pub result_bytes: u64,
    pub peak_memory_usage: u64,

    /// Zero when the query didn't fail.
    pub exception_code: u32,
    pub exception: Option<String>,

    pub log_comment: String,
    pub served_from_cache: bool,
    /// The query was retried after an optimizer or perfect-shard failure.
    pub fallback: bool,
    pub txn_id: Option<u64>,
}

/// Hash of the query text used to group similar queries in the log.
pub fn normalized_query_hash(query: &str) -> u64 {
    let digest = md5::compute(query.as_bytes());
    let mut buf = [0; 8];
    buf.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(buf)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub trace_id: Uuid,
    pub span_id: u64,
    pub parent_span_id: u64,
    pub operation_name: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub attributes: Vec<(String, String)>,
}

impl SpanRecord {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileEvent {
    FailedQuery,
    FailedSelectQuery,
    FailedInsertQuery,
    QueryTimeMicroseconds,
    SelectQueryTimeMicroseconds,
    InsertQueryTimeMicroseconds,
    QueryMaskingRulesMatch,
}

impl ProfileEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedQuery => "FailedQuery",
            Self::FailedSelectQuery => "FailedSelectQuery",
            Self::FailedInsertQuery => "FailedInsertQuery",
            Self::QueryTimeMicroseconds => "QueryTimeMicroseconds",
            Self::SelectQueryTimeMicroseconds => "SelectQueryTimeMicroseconds",
            Self::InsertQueryTimeMicroseconds => "InsertQueryTimeMicroseconds",
            Self::QueryMaskingRulesMatch => "QueryMaskingRulesMatch",
        }
    }
}

/// Destination for query logs, spans and profile counters.
pub trait TelemetrySink: Sync + Send {
    fn add_query_log(&self, elem: &QueryLogElement) -> Result<()>;
    fn add_span(&self, span: &SpanRecord) -> Result<()>;
    fn increment(&self, event: ProfileEvent, amount: u64);
}

/// Telemetry sink writing json records through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn add_query_log(&self, elem: &QueryLogElement) -> Result<()> {
        let record = serde_json::to_string(elem)
            .map_err(|e| internal!("failed to serialize query log record: {e}"))?;
        info!(target: "query_log", query_id = %elem.query_id, %record);
        Ok(())
    }

    fn add_span(&self, span: &SpanRecord) -> Result<()> {
        let record = serde_json::to_string(span)
            .map_err(|e| internal!("failed to serialize span: {e}"))?;
        debug!(target: "query_span", trace_id = %span.trace_id, %record);
        Ok(())
    }

    fn increment(&self, event: ProfileEvent, amount: u64) {
        trace!(target: "profile_events", event = event.as_str(), amount);
    }
}

/// Hides sensitive data in query text.
pub trait DataMasker: Sync + Send {
    /// Mask the text in place, returning the number of matches.
    fn mask(&self, text: &mut String) -> usize;
}

#[derive(Debug)]
struct MaskingRule {
    name: String,
    regex: Regex,
    replacement: String,
}

/// Data masker applying a list of regex replacement rules in order.
#[derive(Debug, Default)]
pub struct RegexDataMasker {
    rules: Vec<MaskingRule>,
}

impl RegexDataMasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, name: &str, pattern: &str, replacement: &str) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| ExecError::InvalidSetting {
            name: format!("masking rule '{name}'"),
            reason: e.to_string(),
        })?;
        self.rules.push(MaskingRule {
            name: name.to_string(),
            regex,
            replacement: replacement.to_string(),
        });
        Ok(())
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }
}

impl DataMasker for RegexDataMasker {
    fn mask(&self, text: &mut String) -> usize {
        let mut matches = 0;
        for rule in &self.rules {
            let n = rule.regex.find_iter(text).count();
            if n == 0 {
                continue;
            }
            trace!(rule = %rule.name, matches = n, "masking query text");
            *text = rule
                .regex
                .replace_all(text, rule.replacement.as_str())
                .into_owned();
            matches += n;
        }
        matches
    }
}

/// Mask sensitive data, then cut the text to `max_len` bytes.
///
/// Masking happens first so that a cut never leaves a partially masked
/// value behind.
pub fn prepare_query_for_logging(
    query: &str,
    max_len: u64,
    masker: Option<&dyn DataMasker>,
    sink: &dyn TelemetrySink,
) -> String {
    let mut res = query.to_string();

    if let Some(masker) = masker {
        let matches = masker.mask(&mut res);
        if matches > 0 {
            sink.increment(ProfileEvent::QueryMaskingRulesMatch, matches as u64);
        }
    }

    cut_to_length(&mut res, max_len);
    res
}

/// Longest prefix of at most `max_len` bytes that ends on a character.
pub fn char_prefix(s: &str, max_len: u64) -> &str {
    let max_len = usize::try_from(max_len).unwrap_or(usize::MAX);
    if s.len() <= max_len {
        return s;
    }
    let mut idx = max_len;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

/// Truncate to at most `max_len` bytes without splitting a character.
fn cut_to_length(s: &mut String, max_len: u64) {
    let len = char_prefix(s, max_len).len();
    s.truncate(len);
}

/// Text log line announcing a query.
///
/// `log_comment` is cut to `max_query_size` bytes, zero leaves it whole.
pub fn query_log_line(
    query: &str,
    client: &ClientInfo,
    log_comment: &str,
    max_query_size: u64,
    internal: bool,
) -> String {
    if internal {
        return format!("(internal) {}", join_lines(query));
    }

    let mut line = format!("(from {}", client.address);
    if client.user != "default" {
        line.push_str(", user: ");
        line.push_str(&client.user);
    }
    if !client.initial_query_id.is_empty() && client.initial_query_id != client.query_id {
        line.push_str(", initial_query_id: ");
        line.push_str(&client.initial_query_id);
    }
    line.push(')');

    let comment = if max_query_size != 0 {
        char_prefix(log_comment, max_query_size)
    } else {
        log_comment
    };
    if !comment.is_empty() {
        line.push_str(" (comment: ");
        line.push_str(comment);
        line.push(')');
    }

    line.push(' ');
    line.push_str(&join_lines(query));
    line
}

/// Join a multi-line query into a single line for the text log.
///
/// Whitespace runs collapse into a single space. Quoted literals are kept
/// as is, and the newline ending a `--` comment is preserved.
pub fn join_lines(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    out.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            c if c.is_whitespace() => {
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
                out.push(' ');
            }
            c => out.push(c),
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncQueryStatus {
    Running,
    Finished,
    Failed { message: String },
}

/// Status records of queries executed asynchronously.
pub trait AsyncStatusStore: Sync + Send {
    fn update(&self, async_query_id: &str, status: AsyncQueryStatus) -> Result<()>;
}

//! Keyword parser understanding just enough SQL to classify statements.

use querylife_error::{ExecError, Result, SizeLimit};

use crate::config::SettingValue;
use crate::parser::{ParseLimits, Parser};
use crate::statement::{
    AlterCommand,
    AlterCommandKind,
    DropKind,
    ExplainKind,
    Statement,
    StatementKind,
    SystemKind,
    TableRef,
};

/// Functions whose results differ between runs.
const NONDETERMINISTIC_FUNCTIONS: &[&str] = &["now(", "rand(", "random(", "uuid("];

#[derive(Debug, Default)]
pub struct KeywordParser;

impl KeywordParser {
    pub fn new() -> Self {
        KeywordParser
    }
}

impl Parser for KeywordParser {
    fn parse(&self, text: &str, limits: ParseLimits) -> Result<Statement> {
        let (body, settings) = split_settings(text)?;
        let words: Vec<&str> = body.split_whitespace().collect();
        if words.is_empty() {
            return Err(ExecError::Parse("empty query".to_string()));
        }

        let kind = classify(&words)?;

        let mut has_tail = false;
        let max_size = usize::try_from(limits.max_query_size).unwrap_or(usize::MAX);
        if limits.max_query_size != 0 && text.len() > max_size {
            // Only inline INSERT data may extend past the limit.
            let is_inline_insert =
                matches!(kind, StatementKind::Insert { select: false, .. }) && body.contains('(');
            if !is_inline_insert {
                return Err(ExecError::SizeLimitExceeded {
                    what: SizeLimit::QuerySize,
                    limit: limits.max_query_size,
                    actual: text.len() as u64,
                });
            }
            has_tail = true;
        }

        let depth = nesting_depth(body);
        if limits.max_parser_depth != 0 && depth > limits.max_parser_depth {
            return Err(ExecError::SizeLimitExceeded {
                what: SizeLimit::ParserDepth,
                limit: limits.max_parser_depth,
                actual: depth,
            });
        }

        let lower = body.to_ascii_lowercase();
        let stmt_text = match kind {
            StatementKind::Insert { select: false, .. } => without_inline_data(text),
            _ => text,
        };
        let mut stmt = Statement::new(kind, stmt_text);
        stmt.normalized = words.join(" ");
        stmt.settings = settings;
        stmt.deterministic = !NONDETERMINISTIC_FUNCTIONS
            .iter()
            .any(|f| lower.contains(f));
        stmt.depth = depth;
        stmt.elements = words.len() as u64;
        stmt.has_tail = has_tail;

        Ok(stmt)
    }
}

/// INSERT text up to and including the `VALUES` keyword.
fn without_inline_data(text: &str) -> &str {
    let upper = text.to_ascii_uppercase();
    let mut from = 0;
    while let Some(idx) = upper[from..].find("VALUES") {
        let start = from + idx;
        let end = start + "VALUES".len();
        let word_start = start == 0 || upper.as_bytes()[start - 1].is_ascii_whitespace();
        let word_end = upper[end..]
            .chars()
            .next()
            .is_none_or(|c| c.is_ascii_whitespace() || c == '(');
        if word_start && word_end {
            return &text[..end];
        }
        from = end;
    }
    text
}

fn nesting_depth(text: &str) -> u64 {
    let mut depth = 1u64;
    let mut max = 1u64;
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' => depth = depth.saturating_sub(1).max(1),
            _ => (),
        }
    }
    max
}

/// Split a trailing `SETTINGS a = 1, b = 'x'` clause from the statement.
fn split_settings(text: &str) -> Result<(&str, Vec<(String, SettingValue)>)> {
    let upper = text.to_ascii_uppercase();
    let Some(idx) = upper.rfind(" SETTINGS ") else {
        return Ok((text, Vec::new()));
    };

    let clause = &text[idx + " SETTINGS ".len()..];
    let mut settings = Vec::new();
    for item in clause.split(',') {
        let Some((name, value)) = item.split_once('=') else {
            return Err(ExecError::Parse(format!("invalid setting: '{}'", item.trim())));
        };
        settings.push((name.trim().to_string(), setting_value(value.trim())));
    }

    Ok((&text[..idx], settings))
}

fn setting_value(s: &str) -> SettingValue {
    if let Ok(v) = s.parse::<u64>() {
        return SettingValue::UInt64(v);
    }
    if let Ok(v) = s.parse::<i64>() {
        return SettingValue::Int64(v);
    }
    match s.to_ascii_lowercase().as_str() {
        "true" => SettingValue::Bool(true),
        "false" => SettingValue::Bool(false),
        _ => SettingValue::Utf8(s.trim_matches('\'').to_string()),
    }
}

fn table_ref(word: &str) -> TableRef {
    let word = word.trim_end_matches(|c: char| c == ';' || c == '(');
    match word.split_once('.') {
        Some((db, table)) => TableRef::new(Some(db), table),
        None => TableRef::new(None, word),
    }
}

/// Word following `keyword`, compared case-insensitively.
fn word_after<'a>(words: &[&'a str], keyword: &str) -> Option<&'a str> {
    let idx = words.iter().position(|w| w.eq_ignore_ascii_case(keyword))?;
    words.get(idx + 1).copied()
}

fn has_word(words: &[&str], keyword: &str) -> bool {
    words.iter().any(|w| w.eq_ignore_ascii_case(keyword))
}

fn required_table(words: &[&str], keyword: &str) -> Result<TableRef> {
    word_after(words, keyword)
        .map(table_ref)
        .ok_or_else(|| ExecError::Parse(format!("expected table after {keyword}")))
}

fn classify(words: &[&str]) -> Result<StatementKind> {
    let first = words[0].to_ascii_uppercase();
    let kind = match first.as_str() {
        "SELECT" | "WITH" => {
            if has_word(words, "UNION") {
                StatementKind::SelectUnion
            } else {
                StatementKind::Select
            }
        }
        "INSERT" => {
            let table = word_after(words, "INTO")
                .filter(|w| !w.eq_ignore_ascii_case("FUNCTION"))
                .map(table_ref);
            StatementKind::Insert {
                table,
                select: has_word(words, "SELECT"),
            }
        }
        "DELETE" => StatementKind::Delete {
            table: required_table(words, "FROM")?,
        },
        "UPDATE" => StatementKind::Update {
            table: table_ref(words.get(1).copied().unwrap_or_default()),
        },
        "CREATE" => StatementKind::Create,
        "DROP" => StatementKind::Drop(DropKind::Drop),
        "DETACH" => StatementKind::Drop(DropKind::Detach),
        "TRUNCATE" => StatementKind::Drop(DropKind::Truncate),
        "RENAME" => StatementKind::Rename,
        "ALTER" => StatementKind::Alter {
            table: required_table(words, "TABLE")?,
            commands: vec![alter_command(words)],
        },
        "SYSTEM" => {
            if words
                .get(1)
                .is_some_and(|w| w.eq_ignore_ascii_case("DEDUP"))
            {
                StatementKind::System {
                    kind: SystemKind::Dedup,
                    table: words.get(2).copied().map(table_ref),
                }
            } else {
                StatementKind::System {
                    kind: SystemKind::Other,
                    table: None,
                }
            }
        }
        "EXPLAIN" => {
            let kind = match words.get(1).map(|w| w.to_ascii_uppercase()).as_deref() {
                Some("AST") => ExplainKind::Ast,
                Some("PIPELINE") => ExplainKind::Pipeline,
                Some("ANALYZE") => ExplainKind::Analyze,
                _ => ExplainKind::Plan,
            };
            StatementKind::Explain(kind)
        }
        "SHOW" if has_word(words, "PROCESSLIST") => StatementKind::ShowProcesslist,
        "BEGIN" => StatementKind::Begin,
        "COMMIT" => StatementKind::Commit,
        "ROLLBACK" => StatementKind::Rollback,
        "SET" => StatementKind::Set,
        "SHOW" | "DESCRIBE" | "USE" => StatementKind::Other,
        other => return Err(ExecError::Parse(format!("unexpected keyword: {other}"))),
    };
    Ok(kind)
}

fn alter_command(words: &[&str]) -> AlterCommand {
    // ALTER TABLE t <command ...>
    let rest: Vec<String> = words
        .iter()
        .skip(3)
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let rest: Vec<&str> = rest.iter().map(|s| s.as_str()).collect();

    let mut cmd = match rest.as_slice() {
        ["ATTACH", ..] => AlterCommand::new(AlterCommandKind::AttachPartition),
        ["DROP", "PARTITION", "WHERE", ..] => {
            AlterCommand::new(AlterCommandKind::DropPartitionWhere)
        }
        ["DROP", "PARTITION", ..] => AlterCommand::new(AlterCommandKind::DropPartition),
        ["DETACH", "PARTITION", "WHERE", ..] => {
            let mut cmd = AlterCommand::new(AlterCommandKind::DropPartitionWhere);
            cmd.detach = true;
            cmd
        }
        ["DETACH", "PARTITION", ..] => {
            let mut cmd = AlterCommand::new(AlterCommandKind::DropPartition);
            cmd.detach = true;
            cmd
        }
        ["ADD", "COLUMN", ..] => AlterCommand::new(AlterCommandKind::AddColumn),
        ["DROP", "COLUMN", ..] => AlterCommand::new(AlterCommandKind::DropColumn),
        ["MODIFY", "COLUMN", ..] => AlterCommand::new(AlterCommandKind::ModifyColumn),
        ["MODIFY", "SETTING", ..] => AlterCommand::new(AlterCommandKind::ModifySetting),
        _ => AlterCommand::new(AlterCommandKind::Other),
    };

    if cmd.kind == AlterCommandKind::AttachPartition {
        cmd.parts = rest.get(1) == Some(&"PARTS");
        cmd.from_detached = rest.windows(2).any(|w| w == ["FROM", "DETACHED"]);
    }
    cmd
}

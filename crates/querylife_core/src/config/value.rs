use std::fmt;

use querylife_error::{ExecError, Result};

/// Value of a single setting, as it appears in a SETTINGS clause or an
/// override table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    UInt64(u64),
    Int64(i64),
    Utf8(String),
}

impl SettingValue {
    /// Interpret as a bool. Integers 0/1 and the strings "true"/"false"/"0"/"1"
    /// are accepted.
    pub fn try_as_bool(&self, name: &str) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::UInt64(0) | Self::Int64(0) => Ok(false),
            Self::UInt64(1) | Self::Int64(1) => Ok(true),
            Self::Utf8(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(invalid(name, format!("cannot interpret '{s}' as a bool"))),
            },
            other => Err(invalid(name, format!("cannot interpret {other} as a bool"))),
        }
    }

    pub fn try_as_u64(&self, name: &str) -> Result<u64> {
        match self {
            Self::Bool(b) => Ok(*b as u64),
            Self::UInt64(v) => Ok(*v),
            Self::Int64(v) => {
                u64::try_from(*v).map_err(|_| invalid(name, format!("{v} is negative")))
            }
            Self::Utf8(s) => s
                .parse::<u64>()
                .map_err(|_| invalid(name, format!("cannot interpret '{s}' as an integer"))),
        }
    }

    pub fn try_into_string(self, name: &str) -> Result<String> {
        match self {
            Self::Utf8(s) => Ok(s),
            other => Err(invalid(name, format!("expected a string, got {other}"))),
        }
    }
}

fn invalid(name: &str, reason: String) -> ExecError {
    ExecError::InvalidSetting {
        name: name.to_string(),
        reason,
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for SettingValue {
    fn from(value: u64) -> Self {
        Self::UInt64(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_from_int_and_string() {
        assert!(SettingValue::UInt64(1).try_as_bool("a").unwrap());
        assert!(!SettingValue::from("FALSE").try_as_bool("a").unwrap());
        SettingValue::UInt64(2).try_as_bool("a").unwrap_err();
    }

    #[test]
    fn negative_is_not_u64() {
        let err = SettingValue::Int64(-1).try_as_u64("max_result_rows").unwrap_err();
        assert!(matches!(err, ExecError::InvalidSetting { name, .. } if name == "max_result_rows"));
    }
}

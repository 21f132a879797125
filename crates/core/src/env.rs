//! Environment-variable helpers shared by every `from_env` constructor.

use std::str::FromStr;

use crate::error::CoreError;

/// Read `key` and parse it, falling back to `default` when unset.
///
/// A present but unparseable value is an error rather than a silent
/// fallback, so typos in deployment config surface at startup.
pub fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, CoreError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            CoreError::Validation(format!("{key} has an invalid value: {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}

/// Read a boolean flag. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn flag_or(key: &str, default: bool) -> Result<bool, CoreError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(CoreError::Validation(format!(
                "{key} must be a boolean, got {raw:?}"
            ))),
        },
        Err(_) => Ok(default),
    }
}

/// Read a string, falling back to `default` when unset.
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable name; the process environment is shared.

    #[test]
    fn parse_or_falls_back_when_unset() {
        let value: u64 = parse_or("REALTYOPS_TEST_UNSET_U64", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_or_rejects_garbage() {
        std::env::set_var("REALTYOPS_TEST_BAD_U64", "forty");
        let result: Result<u64, _> = parse_or("REALTYOPS_TEST_BAD_U64", 1);
        assert!(result.is_err());
    }

    #[test]
    fn parse_or_trims_whitespace() {
        std::env::set_var("REALTYOPS_TEST_PADDED_U64", " 7 ");
        let value: u64 = parse_or("REALTYOPS_TEST_PADDED_U64", 1).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn flag_or_accepts_common_spellings() {
        std::env::set_var("REALTYOPS_TEST_FLAG_ON", "Yes");
        std::env::set_var("REALTYOPS_TEST_FLAG_OFF", "0");
        assert!(flag_or("REALTYOPS_TEST_FLAG_ON", false).unwrap());
        assert!(!flag_or("REALTYOPS_TEST_FLAG_OFF", true).unwrap());
        assert!(flag_or("REALTYOPS_TEST_FLAG_UNSET", true).unwrap());
    }

    #[test]
    fn flag_or_rejects_unknown_words() {
        std::env::set_var("REALTYOPS_TEST_FLAG_BAD", "maybe");
        assert!(flag_or("REALTYOPS_TEST_FLAG_BAD", false).is_err());
    }
}

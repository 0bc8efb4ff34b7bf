//! Environment variable lookup and parsing.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  /// A variable was set but could not be parsed.
  #[error("invalid value for {key}: '{value}' ({message})")]
  Invalid {
    key: String,
    value: String,
    message: String,
  },
}

/// Source of configuration variables.
///
/// The process environment is the normal source; tests pass a `HashMap`.
pub trait EnvLookup {
  fn get(&self, key: &str) -> Option<String>;
}

/// Reads from `std::env`.
pub(crate) struct ProcessEnv;

impl EnvLookup for ProcessEnv {
  fn get(&self, key: &str) -> Option<String> {
    std::env::var(key).ok()
  }
}

impl EnvLookup for HashMap<String, String> {
  fn get(&self, key: &str) -> Option<String> {
    HashMap::get(self, key).cloned()
  }
}

/// Parse `key` if set, otherwise return `default`.
pub(crate) fn parse_or<T>(lookup: &dyn EnvLookup, key: &str, default: T) -> Result<T, ConfigError>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match lookup.get(key) {
    Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
      key: key.to_string(),
      value: raw.clone(),
      message: e.to_string(),
    }),
    None => Ok(default),
  }
}

/// Parse a boolean flag. Accepts `1/0`, `true/false`, `yes/no`.
pub(crate) fn flag_or(lookup: &dyn EnvLookup, key: &str, default: bool) -> Result<bool, ConfigError> {
  match lookup.get(key) {
    Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
      "1" | "true" | "yes" => Ok(true),
      "0" | "false" | "no" => Ok(false),
      _ => Err(ConfigError::Invalid {
        key: key.to_string(),
        value: raw,
        message: "expected a boolean".to_string(),
      }),
    },
    None => Ok(default),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_flag_or_accepts_common_spellings() {
    let vars = HashMap::from([
      ("A".to_string(), "yes".to_string()),
      ("B".to_string(), "0".to_string()),
    ]);
    assert!(flag_or(&vars, "A", false).unwrap());
    assert!(!flag_or(&vars, "B", true).unwrap());
    assert!(flag_or(&vars, "C", true).unwrap());
  }

  #[test]
  fn test_parse_or_trims_whitespace() {
    let vars = HashMap::from([("N".to_string(), " 42 ".to_string())]);
    let n: u64 = parse_or(&vars, "N", 0).unwrap();
    assert_eq!(n, 42);
  }
}

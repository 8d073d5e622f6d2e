//! A flat string-to-string settings store with typed getters. Not core to
//! the runtime; the dispatcher reads spin limits and queue sizes through
//! it, and nothing else in this crate stack depends on it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Errors loading a settings file. Malformed *values* for a typed getter
/// are not part of this enum: per the store's contract, those are
/// programming/config errors and panic instead of returning a `Result`.
#[derive(Debug)]
pub enum Error {
    Read(std::io::Error),
    Parse(toml::de::Error),
    NotATable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Read(e) => write!(f, "failed to read settings file: {e}"),
            Error::Parse(e) => write!(f, "failed to parse settings file: {e}"),
            Error::NotATable => write!(f, "settings file must be a table of scalar values"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Read(e) => Some(e),
            Error::Parse(e) => Some(e),
            Error::NotATable => None,
        }
    }
}

/// A flat key-value store. Every value is kept as its string form; typed
/// getters parse on read.
#[derive(Debug, Default, Clone)]
pub struct Settings {
    values: HashMap<String, String>,
}

fn scalar_to_string(key: &str, value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(dt) => dt.to_string(),
        toml::Value::Array(_) | toml::Value::Table(_) => {
            panic!("settings key {key:?} must be a scalar value, not an array or table")
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse top-level scalar entries of a TOML document into the store.
    /// Nested tables and arrays are rejected: this store is deliberately
    /// flat.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let root: toml::Value = toml::from_str(text).map_err(Error::Parse)?;
        let toml::Value::Table(table) = root else {
            return Err(Error::NotATable);
        };
        let mut values = HashMap::with_capacity(table.len());
        for (key, value) in table {
            let value = scalar_to_string(&key, value);
            values.insert(key, value);
        }
        Ok(Self { values })
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(Error::Read)?;
        Self::from_toml_str(&text)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns `default` if `key` is absent. Panics if present but not a
    /// valid `bool` ("true"/"false").
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            None => default,
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| panic!("settings key {key:?} = {raw:?} is not a valid bool")),
        }
    }

    /// Returns `default` if `key` is absent. Panics if present but not a
    /// valid `u32`.
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        match self.values.get(key) {
            None => default,
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| panic!("settings key {key:?} = {raw:?} is not a valid u32")),
        }
    }

    /// Returns `default` if `key` is absent. Panics if present but not a
    /// valid `u64`.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.values.get(key) {
            None => default,
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| panic!("settings key {key:?} = {raw:?} is not a valid u64")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_entries_from_a_flat_document() {
        let settings = Settings::from_toml_str(
            r#"
            nlisteners = 4
            dispatch_queue_size = 256
            lock_spin_limit = 32
            enable_metrics = false
            name = "primary"
            "#,
        )
        .unwrap();

        assert_eq!(settings.get_u32("nlisteners", 0), 4);
        assert_eq!(settings.get_u64("dispatch_queue_size", 0), 256);
        assert!(!settings.get_bool("enable_metrics", true));
        assert_eq!(settings.get_str("name"), Some("primary"));
    }

    #[test]
    fn missing_key_falls_back_to_default() {
        let settings = Settings::new();
        assert_eq!(settings.get_u32("nlisteners", 8), 8);
        assert!(settings.get_bool("missing", true));
    }

    #[test]
    #[should_panic(expected = "is not a valid u32")]
    fn ill_formed_typed_value_panics() {
        let mut settings = Settings::new();
        settings.set("nlisteners", "not-a-number");
        settings.get_u32("nlisteners", 0);
    }

    #[test]
    #[should_panic(expected = "must be a scalar value")]
    fn nested_table_is_rejected() {
        let _ = Settings::from_toml_str("[nested]\nfoo = 1\n");
    }

    #[test]
    fn set_overrides_a_loaded_value() {
        let mut settings = Settings::from_toml_str("lock_spin_limit = 32\n").unwrap();
        assert_eq!(settings.get_u32("lock_spin_limit", 0), 32);
        settings.set("lock_spin_limit", "64");
        assert_eq!(settings.get_u32("lock_spin_limit", 0), 64);
    }
}

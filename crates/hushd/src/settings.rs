//! JSON settings file used as the primary configuration tier.

use std::path::PathBuf;

use hush_silences::{Result, SettingsSource, SilenceError};
use serde_json::Value;

/// Reads a flat JSON object such as `{"store_timeout": "2s", "bulk_limit": 500}`.
///
/// The file is read on every lookup, so a missing or broken file only
/// demotes that lookup to the next tier.
#[derive(Debug, Clone)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    /// Creates a source backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsSource for JsonFileSettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let raw = std::fs::read_to_string(&self.path)?;
        let doc: Value = serde_json::from_str(&raw)?;
        let Some(object) = doc.as_object() else {
            return Err(SilenceError::Config {
                key: self.path.display().to_string(),
                reason: "settings file must contain a JSON object".to_string(),
            });
        };

        Ok(object.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }))
    }
}

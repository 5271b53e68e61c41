//! Persisted plugin metadata

use serde::{Deserialize, Serialize};

/// Lifecycle state of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Loaded and registered.
    Active,
    /// Installed but not (yet) registered.
    #[default]
    Inactive,
    /// Registration or execution failed; see `message`.
    Error,
}

/// One row of the plugin metadata store, keyed by `id`.
///
/// The id must begin with a handler prefix (e.g. `openlist.driver.`) so the
/// registry can route it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default)]
    pub source_url: String,
    pub wasm_path: std::path::PathBuf,
    #[serde(default)]
    pub status: PluginStatus,
    #[serde(default)]
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// `plugin.json` as shipped inside a plugin archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: String,
}

impl PluginManifest {
    /// A manifest is usable only with the identifying fields present.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() || self.name.is_empty() || self.version.is_empty() {
            return Err("plugin manifest is missing required fields (id, name, version)".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&PluginStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::from_str::<PluginStatus>("\"error\"").unwrap(),
            PluginStatus::Error
        );
    }

    #[test]
    fn manifest_requires_identity() {
        let manifest: PluginManifest = serde_json::from_str(r#"{"id":"openlist.driver.demo"}"#).unwrap();
        assert!(manifest.validate().is_err());

        let manifest: PluginManifest = serde_json::from_str(
            r#"{"id":"openlist.driver.demo","name":"Demo","version":"0.1.0"}"#,
        )
        .unwrap();
        assert!(manifest.validate().is_ok());
    }
}

//! Object model shared by all storage drivers

use crate::hash::HashInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in a storage backend: a file or a folder.
///
/// Drivers return objects fully resolved; the `path` is absolute within the
/// storage root. `extra` carries driver-specific metadata that upper layers
/// pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub path: String,
    pub id: String,
    pub name: String,
    pub size: u64,
    pub is_folder: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub hashes: HashInfo,
    #[serde(default)]
    pub extra: Vec<(String, String)>,
}

impl Object {
    /// Root folder placeholder used when a driver exposes no richer root.
    pub fn root() -> Self {
        Self {
            path: "/".to_string(),
            name: "root".to_string(),
            is_folder: true,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_folder
    }

    /// Creation time, falling back to the modification time when the backend
    /// does not report one.
    pub fn create_time(&self) -> Option<DateTime<Utc>> {
        self.created.or(self.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_time_falls_back_to_modified() {
        let modified = Some(Utc::now());
        let obj = Object {
            modified,
            ..Default::default()
        };
        assert_eq!(obj.create_time(), modified);

        let created = Some(Utc::now());
        let obj = Object {
            created,
            modified,
            ..Default::default()
        };
        assert_eq!(obj.create_time(), created);
    }
}

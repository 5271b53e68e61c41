//! Plugin metadata persistence

use anyhow::Result;
use async_trait::async_trait;
use openlist_types::{PluginRecord, PluginStatus};
use std::collections::HashMap;
use std::path::PathBuf;

/// Durable store for [`PluginRecord`] rows, keyed by plugin id.
#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PluginRecord>>;

    /// Insert or replace a record.
    async fn save(&self, record: &PluginRecord) -> Result<()>;

    /// Update status and message of an existing record; unknown ids are
    /// ignored.
    async fn update_status(
        &self,
        id: &str,
        status: PluginStatus,
        message: &str,
    ) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// File-backed store keeping all records in one JSON document.
pub struct JsonPluginStore {
    path: PathBuf,
    state: tokio::sync::Mutex<HashMap<String, PluginRecord>>,
}

impl JsonPluginStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = HashMap::new();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let data = tokio::fs::read_to_string(&path).await?;
            let records: Vec<PluginRecord> = serde_json::from_str(&data)?;
            for record in records {
                state.insert(record.id.clone(), record);
            }
        }
        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    async fn persist(&self, state: &HashMap<String, PluginRecord>) -> Result<()> {
        let mut records: Vec<&PluginRecord> = state.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let data = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl PluginStore for JsonPluginStore {
    async fn load_all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.state.lock().await.values().cloned().collect())
    }

    async fn save(&self, record: &PluginRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(record.id.clone(), record.clone());
        self.persist(&state).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: PluginStatus,
        message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.get_mut(id) {
            record.status = status;
            record.message = message.to_string();
            record.updated_at = chrono::Utc::now();
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.remove(id).is_some() {
            self.persist(&state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PluginRecord {
        let now = chrono::Utc::now();
        PluginRecord {
            id: id.to_string(),
            name: "Demo".into(),
            version: "0.1.0".into(),
            author: "a".into(),
            description: String::new(),
            icon_url: String::new(),
            source_url: String::new(),
            wasm_path: PathBuf::from("/tmp/demo.wasm"),
            status: PluginStatus::Inactive,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn round_trips_records_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");

        let store = JsonPluginStore::open(&path).await.unwrap();
        store.save(&record("openlist.driver.demo")).await.unwrap();
        store
            .update_status("openlist.driver.demo", PluginStatus::Active, "")
            .await
            .unwrap();

        let reopened = JsonPluginStore::open(&path).await.unwrap();
        let records = reopened.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PluginStatus::Active);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");

        let store = JsonPluginStore::open(&path).await.unwrap();
        store.save(&record("openlist.driver.demo")).await.unwrap();
        store.delete("openlist.driver.demo").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        let reopened = JsonPluginStore::open(&path).await.unwrap();
        assert!(reopened.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_status_ignores_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPluginStore::open(dir.path().join("plugins.json"))
            .await
            .unwrap();
        store
            .update_status("missing", PluginStatus::Error, "boom")
            .await
            .unwrap();
    }
}

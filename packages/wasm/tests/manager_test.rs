//! Integration tests for the plugin manager lifecycle
//!
//! These drive install/uninstall/restart against a mock handler so no wasm
//! module is needed.

use async_trait::async_trait;
use openlist_types::PluginStatus;
use openlist_wasm::manager::Manager;
use openlist_wasm::registry::{PluginHandler, PluginInfo};
use openlist_wasm::store::{JsonPluginStore, PluginStore};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct MockHandler {
    fail_with: Option<String>,
    registered: AtomicUsize,
    unregistered: AtomicUsize,
}

impl MockHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_with: None,
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message.to_string()),
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PluginHandler for MockHandler {
    fn prefix(&self) -> &str {
        "openlist.driver."
    }

    async fn register(&self, _info: &mut PluginInfo) -> anyhow::Result<()> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{message}");
        }
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unregister(&self, _info: &mut PluginInfo) -> anyhow::Result<()> {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn write_demo_plugin(dir: &Path) -> String {
    let manifest_path = dir.join("demo.json");
    tokio::fs::write(
        &manifest_path,
        br#"{"id":"openlist.driver.demo","name":"Demo","version":"0.1.0","author":"a"}"#,
    )
    .await
    .unwrap();
    tokio::fs::write(dir.join("demo.wasm"), b"\0asm\x0d\0\x01\0")
        .await
        .unwrap();
    manifest_path.display().to_string()
}

async fn fresh_manager(
    data_dir: &Path,
    handler: Arc<MockHandler>,
) -> (Arc<Manager>, Arc<dyn PluginStore>) {
    let store: Arc<dyn PluginStore> = Arc::new(
        JsonPluginStore::open(data_dir.join("plugins.json"))
            .await
            .unwrap(),
    );
    let manager = Manager::new(data_dir, vec![handler as Arc<dyn PluginHandler>], store.clone())
        .await
        .unwrap();
    (manager, store)
}

#[tokio::test]
async fn install_activates_and_uninstall_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let handler = MockHandler::new();
    let (manager, store) = fresh_manager(dir.path(), handler.clone()).await;

    let manifest = write_demo_plugin(dir.path()).await;
    let record = manager.install(&manifest).await.unwrap();
    assert_eq!(record.id, "openlist.driver.demo");
    assert_eq!(record.status, PluginStatus::Active);
    assert_eq!(record.source_url, format!("local:{manifest}"));
    assert_eq!(handler.registered.load(Ordering::SeqCst), 1);

    let wasm_path = dir
        .path()
        .join("plugins")
        .join("a-openlist.driver.demo.wasm");
    assert!(wasm_path.exists());
    assert_eq!(manager.list().await.len(), 1);
    assert_eq!(store.load_all().await.unwrap().len(), 1);

    manager.uninstall("openlist.driver.demo").await.unwrap();
    assert_eq!(handler.unregistered.load(Ordering::SeqCst), 1);
    assert!(manager.list().await.is_empty());
    assert!(!wasm_path.exists());
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_install_is_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let handler = MockHandler::new();
    let (manager, _store) = fresh_manager(dir.path(), handler.clone()).await;

    let manifest = write_demo_plugin(dir.path()).await;
    manager.install(&manifest).await.unwrap();
    let before = manager.list().await;

    let err = manager.install(&manifest).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(manager.list().await, before);
    assert_eq!(handler.registered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsupported_prefix_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, store) = fresh_manager(dir.path(), MockHandler::new()).await;

    let manifest_path = dir.path().join("other.json");
    tokio::fs::write(
        &manifest_path,
        br#"{"id":"openlist.theme.dark","name":"Dark","version":"1.0.0"}"#,
    )
    .await
    .unwrap();
    tokio::fs::write(dir.path().join("other.wasm"), b"\0asm")
        .await
        .unwrap();

    let err = manager
        .install(&manifest_path.display().to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported plugin type"));
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn registration_failure_is_recorded_as_error_status() {
    let dir = tempfile::tempdir().unwrap();
    let handler = MockHandler::failing("no such backend");
    let store: Arc<dyn PluginStore> = Arc::new(
        JsonPluginStore::open(dir.path().join("plugins.json"))
            .await
            .unwrap(),
    );
    let manager = Manager::new(
        dir.path(),
        vec![handler as Arc<dyn PluginHandler>],
        store.clone(),
    )
    .await
    .unwrap();

    let manifest = write_demo_plugin(dir.path()).await;
    let record = manager.install(&manifest).await.unwrap();
    assert_eq!(record.status, PluginStatus::Error);
    assert!(record.message.contains("no such backend"));

    let stored = store.load_all().await.unwrap();
    assert_eq!(stored[0].status, PluginStatus::Error);
}

#[tokio::test]
async fn restart_loads_plugins_and_skips_missing_wasm_files() {
    let dir = tempfile::tempdir().unwrap();
    let handler = MockHandler::new();
    {
        let (manager, _store) = fresh_manager(dir.path(), handler.clone()).await;
        let manifest = write_demo_plugin(dir.path()).await;
        manager.install(&manifest).await.unwrap();
    }

    // Reopen: row + wasm file both present, so the plugin registers again.
    let handler2 = MockHandler::new();
    {
        let (manager, _store) = fresh_manager(dir.path(), handler2.clone()).await;
        assert_eq!(manager.list().await.len(), 1);
        assert_eq!(handler2.registered.load(Ordering::SeqCst), 1);
    }

    // Remove the wasm file behind the store's back: the row is skipped.
    tokio::fs::remove_file(
        dir.path()
            .join("plugins")
            .join("a-openlist.driver.demo.wasm"),
    )
    .await
    .unwrap();
    let handler3 = MockHandler::new();
    let (manager, _store) = fresh_manager(dir.path(), handler3.clone()).await;
    assert!(manager.list().await.is_empty());
    assert_eq!(handler3.registered.load(Ordering::SeqCst), 0);
}

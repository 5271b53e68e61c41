//! End-to-end tests against a real driver plugin
//!
//! These require a prebuilt component-model wasm driver; point
//! `OPENLIST_TEST_PLUGIN` at one (plus `OPENLIST_TEST_PLUGIN_ID`) or the
//! tests skip.

use openlist_types::{Capability, Driver, Object, PluginRecord, PluginStatus};
use openlist_wasm::engine::{WasmConfig, WasmEngine};
use openlist_wasm::host::NoopPersist;
use openlist_wasm::plugin::DriverPlugin;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn test_plugin_path() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var("OPENLIST_TEST_PLUGIN").ok()?);
    path.exists().then_some(path)
}

fn test_record(wasm_path: PathBuf) -> PluginRecord {
    let now = chrono::Utc::now();
    PluginRecord {
        id: std::env::var("OPENLIST_TEST_PLUGIN_ID")
            .unwrap_or_else(|_| "openlist.driver.test".to_string()),
        name: "Test".into(),
        version: "0.0.0".into(),
        author: "test".into(),
        description: String::new(),
        icon_url: String::new(),
        source_url: String::new(),
        wasm_path,
        status: PluginStatus::Inactive,
        message: String::new(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn load_plugin_and_list_root() {
    let Some(wasm_path) = test_plugin_path() else {
        eprintln!("Skipping test: set OPENLIST_TEST_PLUGIN to a built driver component");
        return;
    };

    let engine = Arc::new(WasmEngine::new(WasmConfig::default()).unwrap());
    let plugin = DriverPlugin::new(&engine, &test_record(wasm_path), Arc::new(NoopPersist))
        .await
        .expect("failed to load test plugin");

    let driver = plugin.new_driver().await.expect("constructor failed");
    let props = driver.props();
    assert!(!props.name.is_empty());

    if !props.capabilities.contains(Capability::LIST) {
        eprintln!("Skipping list: plugin does not claim the list capability");
        return;
    }

    let ctx = CancellationToken::new();
    driver.init(&ctx).await.expect("init failed");
    let entries = driver.list(&ctx, &Object::root()).await.expect("list failed");
    for entry in &entries {
        assert!(!entry.name.is_empty());
    }
}

#[tokio::test]
async fn capability_gating_returns_not_implemented() {
    let Some(wasm_path) = test_plugin_path() else {
        eprintln!("Skipping test: set OPENLIST_TEST_PLUGIN to a built driver component");
        return;
    };

    let engine = Arc::new(WasmEngine::new(WasmConfig::default()).unwrap());
    let plugin = DriverPlugin::new(&engine, &test_record(wasm_path), Arc::new(NoopPersist))
        .await
        .unwrap();
    let driver = plugin.new_driver().await.unwrap();

    let ctx = CancellationToken::new();
    if !driver.props().capabilities.contains(Capability::GET) {
        let err = driver.get(&ctx, "/a").await.unwrap_err();
        assert!(err.is_not_implemented());
    }
}

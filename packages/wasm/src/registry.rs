//! Routing of installed plugins to their handlers
//!
//! Plugins are dispatched by id prefix. The only kind today is the driver
//! plugin, whose handler loads the wasm module and exposes a driver factory
//! to the surrounding storage registry.

use crate::engine::WasmEngine;
use crate::host::DriverPersist;
use crate::plugin::DriverPlugin;
use async_trait::async_trait;
use futures::future::BoxFuture;
use openlist_types::{Driver, DriverError, DriverResult, PluginRecord};
use std::sync::Arc;

/// Id prefix routed to the driver plugin handler.
pub const DRIVER_PLUGIN_PREFIX: &str = "openlist.driver.";

/// In-memory state of one installed plugin.
pub struct PluginInfo {
    pub record: PluginRecord,
    pub handler: Option<Arc<dyn PluginHandler>>,
    /// Loaded module, present while the plugin is registered.
    pub plugin: Option<Arc<DriverPlugin>>,
    /// Driver display name captured at registration so unregistering never
    /// has to reopen the wasm module.
    pub driver_name: Option<String>,
}

impl PluginInfo {
    pub fn new(record: PluginRecord) -> Self {
        Self {
            record,
            handler: None,
            plugin: None,
            driver_name: None,
        }
    }
}

/// Knows how to activate and deactivate one kind of plugin.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Plugin id prefix this handler accepts.
    fn prefix(&self) -> &str;

    async fn register(&self, info: &mut PluginInfo) -> anyhow::Result<()>;

    async fn unregister(&self, info: &mut PluginInfo) -> anyhow::Result<()>;
}

/// Constructs a fresh driver instance per configured storage.
pub type DriverFactory =
    Arc<dyn Fn() -> BoxFuture<'static, DriverResult<Box<dyn Driver>>> + Send + Sync>;

/// Callback surface of the storage registry the engine hangs drivers into.
pub trait DriverRegistry: Send + Sync {
    fn register_driver(&self, name: &str, factory: DriverFactory);
    fn unregister_driver(&self, name: &str);
}

pub struct DriverPluginHandler {
    engine: Arc<WasmEngine>,
    registry: Arc<dyn DriverRegistry>,
    persist: Arc<dyn DriverPersist>,
}

impl DriverPluginHandler {
    pub fn new(
        engine: Arc<WasmEngine>,
        registry: Arc<dyn DriverRegistry>,
        persist: Arc<dyn DriverPersist>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            registry,
            persist,
        })
    }
}

#[async_trait]
impl PluginHandler for DriverPluginHandler {
    fn prefix(&self) -> &str {
        DRIVER_PLUGIN_PREFIX
    }

    async fn register(&self, info: &mut PluginInfo) -> anyhow::Result<()> {
        if info.plugin.is_some() {
            return Ok(());
        }

        let plugin = DriverPlugin::new(&self.engine, &info.record, self.persist.clone())
            .await
            .map_err(|e| anyhow::anyhow!("load driver plugin: {e}"))?;

        // Probe one instance for the display name the storage registry keys
        // drivers by.
        let probe = plugin
            .new_driver()
            .await
            .map_err(|e| anyhow::anyhow!("construct driver instance: {e}"))?;
        let name = probe.props().name;
        drop(probe);

        let factory_plugin = plugin.clone();
        let factory: DriverFactory = Arc::new(move || {
            let plugin = factory_plugin.clone();
            Box::pin(async move {
                plugin
                    .new_driver()
                    .await
                    .map(|driver| Box::new(driver) as Box<dyn Driver>)
                    .map_err(|e| {
                        tracing::error!("deferred driver construction failed: {e}");
                        DriverError::other(e.to_string())
                    })
            })
        });
        self.registry.register_driver(&name, factory);

        tracing::info!("Successfully registered driver for plugin: {}", info.record.id);
        info.plugin = Some(plugin);
        info.driver_name = Some(name);
        Ok(())
    }

    async fn unregister(&self, info: &mut PluginInfo) -> anyhow::Result<()> {
        let name = info
            .driver_name
            .clone()
            .unwrap_or_else(|| info.record.id.clone());
        self.registry.unregister_driver(&name);
        info.driver_name = None;
        Ok(())
    }
}

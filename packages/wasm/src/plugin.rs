//! Loaded driver plugin: compiled component, store and instance
//!
//! One `DriverPlugin` owns one wasmtime store. Stores are not safe for
//! concurrent entry, so every guest call goes through the store mutex; a
//! plugin is a single-writer resource and inbound calls serialise on it.
//! Dropping the plugin drops the store, invalidating every outstanding
//! handle.

use crate::abi::{AbiDriverProps, AbiFormField, EXPORT_INTERFACE};
use crate::driver::WasmDriver;
use crate::engine::WasmEngine;
use crate::error::{WasmError, WasmResult};
use crate::host::{register_host_functions, DriverPersist, DriverShared, StoreData};
use crate::resource::ResourceTable;
use crate::upload::UploadReadable;
use openlist_types::{FormField, PluginRecord};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use wasmtime::component::{Component, ComponentExportIndex, ComponentNamedList, Instance, Lift, Linker, Lower};
use wasmtime::Store;

pub struct DriverPlugin {
    id: String,
    component: Component,
    exports: Option<ComponentExportIndex>,
    instance: Instance,
    store: Mutex<Store<StoreData>>,
    contexts: Arc<ResourceTable<CancellationToken>>,
    uploads: Arc<ResourceTable<Arc<UploadReadable>>>,
    drivers: Arc<ResourceTable<Arc<DriverShared>>>,
    persist: Arc<dyn DriverPersist>,
}

/// Failure in the wasm call path, before any guest-level result is decoded.
pub(crate) enum CallError {
    MissingExport(String),
    Transport(anyhow::Error),
}

impl CallError {
    pub(crate) fn into_wasm(self) -> WasmError {
        match self {
            CallError::MissingExport(name) => WasmError::missing_export(name),
            CallError::Transport(e) => WasmError::Internal(e.to_string()),
        }
    }
}

impl DriverPlugin {
    /// Load the plugin's wasm component and stand up a live instance with
    /// the full host API installed.
    pub async fn new(
        engine: &WasmEngine,
        record: &PluginRecord,
        persist: Arc<dyn DriverPersist>,
    ) -> WasmResult<Arc<Self>> {
        let bytes = tokio::fs::read(&record.wasm_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WasmError::ModuleNotFound {
                    path: record.wasm_path.display().to_string(),
                }
            } else {
                WasmError::Io(e)
            }
        })?;

        let component = engine.load_component(&bytes)?;

        let mut linker: Linker<StoreData> = Linker::new(engine.engine());
        register_host_functions(&mut linker)?;

        let data = StoreData::new(&record.id, persist.clone());
        let contexts = data.host.contexts.clone();
        let uploads = data.host.uploads.clone();
        let drivers = data.host.drivers.clone();

        let mut store = Store::new(engine.engine(), data);
        if engine.config().epoch_interruption {
            store.set_epoch_deadline(1);
            store.epoch_deadline_async_yield_and_update(1);
            engine.start_epoch_ticker();
        }

        let instance = linker
            .instantiate_async(&mut store, &component)
            .await
            .map_err(|e| {
                WasmError::instantiation(format!(
                    "Failed to instantiate plugin '{}': {e}",
                    record.id
                ))
            })?;

        let exports = component.get_export_index(None, EXPORT_INTERFACE);
        if exports.is_none() {
            return Err(WasmError::instantiation(format!(
                "Plugin '{}' does not export {EXPORT_INTERFACE}",
                record.id
            )));
        }

        Ok(Arc::new(Self {
            id: record.id.clone(),
            component,
            exports,
            instance,
            store: Mutex::new(store),
            contexts,
            uploads,
            drivers,
            persist,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn contexts(&self) -> Arc<ResourceTable<CancellationToken>> {
        self.contexts.clone()
    }

    pub(crate) fn uploads(&self) -> Arc<ResourceTable<Arc<UploadReadable>>> {
        self.uploads.clone()
    }

    pub(crate) fn drivers(&self) -> Arc<ResourceTable<Arc<DriverShared>>> {
        self.drivers.clone()
    }

    pub(crate) fn persist(&self) -> Arc<dyn DriverPersist> {
        self.persist.clone()
    }

    pub(crate) async fn lock_store(&self) -> MutexGuard<'_, Store<StoreData>> {
        self.store.lock().await
    }

    /// Construct a fresh driver instance inside the guest and cache its
    /// properties and form schema.
    pub async fn new_driver(self: &Arc<Self>) -> WasmResult<WasmDriver> {
        let (handle,): (u32,) = self
            .call("[constructor]driver", ())
            .await
            .map_err(CallError::into_wasm)?;

        let (props,): (AbiDriverProps,) = self
            .call("[method]driver.get-properties", (handle,))
            .await
            .map_err(CallError::into_wasm)?;

        let (forms,): (Vec<AbiFormField>,) = self
            .call("[method]driver.get-form-meta", (handle,))
            .await
            .map_err(CallError::into_wasm)?;

        let forms: Vec<FormField> = forms.into_iter().map(FormField::from).collect();
        let shared = Arc::new(DriverShared::new(props.into(), forms));
        self.drivers.insert(handle, shared.clone());

        Ok(WasmDriver::new(self.clone(), handle, shared))
    }

    /// Call a guest export with the store lock taken for the duration.
    pub(crate) async fn call<P, R>(&self, name: &str, params: P) -> Result<R, CallError>
    where
        P: ComponentNamedList + Lower + Send + Sync + 'static,
        R: ComponentNamedList + Lift + Send + Sync + 'static,
    {
        let mut store = self.store.lock().await;
        self.call_in(&mut store, name, params).await
    }

    /// Call a guest export through an already-held store guard.
    pub(crate) async fn call_in<P, R>(
        &self,
        store: &mut Store<StoreData>,
        name: &str,
        params: P,
    ) -> Result<R, CallError>
    where
        P: ComponentNamedList + Lower + Send + Sync + 'static,
        R: ComponentNamedList + Lift + Send + Sync + 'static,
    {
        let Some(exports) = &self.exports else {
            return Err(CallError::MissingExport(name.to_string()));
        };
        let Some(index) = self.component.get_export_index(Some(exports), name) else {
            return Err(CallError::MissingExport(name.to_string()));
        };
        let Some(func) = self.instance.get_func(&mut *store, index) else {
            return Err(CallError::MissingExport(name.to_string()));
        };
        let typed = func
            .typed::<P, R>(&*store)
            .map_err(CallError::Transport)?;
        let result = typed
            .call_async(&mut *store, params)
            .await
            .map_err(CallError::Transport)?;
        typed
            .post_return_async(&mut *store)
            .await
            .map_err(CallError::Transport)?;
        Ok(result)
    }
}

impl std::fmt::Debug for DriverPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverPlugin").field("id", &self.id).finish()
    }
}

//! Host state backing the functions a driver plugin imports

pub mod fields;
pub mod linker;
pub mod logging;

pub use linker::register_host_functions;

use crate::resource::ResourceTable;
use crate::upload::UploadReadable;
use async_trait::async_trait;
use openlist_types::{Additional, DriverProps, DriverStatus, FormField};
use parking_lot::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wasmtime_wasi::p2::{IoView, WasiCtx, WasiCtxBuilder, WasiView};
use wasmtime_wasi_http::{WasiHttpCtx, WasiHttpView};

/// Per-store data: the WASI contexts plus the driver host tables.
pub struct StoreData {
    pub host: DriverHostState,
    pub wasi_ctx: WasiCtx,
    pub http_ctx: WasiHttpCtx,
    pub resource_table: wasmtime::component::ResourceTable,
}

impl StoreData {
    pub fn new(plugin_id: &str, persist: Arc<dyn DriverPersist>) -> Self {
        let mut builder = WasiCtxBuilder::new();
        builder.stdout(logging::LogStream::stdout(plugin_id));
        builder.stderr(logging::LogStream::stderr(plugin_id));
        builder.args(&[plugin_id]);
        builder.inherit_network();
        builder.allow_ip_name_lookup(true);

        Self {
            host: DriverHostState::new(plugin_id, persist),
            wasi_ctx: builder.build(),
            http_ctx: WasiHttpCtx::new(),
            resource_table: wasmtime::component::ResourceTable::new(),
        }
    }
}

impl IoView for StoreData {
    fn table(&mut self) -> &mut wasmtime::component::ResourceTable {
        &mut self.resource_table
    }
}

impl WasiView for StoreData {
    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.wasi_ctx
    }
}

impl WasiHttpView for StoreData {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        &mut self.http_ctx
    }
}

/// Handle tables brokering host objects to the guest, shared with the driver
/// proxy through `Arc` so per-call guards can release entries on any path.
pub struct DriverHostState {
    pub plugin_id: String,
    pub contexts: Arc<ResourceTable<CancellationToken>>,
    pub uploads: Arc<ResourceTable<Arc<UploadReadable>>>,
    /// Keyed by the guest-minted driver constructor handle.
    pub drivers: Arc<ResourceTable<Arc<DriverShared>>>,
    pub persist: Arc<dyn DriverPersist>,
}

impl DriverHostState {
    pub fn new(plugin_id: &str, persist: Arc<dyn DriverPersist>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            contexts: Arc::new(ResourceTable::new()),
            uploads: Arc::new(ResourceTable::new()),
            drivers: Arc::new(ResourceTable::new()),
            persist,
        }
    }
}

/// State of one driver instance, shared between the host-facing proxy and
/// the host bridge. Holds no reference back into the plugin, so dropping the
/// plugin tears everything down.
pub struct DriverShared {
    pub props: RwLock<DriverProps>,
    pub forms: RwLock<Vec<FormField>>,
    pub additional: RwLock<Additional>,
    pub status: RwLock<DriverStatus>,
    /// Guards the status transition to `nowork` so only one task writes.
    pub(crate) nowork_flag: AtomicBool,
}

impl DriverShared {
    pub fn new(props: DriverProps, forms: Vec<FormField>) -> Self {
        let additional = Additional {
            json: Vec::new(),
            forms: forms.clone(),
        };
        Self {
            props: RwLock::new(props),
            forms: RwLock::new(forms),
            additional: RwLock::new(additional),
            status: RwLock::new(DriverStatus::Work),
            nowork_flag: AtomicBool::new(false),
        }
    }
}

/// Durable storage for per-driver configuration and status.
///
/// `save-config` must not return to the guest before this completes.
#[async_trait]
pub trait DriverPersist: Send + Sync {
    async fn save_driver(&self, plugin_id: &str, driver: &DriverShared) -> anyhow::Result<()>;
}

/// Persistence sink for embedders that keep driver storage elsewhere.
#[derive(Debug, Default)]
pub struct NoopPersist;

#[async_trait]
impl DriverPersist for NoopPersist {
    async fn save_driver(&self, _plugin_id: &str, _driver: &DriverShared) -> anyhow::Result<()> {
        Ok(())
    }
}

//! OpenList WASM Driver Runtime
//!
//! This crate loads sandboxed WebAssembly storage drivers (component-model
//! modules targeting WASI Preview 2) and exposes each one as a regular
//! [`Driver`](openlist_types::Driver) to the layers above.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Storage layers                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Driver (trait)                                              │
//! │      ▲                                                        │
//! │   WasmDriver ── proxy, per-call handle scopes, error mapping  │
//! │      ▲                                                        │
//! │   DriverPlugin ── store + instance, serialised guest calls    │
//! │      ▲                    ▲                                   │
//! │   WasmEngine        Host bridge (log, config, cancellable,    │
//! │   (wasmtime)         readable, wasi + wasi-http)              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`Manager`] installs plugins from archives, GitHub releases, uploads
//! or local manifests, persists their metadata, and routes each one to a
//! [`PluginHandler`] by id prefix.

pub mod abi;
pub mod driver;
pub mod engine;
pub mod error;
pub mod host;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod resource;
pub mod store;
pub mod stream;
pub mod upload;

pub use driver::WasmDriver;
pub use engine::{WasmConfig, WasmEngine};
pub use error::{WasmError, WasmResult, INTERNAL_PLUGIN_ERROR};
pub use host::{DriverPersist, DriverShared, NoopPersist, StoreData};
pub use manager::Manager;
pub use plugin::DriverPlugin;
pub use registry::{
    DriverFactory, DriverPluginHandler, DriverRegistry, PluginHandler, PluginInfo,
    DRIVER_PLUGIN_PREFIX,
};
pub use resource::{ResourceTable, ScopedHandle};
pub use store::{JsonPluginStore, PluginStore};
pub use upload::UploadReadable;

//! Engine configuration and management
//!
//! The engine is the shared compilation unit for all driver plugins. One
//! engine outlives every plugin; each plugin gets its own store.

use crate::error::{WasmError, WasmResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use wasmtime::component::Component;
use wasmtime::{Config, Engine, OptLevel};

/// Configuration for the plugin engine
#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Enable parallel compilation
    pub parallel_compilation: bool,
    /// Optimization level
    pub opt_level: OptLevel,
    /// Enable epoch interruption so long-running guests yield to the
    /// scheduler
    pub epoch_interruption: bool,
    /// Interval at which the epoch ticker advances the engine epoch
    pub epoch_tick: Duration,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            parallel_compilation: true,
            opt_level: OptLevel::Speed,
            epoch_interruption: true,
            epoch_tick: Duration::from_millis(10),
        }
    }
}

impl WasmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Development configuration (faster compilation, less optimization)
    pub fn development() -> Self {
        Self {
            opt_level: OptLevel::None,
            ..Self::default()
        }
    }

    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();
        config.parallel_compilation(self.parallel_compilation);
        config.cranelift_opt_level(self.opt_level);
        config.epoch_interruption(self.epoch_interruption);
        config.async_support(true);
        config.memory_init_cow(true);
        config
    }
}

/// Shared wasmtime engine with a content-addressed component cache
pub struct WasmEngine {
    engine: Engine,
    config: WasmConfig,
    /// Compiled components keyed by the SHA-256 of their bytes
    components: DashMap<String, Component>,
    epoch_ticker: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl WasmEngine {
    pub fn new(config: WasmConfig) -> WasmResult<Self> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| WasmError::compilation(format!("Failed to create engine: {e}")))?;
        Ok(Self {
            engine,
            config,
            components: DashMap::new(),
            epoch_ticker: Arc::new(RwLock::new(None)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    /// Compile a component, reusing a previous compilation of identical
    /// bytes.
    pub fn load_component(&self, bytes: &[u8]) -> WasmResult<Component> {
        let hash = hex::encode(Sha256::digest(bytes));
        if let Some(component) = self.components.get(&hash) {
            return Ok(component.clone());
        }
        let component = Component::new(&self.engine, bytes)
            .map_err(|e| WasmError::compilation(format!("Failed to compile component: {e}")))?;
        self.components.insert(hash, component.clone());
        Ok(component)
    }

    /// Start the background task that advances the engine epoch, driving
    /// cooperative yields inside running guests. Idempotent.
    pub fn start_epoch_ticker(&self) {
        if !self.config.epoch_interruption {
            return;
        }
        let mut ticker = self.epoch_ticker.write();
        if ticker.is_some() {
            return;
        }
        let engine = self.engine.clone();
        let tick = self.config.epoch_tick;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        });
        *ticker = Some(handle);
    }

    pub fn stop_epoch_ticker(&self) {
        if let Some(handle) = self.epoch_ticker.write().take() {
            handle.abort();
        }
    }
}

impl Drop for WasmEngine {
    fn drop(&mut self) {
        self.stop_epoch_ticker();
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("cached_components", &self.components.len())
            .finish()
    }
}

//! Error types for the plugin runtime

use thiserror::Error;

/// Result type for plugin runtime operations
pub type WasmResult<T> = Result<T, WasmError>;

/// The error message surfaced to callers when a plugin fails inside the wasm
/// call path. Raw transport errors carry guest stack data and are only
/// logged, never propagated.
pub const INTERNAL_PLUGIN_ERROR: &str = "Internal error in plugin";

/// Errors that can occur while loading or driving a plugin
#[derive(Error, Debug)]
pub enum WasmError {
    /// Failed to compile the wasm component
    #[error("Compilation error: {0}")]
    Compilation(String),

    /// Failed to instantiate the wasm component
    #[error("Instantiation error: {0}")]
    Instantiation(String),

    /// Failed to register host functions
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Error during a guest call
    #[error("Execution error in {function}: {message}")]
    Execution { function: String, message: String },

    /// Required export not found in the component
    #[error("Missing required export: {export_name}")]
    MissingExport { export_name: String },

    /// Wasm file not found on disk
    #[error("Module not found: {path}")]
    ModuleNotFound { path: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for internal issues
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WasmError {
    pub fn compilation(message: impl Into<String>) -> Self {
        WasmError::Compilation(message.into())
    }

    pub fn instantiation(message: impl Into<String>) -> Self {
        WasmError::Instantiation(message.into())
    }

    pub fn execution(function: impl Into<String>, message: impl Into<String>) -> Self {
        WasmError::Execution {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn missing_export(export_name: impl Into<String>) -> Self {
        WasmError::MissingExport {
            export_name: export_name.into(),
        }
    }

    pub fn is_missing_export(&self) -> bool {
        matches!(self, WasmError::MissingExport { .. })
    }
}

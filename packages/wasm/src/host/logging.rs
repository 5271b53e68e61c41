//! Guest log forwarding
//!
//! Both the `log` host function and the plugin's stdio end up in the host
//! tracing output, tagged with the plugin id.

use crate::abi::AbiLogLevel;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use wasmtime_wasi::p2::{DynOutputStream, OutputStream, Pollable, StreamResult, StdoutStream};

pub fn guest_log(plugin_id: &str, level: AbiLogLevel, message: &str) {
    match level {
        AbiLogLevel::Debug => tracing::debug!(plugin = plugin_id, "{message}"),
        AbiLogLevel::Info => tracing::info!(plugin = plugin_id, "{message}"),
        AbiLogLevel::Warn => tracing::warn!(plugin = plugin_id, "{message}"),
        AbiLogLevel::Error => tracing::error!(plugin = plugin_id, "{message}"),
    }
}

/// WASI stdio sink that forwards complete lines to tracing.
#[derive(Clone)]
pub struct LogStream {
    plugin_id: Arc<str>,
    stderr: bool,
}

impl LogStream {
    pub fn stdout(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            stderr: false,
        }
    }

    pub fn stderr(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            stderr: true,
        }
    }
}

impl StdoutStream for LogStream {
    fn stream(&self) -> DynOutputStream {
        Box::new(LogWriter {
            plugin_id: self.plugin_id.clone(),
            stderr: self.stderr,
            buf: Vec::new(),
        })
    }

    fn isatty(&self) -> bool {
        false
    }
}

struct LogWriter {
    plugin_id: Arc<str>,
    stderr: bool,
    buf: Vec<u8>,
}

impl LogWriter {
    fn emit_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if self.stderr {
                tracing::warn!(plugin = &*self.plugin_id, "{line}");
            } else {
                tracing::info!(plugin = &*self.plugin_id, "{line}");
            }
        }
    }
}

#[async_trait]
impl Pollable for LogWriter {
    async fn ready(&mut self) {}
}

impl OutputStream for LogWriter {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.buf.extend_from_slice(&bytes);
        self.emit_lines();
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(64 * 1024)
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push(b'\n');
            self.emit_lines();
        }
    }
}

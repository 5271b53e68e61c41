//! Byte streams and pollables bridging the host/guest boundary
//!
//! Upload content flows guest-ward through [`UploadStream`] (sequential) and
//! [`SectionStream`] (peek/range windows); `link-range` bytes flow host-ward
//! through a bounded pipe whose write side enforces the declared byte budget.

use crate::upload::{SectionMode, UploadReadable};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use wasmtime_wasi::p2::{InputStream, OutputStream, Pollable, StreamError, StreamResult};

const READ_CHUNK: usize = 64 * 1024;

/// Sentinel pollable handed out for unknown cancellable handles.
pub struct ReadyPollable;

#[async_trait]
impl Pollable for ReadyPollable {
    async fn ready(&mut self) {}
}

/// Pollable backed by a host cancellation token: ready once the token fires.
pub struct TokenPollable {
    token: CancellationToken,
}

impl TokenPollable {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Pollable for TokenPollable {
    async fn ready(&mut self) {
        self.token.cancelled().await;
    }
}

/// Input stream that drains an upload sequentially, reporting progress as
/// bytes move.
pub struct UploadStream {
    upload: Arc<UploadReadable>,
    buf: Bytes,
    eof: bool,
    failed: Option<String>,
}

impl UploadStream {
    pub fn new(upload: Arc<UploadReadable>) -> Self {
        Self {
            upload,
            buf: Bytes::new(),
            eof: false,
            failed: None,
        }
    }
}

#[async_trait]
impl Pollable for UploadStream {
    async fn ready(&mut self) {
        if !self.buf.is_empty() || self.eof || self.failed.is_some() {
            return;
        }
        match self.upload.next_sequential_chunk().await {
            Ok(chunk) if chunk.is_empty() => self.eof = true,
            Ok(chunk) => self.buf = chunk,
            Err(e) => self.failed = Some(e.to_string()),
        }
    }
}

impl InputStream for UploadStream {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        if let Some(e) = self.failed.take() {
            return Err(StreamError::LastOperationFailed(anyhow::anyhow!(e)));
        }
        if !self.buf.is_empty() {
            let n = size.min(self.buf.len());
            return Ok(self.buf.split_to(n));
        }
        if self.eof {
            return Err(StreamError::Closed);
        }
        Ok(Bytes::new())
    }
}

/// One-shot input stream over a bounded window of an upload's cached bytes.
/// Dropping it releases the peek/range reservation it belongs to.
pub struct SectionStream {
    upload: Arc<UploadReadable>,
    mode: SectionMode,
    pos: u64,
    remaining: u64,
    buf: Bytes,
    failed: Option<String>,
}

impl SectionStream {
    pub fn new(upload: Arc<UploadReadable>, mode: SectionMode, offset: u64, len: u64) -> Self {
        Self {
            upload,
            mode,
            pos: offset,
            remaining: len,
            buf: Bytes::new(),
            failed: None,
        }
    }
}

#[async_trait]
impl Pollable for SectionStream {
    async fn ready(&mut self) {
        if !self.buf.is_empty() || self.remaining == 0 || self.failed.is_some() {
            return;
        }
        let want = READ_CHUNK.min(self.remaining as usize);
        match self.upload.read_cached_at(self.pos, want).await {
            Ok(chunk) if chunk.is_empty() => self.remaining = 0,
            Ok(chunk) => {
                self.pos += chunk.len() as u64;
                self.remaining -= chunk.len() as u64;
                self.buf = chunk;
            }
            Err(e) => self.failed = Some(e.to_string()),
        }
    }
}

impl InputStream for SectionStream {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        if let Some(e) = self.failed.take() {
            return Err(StreamError::LastOperationFailed(anyhow::anyhow!(e)));
        }
        if !self.buf.is_empty() {
            let n = size.min(self.buf.len());
            return Ok(self.buf.split_to(n));
        }
        if self.remaining == 0 {
            return Err(StreamError::Closed);
        }
        Ok(Bytes::new())
    }
}

impl Drop for SectionStream {
    fn drop(&mut self) {
        self.upload.end_section(self.mode);
    }
}

struct PipeInner {
    buf: VecDeque<Bytes>,
    buffered: usize,
    write_closed: bool,
    read_closed: bool,
    error: Option<String>,
    read_waker: Option<Waker>,
}

struct PipeShared {
    inner: Mutex<PipeInner>,
    writable: Notify,
    capacity: usize,
}

impl PipeShared {
    fn wake_reader(&self, inner: &mut PipeInner) {
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }
}

/// Create a bounded pipe whose write side fails once more than `limit` bytes
/// have been written. Returns the guest-facing writer, the host-facing
/// reader, and a control handle for completing the pipe out of band.
pub fn capped_pipe(limit: u64, capacity: usize) -> (CappedPipeWriter, PipeReader, PipeControl) {
    let shared = Arc::new(PipeShared {
        inner: Mutex::new(PipeInner {
            buf: VecDeque::new(),
            buffered: 0,
            write_closed: false,
            read_closed: false,
            error: None,
            read_waker: None,
        }),
        writable: Notify::new(),
        capacity,
    });
    (
        CappedPipeWriter {
            shared: shared.clone(),
            remaining: limit,
        },
        PipeReader {
            shared: shared.clone(),
        },
        PipeControl { shared },
    )
}

/// Output stream enforcing a byte budget (the check-writer).
pub struct CappedPipeWriter {
    shared: Arc<PipeShared>,
    remaining: u64,
}

#[async_trait]
impl Pollable for CappedPipeWriter {
    async fn ready(&mut self) {
        loop {
            let notified = self.shared.writable.notified();
            {
                let inner = self.shared.inner.lock();
                if inner.read_closed || inner.buffered < self.shared.capacity {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl OutputStream for CappedPipeWriter {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.read_closed {
            return Err(StreamError::Closed);
        }
        if bytes.len() as u64 > self.remaining {
            return Err(StreamError::LastOperationFailed(anyhow::anyhow!(
                "write limit exceeded"
            )));
        }
        self.remaining -= bytes.len() as u64;
        inner.buffered += bytes.len();
        inner.buf.push_back(bytes);
        self.shared.wake_reader(&mut inner);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        let inner = self.shared.inner.lock();
        if inner.read_closed {
            return Err(StreamError::Closed);
        }
        let room = self.shared.capacity.saturating_sub(inner.buffered);
        if room == 0 {
            return Ok(0);
        }
        // Never advertise 0 on budget exhaustion: the next write must fail
        // loudly instead of wedging the guest on a pollable.
        Ok(room.min(self.remaining.max(1) as usize))
    }
}

impl Drop for CappedPipeWriter {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.write_closed = true;
        self.shared.wake_reader(&mut inner);
    }
}

/// Completes a pipe from the task driving the guest call.
#[derive(Clone)]
pub struct PipeControl {
    shared: Arc<PipeShared>,
}

impl PipeControl {
    /// Close the pipe with an error the reader will observe after draining
    /// buffered bytes.
    pub fn fail(&self, message: impl Into<String>) {
        let mut inner = self.shared.inner.lock();
        inner.error = Some(message.into());
        inner.write_closed = true;
        self.shared.wake_reader(&mut inner);
    }

    pub fn finish(&self) {
        let mut inner = self.shared.inner.lock();
        inner.write_closed = true;
        self.shared.wake_reader(&mut inner);
    }
}

/// Host-side read half of a capped pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.shared.inner.lock();
        if let Some(mut chunk) = inner.buf.pop_front() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk.split_to(n));
            if !chunk.is_empty() {
                inner.buf.push_front(chunk);
            }
            inner.buffered -= n;
            drop(inner);
            self.shared.writable.notify_one();
            return Poll::Ready(Ok(()));
        }
        if let Some(error) = inner.error.clone() {
            return Poll::Ready(Err(io::Error::other(error)));
        }
        if inner.write_closed {
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.read_closed = true;
        drop(inner);
        self.shared.writable.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn pipe_delivers_bytes_in_order() {
        let (mut writer, mut reader, control) = capped_pipe(16, 1024);
        writer.write(Bytes::from_static(b"hello ")).unwrap();
        writer.write(Bytes::from_static(b"world")).unwrap();
        control.finish();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn pipe_enforces_byte_budget() {
        let (mut writer, _reader, _control) = capped_pipe(4, 1024);
        writer.write(Bytes::from_static(b"1234")).unwrap();
        let err = writer.write(Bytes::from_static(b"5")).unwrap_err();
        assert!(matches!(err, StreamError::LastOperationFailed(_)));
    }

    #[tokio::test]
    async fn check_write_stays_positive_on_exhausted_budget() {
        let (mut writer, _reader, _control) = capped_pipe(2, 1024);
        writer.write(Bytes::from_static(b"ab")).unwrap();
        assert_eq!(writer.check_write().unwrap(), 1);
    }

    #[tokio::test]
    async fn pipe_failure_reaches_reader_after_buffered_data() {
        let (mut writer, mut reader, control) = capped_pipe(16, 1024);
        writer.write(Bytes::from_static(b"abc")).unwrap();
        control.fail("backend exploded");
        drop(writer);

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.to_string(), "backend exploded");
    }

    #[tokio::test]
    async fn writer_sees_closed_reader() {
        let (mut writer, reader, _control) = capped_pipe(16, 1024);
        drop(reader);
        assert!(matches!(
            writer.write(Bytes::from_static(b"x")),
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn token_pollable_fires_on_cancel() {
        let token = CancellationToken::new();
        let mut pollable = TokenPollable::new(token.clone());
        token.cancel();
        pollable.ready().await;
    }
}

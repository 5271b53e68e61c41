//! Upload and download stream contracts

use crate::error::DriverResult;
use crate::object::Object;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// The byte source behind an upload, supplied by the caller of
/// [`Driver::put`](crate::driver::Driver::put).
///
/// The stream is pull-based and strictly sequential; any buffering needed to
/// serve random access on top of it is the consumer's business.
#[async_trait]
pub trait FileStreamer: Send + Sync {
    /// Metadata of the object being uploaded, including any digests the
    /// caller already knows.
    fn obj(&self) -> &Object;

    /// When overwriting, the original object at the destination.
    fn exist(&self) -> Option<&Object>;

    /// Pull the next chunk. An empty chunk signals end of stream.
    async fn next_chunk(&mut self) -> std::io::Result<Bytes>;
}

/// Per-request arguments for link resolution.
#[derive(Debug, Clone, Default)]
pub struct LinkArgs {
    pub ip: String,
    pub headers: http::HeaderMap,
}

/// How a file's content can be fetched.
pub enum Link {
    /// The backend serves the bytes itself; redirect or proxy this URL.
    Direct {
        url: String,
        headers: http::HeaderMap,
        expiration: Option<Duration>,
    },
    /// The driver streams arbitrary sub-ranges on demand.
    Range(Arc<dyn RangeReader>),
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Direct { url, .. } => f.debug_struct("Direct").field("url", url).finish(),
            Link::Range(_) => f.write_str("Range(..)"),
        }
    }
}

/// Yields a reader over `len` bytes starting at `offset` of the logical
/// object. Different sub-ranges may be requested concurrently.
#[async_trait]
pub trait RangeReader: Send + Sync {
    async fn range_read(
        &self,
        ctx: &CancellationToken,
        offset: u64,
        len: u64,
    ) -> DriverResult<Box<dyn AsyncRead + Send + Unpin>>;
}

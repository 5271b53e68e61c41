//! Host-side upload state shared with the guest through the `readable`
//! resource
//!
//! An [`UploadReadable`] wraps the caller's [`FileStreamer`] and offers the
//! guest three mutually-exclusive access modes: sequential consumption,
//! offset peeks, and seekable ranges. Peek and range are served from a
//! spooled temp-file cache so the sequential stream is never consumed behind
//! the caller's back.

use bytes::Bytes;
use openlist_types::{FileStreamer, HashAlg, HashInfo, MultiHasher, Object, UpdateProgress};
use parking_lot::Mutex;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const READ_CHUNK: usize = 64 * 1024;

/// Which reservation a section stream holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionMode {
    Peek,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    /// Terminal: the sequential stream has been handed out.
    StreamConsumed,
    Peek,
    Range,
}

pub struct UploadReadable {
    obj: Object,
    exist: Option<Object>,
    progress: UpdateProgress,
    mode: Mutex<Mode>,
    state: tokio::sync::Mutex<UploadState>,
}

struct UploadState {
    source: Box<dyn FileStreamer>,
    hashes: HashInfo,
    cache: SpoolCache,
    read_pos: u64,
}

impl UploadReadable {
    pub fn new(source: Box<dyn FileStreamer>, progress: UpdateProgress) -> Arc<Self> {
        let obj = source.obj().clone();
        let exist = source.exist().cloned();
        let hashes = obj.hashes.clone();
        Arc::new(Self {
            obj,
            exist,
            progress,
            mode: Mutex::new(Mode::Idle),
            state: tokio::sync::Mutex::new(UploadState {
                source,
                hashes,
                cache: SpoolCache::default(),
                read_pos: 0,
            }),
        })
    }

    pub fn obj(&self) -> &Object {
        &self.obj
    }

    pub fn exist(&self) -> Option<&Object> {
        self.exist.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.obj.size
    }

    /// Enter sequential-consumption mode. Terminal once entered.
    pub fn begin_stream(&self) -> Result<(), String> {
        let mut mode = self.mode.lock();
        match *mode {
            Mode::Idle => {
                *mode = Mode::StreamConsumed;
                Ok(())
            }
            Mode::StreamConsumed => Err("UploadReadable::Stream: StreamConsume".into()),
            Mode::Peek => Err("UploadReadable::Stream: PeekUseing".into()),
            Mode::Range => Err("UploadReadable::Stream: RangeUseing".into()),
        }
    }

    /// Reserve a peek window. Returns the window length, truncated to the
    /// end of the upload.
    pub async fn begin_peek(&self, offset: u64, len: u64) -> Result<u64, String> {
        {
            let mut mode = self.mode.lock();
            match *mode {
                Mode::Idle => *mode = Mode::Peek,
                Mode::StreamConsumed => {
                    return Err("UploadReadable::Peek: StreamConsume".into());
                }
                Mode::Peek => return Err("UploadReadable::Peek: PeekUseing".into()),
                Mode::Range => return Err("UploadReadable::Peek: RangeUseing".into()),
            }
        }
        let len = len.min(self.size().saturating_sub(offset));
        if let Err(e) = self.ensure_cached(offset.saturating_add(len)).await {
            self.end_section(SectionMode::Peek);
            return Err(e.to_string());
        }
        Ok(len)
    }

    /// Reserve a range over the fully-cached source. Returns the section
    /// length, truncated to the end of the upload.
    pub async fn begin_range(&self, offset: u64, len: u64) -> Result<u64, String> {
        {
            let mut mode = self.mode.lock();
            match *mode {
                Mode::Idle => *mode = Mode::Range,
                Mode::StreamConsumed => {
                    return Err("UploadReadable::Range: StreamConsume".into());
                }
                Mode::Peek => return Err("UploadReadable::Range: PeekUseing".into()),
                Mode::Range => return Err("UploadReadable::Range: RangeUseing".into()),
            }
        }
        if let Err(e) = self.ensure_cached(u64::MAX).await {
            self.end_section(SectionMode::Range);
            return Err(e.to_string());
        }
        Ok(len.min(self.size().saturating_sub(offset)))
    }

    /// Release a peek/range reservation. Idempotent; called when the section
    /// stream drops.
    pub fn end_section(&self, section: SectionMode) {
        let mut mode = self.mode.lock();
        match (section, *mode) {
            (SectionMode::Peek, Mode::Peek) => *mode = Mode::Idle,
            (SectionMode::Range, Mode::Range) => *mode = Mode::Idle,
            _ => {}
        }
    }

    /// Requested digests, from the cache when every one of them is already
    /// known, otherwise computed by streaming the source into a multi-hasher
    /// (which caches the source in full but does not consume the stream).
    pub async fn get_hasher(&self, algs: &[HashAlg]) -> Result<Vec<(HashAlg, String)>, String> {
        {
            let state = self.state.lock().await;
            if let Some(known) = state.hashes.get_all(algs) {
                return Ok(known);
            }
        }
        {
            let mode = self.mode.lock();
            match *mode {
                Mode::Idle => {}
                Mode::StreamConsumed => {
                    return Err("UploadReadable::GetHasher: StreamConsume".into());
                }
                Mode::Peek => return Err("UploadReadable::GetHasher: PeekUseing".into()),
                Mode::Range => return Err("UploadReadable::GetHasher: RangeUseing".into()),
            }
        }
        self.ensure_cached(u64::MAX).await.map_err(|e| e.to_string())?;

        let mut state = self.state.lock().await;
        let mut hasher = MultiHasher::new(algs, self.size());
        let mut pos = 0u64;
        while pos < state.cache.len {
            let want = READ_CHUNK.min((state.cache.len - pos) as usize);
            let chunk = state
                .cache
                .read_at(pos, want)
                .await
                .map_err(|e| e.to_string())?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            hasher.update(&chunk);
        }
        let fresh = hasher.finalize();
        state.hashes.merge(&fresh);
        state
            .hashes
            .get_all(algs)
            .ok_or_else(|| "hash computation incomplete".to_string())
    }

    /// Forward a guest-reported progress fraction to the caller's callback.
    pub fn update_progress(&self, progress: f64) {
        (self.progress)(progress.clamp(0.0, 1.0));
    }

    /// Next chunk for the sequential stream: cached bytes first, then the
    /// live source.
    pub(crate) async fn next_sequential_chunk(&self) -> io::Result<Bytes> {
        let mut state = self.state.lock().await;
        let chunk = if state.read_pos < state.cache.len {
            let want = READ_CHUNK.min((state.cache.len - state.read_pos) as usize);
            let pos = state.read_pos;
            state.cache.read_at(pos, want).await?
        } else {
            state.source.next_chunk().await?
        };
        state.read_pos += chunk.len() as u64;
        if self.size() > 0 {
            (self.progress)(state.read_pos as f64 / self.size() as f64);
        }
        Ok(chunk)
    }

    /// Read from the cached prefix; never touches the live source.
    pub(crate) async fn read_cached_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let mut state = self.state.lock().await;
        if offset >= state.cache.len {
            return Ok(Bytes::new());
        }
        let want = len.min((state.cache.len - offset) as usize);
        state.cache.read_at(offset, want).await
    }

    /// Pull from the source until at least `upto` bytes are cached or the
    /// source ends.
    async fn ensure_cached(&self, upto: u64) -> io::Result<()> {
        let mut state = self.state.lock().await;
        while state.cache.len < upto && !state.cache.source_eof {
            let chunk = state.source.next_chunk().await?;
            if chunk.is_empty() {
                state.cache.source_eof = true;
                break;
            }
            state.cache.append(&chunk).await?;
            if self.size() > 0 {
                (self.progress)((state.cache.len as f64 / self.size() as f64).min(1.0));
            }
        }
        Ok(())
    }
}

/// Temp-file spool holding every byte read from the source so far.
#[derive(Default)]
struct SpoolCache {
    write: Option<tokio::fs::File>,
    read: Option<tokio::fs::File>,
    path: Option<tempfile::TempPath>,
    len: u64,
    source_eof: bool,
}

impl SpoolCache {
    async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.write.is_none() {
            let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
            self.write = Some(tokio::fs::File::from_std(file));
            self.path = Some(path);
        }
        if let Some(file) = self.write.as_mut() {
            file.write_all(chunk).await?;
            file.flush().await?;
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Bytes> {
        if len == 0 || offset >= self.len {
            return Ok(Bytes::new());
        }
        if self.read.is_none() {
            let Some(path) = &self.path else {
                return Ok(Bytes::new());
            };
            self.read = Some(tokio::fs::File::open(path).await?);
        }
        let Some(file) = self.read.as_mut() else {
            return Ok(Bytes::new());
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecStreamer {
        obj: Object,
        data: Bytes,
        pos: usize,
        chunk: usize,
        reads: Arc<AtomicUsize>,
    }

    impl VecStreamer {
        fn new(data: &'static [u8], chunk: usize) -> Self {
            Self {
                obj: Object {
                    name: "upload.bin".into(),
                    size: data.len() as u64,
                    ..Default::default()
                },
                data: Bytes::from_static(data),
                pos: 0,
                chunk,
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_hashes(mut self, hashes: HashInfo) -> Self {
            self.obj.hashes = hashes;
            self
        }
    }

    #[async_trait]
    impl FileStreamer for VecStreamer {
        fn obj(&self) -> &Object {
            &self.obj
        }

        fn exist(&self) -> Option<&Object> {
            None
        }

        async fn next_chunk(&mut self) -> io::Result<Bytes> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let end = (self.pos + self.chunk).min(self.data.len());
            let chunk = self.data.slice(self.pos..end);
            self.pos = end;
            Ok(chunk)
        }
    }

    fn noop_progress() -> UpdateProgress {
        Arc::new(|_| {})
    }

    async fn drain_sequential(upload: &Arc<UploadReadable>) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = upload.next_sequential_chunk().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn stream_consume_is_terminal_and_exclusive() {
        let upload = UploadReadable::new(Box::new(VecStreamer::new(b"abcdef", 2)), noop_progress());
        upload.begin_stream().unwrap();
        assert_eq!(
            upload.begin_stream().unwrap_err(),
            "UploadReadable::Stream: StreamConsume"
        );
        assert_eq!(
            upload.begin_peek(0, 2).await.unwrap_err(),
            "UploadReadable::Peek: StreamConsume"
        );
        assert_eq!(
            upload.begin_range(0, 2).await.unwrap_err(),
            "UploadReadable::Range: StreamConsume"
        );
    }

    #[tokio::test]
    async fn peek_and_range_are_mutually_exclusive() {
        let upload = UploadReadable::new(Box::new(VecStreamer::new(b"abcdef", 2)), noop_progress());
        upload.begin_peek(0, 2).await.unwrap();
        assert_eq!(
            upload.begin_range(0, 2).await.unwrap_err(),
            "UploadReadable::Range: PeekUseing"
        );
        upload.end_section(SectionMode::Peek);
        upload.begin_range(0, 2).await.unwrap();
        assert_eq!(
            upload.begin_peek(0, 2).await.unwrap_err(),
            "UploadReadable::Peek: RangeUseing"
        );
    }

    #[tokio::test]
    async fn peek_does_not_consume_the_sequential_stream() {
        let upload =
            UploadReadable::new(Box::new(VecStreamer::new(b"hello world", 4)), noop_progress());
        let len = upload.begin_peek(6, 5).await.unwrap();
        assert_eq!(len, 5);
        assert_eq!(
            upload.read_cached_at(6, 5).await.unwrap().as_ref(),
            b"world"
        );
        upload.end_section(SectionMode::Peek);

        upload.begin_stream().unwrap();
        assert_eq!(drain_sequential(&upload).await, b"hello world");
    }

    #[tokio::test]
    async fn range_truncates_past_the_end() {
        let upload = UploadReadable::new(Box::new(VecStreamer::new(b"0123456789", 3)), noop_progress());
        let len = upload.begin_range(8, 100).await.unwrap();
        assert_eq!(len, 2);
        assert_eq!(upload.read_cached_at(8, 2).await.unwrap().as_ref(), b"89");
    }

    #[tokio::test]
    async fn peek_of_zero_length_succeeds() {
        let upload = UploadReadable::new(Box::new(VecStreamer::new(b"abc", 2)), noop_progress());
        assert_eq!(upload.begin_peek(1, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hasher_cache_hit_reads_nothing() {
        let mut hashes = HashInfo::new();
        hashes.set(HashAlg::Md5, "d".repeat(32));
        hashes.set(HashAlg::Sha1, "e".repeat(40));
        let streamer = VecStreamer::new(b"abc", 2).with_hashes(hashes);
        let reads = streamer.reads.clone();
        let upload = UploadReadable::new(Box::new(streamer), noop_progress());

        let got = upload
            .get_hasher(&[HashAlg::Md5, HashAlg::Sha1])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        // The stream was not consumed by the cache hit.
        upload.begin_stream().unwrap();
        assert_eq!(drain_sequential(&upload).await, b"abc");
    }

    #[tokio::test]
    async fn hasher_computes_and_merges_missing_digests() {
        let upload = UploadReadable::new(Box::new(VecStreamer::new(b"abc", 2)), noop_progress());
        let got = upload.get_hasher(&[HashAlg::Md5]).await.unwrap();
        assert_eq!(got[0].1, "900150983cd24fb0d6963f7d28e17f72");

        // Second request is served from the merged cache.
        let again = upload.get_hasher(&[HashAlg::Md5]).await.unwrap();
        assert_eq!(got, again);

        // Hashing cached the source without consuming the stream.
        upload.begin_stream().unwrap();
        assert_eq!(drain_sequential(&upload).await, b"abc");
    }

    #[tokio::test]
    async fn sequential_progress_reaches_one() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let progress: UpdateProgress = {
            let seen = seen.clone();
            Arc::new(move |p| seen.lock().push(p))
        };
        let upload = UploadReadable::new(Box::new(VecStreamer::new(b"abcd", 2)), progress);
        upload.begin_stream().unwrap();
        drain_sequential(&upload).await;
        let last = *seen.lock().last().unwrap();
        assert!((last - 1.0).abs() < f64::EPSILON);
    }
}

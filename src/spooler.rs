//! Stages `PUT` bodies to disk and drives background uploads under a global
//! pending-byte budget.
//!
//! The presence of a spool file at its canonical path is the in-flight
//! sentinel for its key: no separate in-flight set is kept.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::breaker::CircuitBreaker;
use crate::error::StoreError;
use crate::store::ObjectStoreClient;

/// Outcome of staging a `PUT` body to disk.
pub enum StageOutcome {
    /// Body written in full; `size` is the spooled file's length and
    /// `bytes` is the same content held in memory, so the router can admit
    /// it to [`MemoryCache`](crate::cache::MemoryCache) without a disk
    /// read-back.
    Accepted { size: u64, bytes: Bytes },
    /// A spool file for this key already existed; the router should treat
    /// this as an already-in-flight upload and respond success.
    Duplicate,
}

/// Why a staged upload was not admitted to the pending-byte budget.
pub enum AdmitOutcome {
    TooLarge,
    BudgetExceeded,
}

/// Unlinks a partially-written spool file on drop, unless disarmed. Covers
/// both an explicit I/O error during staging and the socket-timeout
/// cancellation path, where the enclosing future is simply dropped mid-await
/// with no chance to run ordinary cleanup code.
struct StageFileGuard<'a> {
    path: &'a Path,
    disarmed: bool,
}

impl Drop for StageFileGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            let _ = std::fs::remove_file(self.path);
        }
    }
}

/// Releases `size` from the pending-byte budget and unlinks the spool file
/// exactly once, on drop — whether `upload_and_finish` ran to completion or
/// its future was cancelled (e.g. by the socket timeout) mid-upload. This is
/// the only place that touches either resource, so there is nothing for the
/// normal return path to additionally clean up.
struct UploadGuard<'a> {
    pending_bytes: &'a AtomicU64,
    size: u64,
    path: &'a Path,
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        self.pending_bytes.fetch_sub(self.size, Ordering::AcqRel);
        let _ = std::fs::remove_file(self.path);
    }
}

pub struct UploadSpooler {
    cache_dir: PathBuf,
    max_entry_size: u64,
    max_pending_bytes: u64,
    pending_bytes: AtomicU64,
}

impl UploadSpooler {
    pub fn new(cache_dir: PathBuf, max_entry_size: u64, max_pending_bytes: u64) -> Self {
        Self {
            cache_dir,
            max_entry_size,
            max_pending_bytes,
            pending_bytes: AtomicU64::new(0),
        }
    }

    /// Maps a key to its spool path, preserving `/`-separated structure
    /// under the cache directory.
    pub fn spool_path(&self, key: &[u8]) -> PathBuf {
        let key = String::from_utf8_lossy(key);
        let mut path = self.cache_dir.clone();
        for segment in key.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        path
    }

    /// Current total bytes across uploads in the `Uploading` state.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// Streams `body` to the spool path for `key`. Returns [`StageOutcome::Duplicate`]
    /// without touching the on-disk file if one already exists for this key.
    pub async fn stage<S, E>(&self, key: &[u8], mut body: S) -> io::Result<StageOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let path = self.spool_path(key);

        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(StageOutcome::Duplicate);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(StageOutcome::Duplicate),
            Err(e) => return Err(e),
        };

        // Unlinks the partial file if the write loop errors or this future
        // is dropped before the body is fully received (e.g. the socket
        // timeout firing mid-upload); disarmed once the write is complete.
        let mut guard = StageFileGuard {
            path: &path,
            disarmed: false,
        };

        let mut size: u64 = 0;
        let mut buffered = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(io::Error::other)?;
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
            buffered.extend_from_slice(&chunk);
        }
        file.flush().await?;

        guard.disarmed = true;
        Ok(StageOutcome::Accepted {
            size,
            bytes: buffered.freeze(),
        })
    }

    /// Checks `size` against the per-entry cap and the pending-byte budget,
    /// reserving the budget on success. Callers that get `Err` must still
    /// unlink the spool file themselves (no upload will be launched).
    pub fn try_admit(&self, size: u64) -> Result<(), AdmitOutcome> {
        if self.max_entry_size != 0 && size > self.max_entry_size {
            return Err(AdmitOutcome::TooLarge);
        }

        loop {
            let current = self.pending_bytes.load(Ordering::Acquire);
            if current.saturating_add(size) > self.max_pending_bytes {
                return Err(AdmitOutcome::BudgetExceeded);
            }
            if self
                .pending_bytes
                .compare_exchange(current, current + size, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Reads the spooled file and uploads it, reporting the outcome to
    /// `breaker`, then unconditionally releases `size` from the pending
    /// budget and unlinks the spool file. Called whether the router is
    /// awaiting this directly (sync upload) or it runs detached (async
    /// upload) — the budget/spool-file cleanup contract is identical either
    /// way, including when this future is cancelled mid-upload (the socket
    /// timeout dropping a synchronous-upload request): the guard's `Drop`
    /// runs regardless of how the future stops executing.
    pub async fn upload_and_finish(
        &self,
        path: &Path,
        size: u64,
        store: &dyn ObjectStoreClient,
        bucket: &str,
        object_key: &str,
        breaker: &CircuitBreaker,
    ) -> Result<(), StoreError> {
        let _guard = UploadGuard {
            pending_bytes: &self.pending_bytes,
            size,
            path,
        };

        let result = self.do_upload(path, store, bucket, object_key).await;

        match &result {
            Ok(()) => breaker.on_success(),
            Err(e) if e.counts_toward_breaker() => breaker.on_error(),
            Err(_) => {}
        }

        result
    }

    async fn do_upload(
        &self,
        path: &Path,
        store: &dyn ObjectStoreClient,
        bucket: &str,
        object_key: &str,
    ) -> Result<(), StoreError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| StoreError::Other {
            status: None,
            retryable: false,
            message: format!("failed to read spool file: {e}"),
        })?;
        store.put_object(bucket, object_key, Bytes::from(bytes)).await
    }

    /// Deletes the entire spool directory tree. Called on startup (to clear
    /// leftovers from a prior run) and on shutdown.
    pub async fn purge_all(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/**
 * Copyright (c) 2024-2025 MAAS Developers.
 *
 * This file is part of MAAS Agent
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */
use std::collections::HashSet;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

// the index starts small and doubles on demand,
// the real bound is total bytes, not entry count
const INITIAL_INDEX_CAPACITY: usize = 40;

const CACHE_DIR_MODE: u32 = 0o750;
const CACHE_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("max cache size must be positive")]
    NonPositiveMaxSize,
    #[error("cache directory must be provided")]
    MissingCacheDir,
    #[error("cache size exceeded")]
    SizeExceeded,
    #[error("declared size is negative")]
    NegativeSize,
    #[error("key already exists")]
    KeyExists,
    #[error("set already in progress for this key")]
    SetInProgress,
    #[error("key does not exist")]
    KeyNotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
    // a failed write whose cleanup also failed, both sides are kept
    #[error("{source}; cleanup failed: {cleanup}")]
    CleanupFailed {
        source: Box<CacheError>,
        cleanup: io::Error,
    },
}

// index and byte accounting, guarded by a single short-held mutex
#[derive(Debug)]
struct CacheState {
    index: LruCache<String, PathBuf>,
    size: i64,
    // keys with a write currently running, the dedup primitive
    progress: HashSet<String>,
}

/// Counters exposed for observation, sampled lock-free.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub size: i64,
    pub max_size: i64,
    pub entries: u64,
}

/// Size-bounded on-disk store of opaque blobs keyed by path-safe strings.
///
/// Entries are plain files under the cache directory. Inserts stream from a
/// reader, evicting least-recently-used entries until the declared size fits.
/// Concurrent inserts of the same key fail fast instead of waiting.
#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
    max_size: i64,
    state: Mutex<CacheState>,
    // lock-free mirrors of the guarded counters
    size: AtomicI64,
    entries: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl FileCache {
    /// Opens the cache rooted at `dir`, creating the directory when absent
    /// and re-indexing any files left behind by a previous run.
    pub fn new(max_size: i64, dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if max_size <= 0 {
            return Err(CacheError::NonPositiveMaxSize);
        }
        if dir.as_os_str().is_empty() {
            return Err(CacheError::MissingCacheDir);
        }

        let cache = FileCache {
            dir: dir.clone(),
            max_size,
            state: Mutex::new(CacheState {
                index: LruCache::new(nonzero(INITIAL_INDEX_CAPACITY)),
                size: 0,
                progress: HashSet::new(),
            }),
            size: AtomicI64::new(0),
            entries: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        };

        if !dir.exists() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(CACHE_DIR_MODE);
            }
            builder.create(&dir)?;
            return Ok(cache);
        }

        cache.reindex()?;
        Ok(cache)
    }

    // walk a pre-existing directory and rebuild the index from disk,
    // existing content beyond the byte budget aborts the whole open
    fn reindex(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            state.size += meta.len() as i64;
            if state.size > self.max_size {
                return Err(CacheError::SizeExceeded);
            }
            Self::index_put(&mut state, key, entry.path());
        }
        self.size.store(state.size, Relaxed);
        self.entries.store(state.index.len() as u64, Relaxed);
        debug!(
            size = state.size,
            entries = state.index.len(),
            dir = %self.dir.display(),
            "re-indexed existing cache directory",
        );
        Ok(())
    }

    /// Streams `declared_size` bytes from `reader` into the cache under `key`.
    ///
    /// The bytes are fsynced before the key becomes visible. Any failure
    /// removes the partial file and refunds its reserved size.
    pub async fn set<R>(
        &self,
        key: &str,
        mut reader: R,
        declared_size: i64,
    ) -> Result<(), CacheError>
    where
        R: AsyncRead + Unpin,
    {
        if declared_size < 0 {
            return Err(CacheError::NegativeSize);
        }
        if declared_size > self.max_size {
            return Err(CacheError::SizeExceeded);
        }

        let path = self.dir.join(key);
        {
            let mut state = self.state.lock();
            if state.progress.contains(key) {
                return Err(CacheError::SetInProgress);
            }
            if state.index.contains(key) {
                return Err(CacheError::KeyExists);
            }
            self.evict_for(&mut state, declared_size)?;
            // reserve the declared size up front so concurrent writers
            // cannot overcommit the byte budget
            state.progress.insert(key.to_string());
            state.size += declared_size;
            self.size.store(state.size, Relaxed);
        }

        match self.write_entry(&path, &mut reader, declared_size).await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.progress.remove(key);
                Self::index_put(&mut state, key.to_string(), path);
                self.entries.store(state.index.len() as u64, Relaxed);
                Ok(())
            }
            Err(err) => {
                self.errors.fetch_add(1, Relaxed);
                let cleanup = match std::fs::remove_file(&path) {
                    Ok(()) => None,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    Err(e) => Some(e),
                };
                let mut state = self.state.lock();
                state.progress.remove(key);
                state.size -= declared_size;
                self.size.store(state.size, Relaxed);
                drop(state);
                match cleanup {
                    None => Err(err),
                    Some(cleanup) => Err(CacheError::CleanupFailed {
                        source: Box::new(err),
                        cleanup,
                    }),
                }
            }
        }
    }

    // the disk half of set, runs without the state lock held
    async fn write_entry<R>(
        &self,
        path: &PathBuf,
        reader: &mut R,
        declared_size: i64,
    ) -> Result<(), CacheError>
    where
        R: AsyncRead + Unpin,
    {
        let mut open = OpenOptions::new();
        open.write(true).create(true).truncate(true);
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(CACHE_FILE_MODE);
        }
        let mut file = open.open(path).await?;

        let written = tokio::io::copy(&mut reader.take(declared_size as u64), &mut file).await?;
        if written != declared_size as u64 {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short write: got {written} of {declared_size} bytes"),
            )));
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Returns an open handle to the cached file, promoting the key to
    /// most-recently-used.
    pub async fn get(&self, key: &str) -> Result<File, CacheError> {
        let path = {
            let mut state = self.state.lock();
            match state.index.get(key) {
                Some(path) => path.clone(),
                None => {
                    self.misses.fetch_add(1, Relaxed);
                    return Err(CacheError::KeyNotFound);
                }
            }
        };
        match File::open(&path).await {
            Ok(file) => {
                self.hits.fetch_add(1, Relaxed);
                Ok(file)
            }
            Err(err) => {
                self.errors.fetch_add(1, Relaxed);
                Err(CacheError::Io(err))
            }
        }
    }

    // drop least-recently-used entries until `incoming` bytes fit
    fn evict_for(&self, state: &mut CacheState, incoming: i64) -> Result<(), CacheError> {
        while state.size + incoming > self.max_size {
            let (key, path) = match state.index.pop_lru() {
                Some(entry) => entry,
                None => return Err(CacheError::SizeExceeded),
            };
            let len = match std::fs::metadata(&path) {
                Ok(meta) => meta.len() as i64,
                Err(err) => {
                    warn!(key, error = %err, "evicted entry already missing on disk");
                    0
                }
            };
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    // put the entry back so the index stays honest
                    Self::index_put(state, key, path);
                    return Err(CacheError::Io(err));
                }
            }
            state.size -= len;
            self.size.store(state.size, Relaxed);
            self.entries.store(state.index.len() as u64, Relaxed);
            debug!(key, freed = len, "evicted cache entry");
        }
        Ok(())
    }

    // insert into the lru index, doubling its capacity on the put that
    // would overflow it
    fn index_put(state: &mut CacheState, key: String, path: PathBuf) {
        let cap = state.index.cap().get();
        if state.index.len() >= cap {
            state.index.resize(nonzero(cap * 2));
        }
        state.index.put(key, path);
    }

    pub fn size(&self) -> i64 {
        self.size.load(Relaxed)
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Relaxed),
            misses: self.misses.load(Relaxed),
            errors: self.errors.load(Relaxed),
            size: self.size.load(Relaxed),
            max_size: self.max_size,
            entries: self.entries.load(Relaxed),
        }
    }
}

fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    async fn read_back(cache: &FileCache, key: &str) -> Vec<u8> {
        let mut file = cache.get(key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn rejects_non_positive_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileCache::new(0, dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::NonPositiveMaxSize));
        let err = FileCache::new(-5, dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::NonPositiveMaxSize));
    }

    #[test]
    fn rejects_empty_dir() {
        let err = FileCache::new(1024, "").unwrap_err();
        assert!(matches!(err, CacheError::MissingCacheDir));
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("httpproxy-cache");
        let cache = FileCache::new(1024, &nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(1024, dir.path()).unwrap();
        cache.set("boot", &b"hello world"[..], 11).await.unwrap();
        assert_eq!(read_back(&cache, "boot").await, b"hello world");
        assert_eq!(cache.size(), 11);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn get_missing_key_counts_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(1024, dir.path()).unwrap();
        let err = cache.get("nope").await.unwrap_err();
        assert!(matches!(err, CacheError::KeyNotFound));
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn rejects_negative_and_oversized_items() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(8, dir.path()).unwrap();
        let err = cache.set("a", &b""[..], -1).await.unwrap_err();
        assert!(matches!(err, CacheError::NegativeSize));
        let err = cache.set("a", &b"123456789"[..], 9).await.unwrap_err();
        assert!(matches!(err, CacheError::SizeExceeded));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(1024, dir.path()).unwrap();
        cache.set("k", &b"one"[..], 3).await.unwrap();
        let err = cache.set("k", &b"two"[..], 3).await.unwrap_err();
        assert!(matches!(err, CacheError::KeyExists));
    }

    #[tokio::test]
    async fn evicts_least_recently_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(10, dir.path()).unwrap();
        cache.set("a", &b"aaaa"[..], 4).await.unwrap();
        cache.set("b", &b"bbbb"[..], 4).await.unwrap();
        // touch "a" so that "b" is the eviction candidate
        let _ = cache.get("a").await.unwrap();
        cache.set("c", &b"cccc"[..], 4).await.unwrap();
        assert!(cache.get("a").await.is_ok());
        assert!(matches!(
            cache.get("b").await.unwrap_err(),
            CacheError::KeyNotFound
        ));
        assert!(cache.get("c").await.is_ok());
        assert!(cache.size() <= 10);
        assert!(!dir.path().join("b").exists());
    }

    #[tokio::test]
    async fn reindexes_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old"), b"0123456789").unwrap();
        let cache = FileCache::new(1024, dir.path()).unwrap();
        assert_eq!(cache.size(), 10);
        assert_eq!(read_back(&cache, "old").await, b"0123456789");
    }

    #[test]
    fn reindex_over_budget_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big"), vec![0u8; 64]).unwrap();
        let err = FileCache::new(32, dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::SizeExceeded));
    }

    #[tokio::test]
    async fn failed_set_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(1024, dir.path()).unwrap();
        // reader ends before the declared size is reached
        let err = cache.set("partial", &b"abc"[..], 10).await.unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        assert_eq!(cache.size(), 0);
        assert!(!dir.path().join("partial").exists());
        // the key is free again for a fresh insert
        cache.set("partial", &b"0123456789"[..], 10).await.unwrap();
        assert_eq!(cache.size(), 10);
    }

    #[tokio::test]
    async fn concurrent_set_same_key_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = std::sync::Arc::new(FileCache::new(1024, dir.path()).unwrap());
        // hold the first insert open by withholding its final bytes
        let (mut tx, rx) = tokio::io::duplex(64);
        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.set("blob", rx, 8).await })
        };
        tx.write_all(b"1234").await.unwrap();
        // give the first writer time to register its in-flight marker
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = cache.set("blob", &b"xxxxxxxx"[..], 8).await.unwrap_err();
        assert!(matches!(err, CacheError::SetInProgress));
        tx.write_all(b"5678").await.unwrap();
        drop(tx);
        first.await.unwrap().unwrap();
        assert_eq!(read_back(&cache, "blob").await, b"12345678");
    }

    #[tokio::test]
    async fn index_capacity_doubles_past_initial_bound() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(10_000, dir.path()).unwrap();
        for i in 0..INITIAL_INDEX_CAPACITY + 5 {
            let key = format!("k{i}");
            cache.set(&key, &b"x"[..], 1).await.unwrap();
        }
        assert_eq!(cache.stats().entries as usize, INITIAL_INDEX_CAPACITY + 5);
        assert_eq!(cache.size(), (INITIAL_INDEX_CAPACITY + 5) as i64);
    }
}

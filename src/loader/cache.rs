//! Metadata Cache
//!
//! Descriptor cache keyed by absolute artifact path. An entry is only served
//! while the artifact's `(size, mtime, digest)` identity is unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::PluginResult;
use crate::plugin::handle::{self, Artifact};
use crate::plugin::metadata::PluginMetadata;

/// Cache counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    pub enabled: bool,
}

struct CacheEntry {
    artifact: Artifact,
    metadata: PluginMetadata,
    last_used: AtomicU64,
}

/// LRU descriptor cache
pub struct MetadataCache {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    enabled: AtomicBool,
    max_size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    tick: AtomicU64,
}

impl MetadataCache {
    pub fn new(enabled: bool, max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(enabled),
            max_size: AtomicUsize::new(max_size.max(1)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tick: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Look up the descriptor for `path`.
    ///
    /// A changed `(size, mtime)` forces a digest recomputation; if the digest
    /// still matches the entry is refreshed and served, otherwise it is
    /// dropped and the lookup is a miss.
    pub fn lookup(&self, path: &Path) -> PluginResult<Option<(Artifact, PluginMetadata)>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let (size, mtime) = handle::stat(path)?;
        let stale_digest = {
            let entries = self.entries.read();
            match entries.get(path) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(entry) if entry.artifact.matches_stat(size, mtime) => {
                    entry.last_used.store(self.next_tick(), Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some((entry.artifact.clone(), entry.metadata.clone())));
                }
                Some(entry) => entry.artifact.content_digest.clone(),
            }
        };

        let digest = handle::digest_file(path)?;
        let mut entries = self.entries.write();
        if digest == stale_digest {
            if let Some(entry) = entries.get_mut(path) {
                entry.artifact.size = size;
                entry.artifact.mtime = mtime;
                entry.last_used.store(self.next_tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                log::debug!("Metadata cache refreshed for {}", path.display());
                return Ok(Some((entry.artifact.clone(), entry.metadata.clone())));
            }
        } else {
            entries.remove(path);
            log::debug!("Metadata cache invalidated for {}", path.display());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Insert or replace an entry, evicting the least recently used above capacity
    pub fn insert(&self, artifact: Artifact, metadata: PluginMetadata) {
        if !self.is_enabled() {
            return;
        }
        let max = self.max_size.load(Ordering::Relaxed);
        let mut entries = self.entries.write();
        if !entries.contains_key(&artifact.file_path) {
            while entries.len() >= max {
                if !Self::evict_one(&mut entries) {
                    break;
                }
            }
        }
        entries.insert(
            artifact.file_path.clone(),
            CacheEntry {
                artifact,
                metadata,
                last_used: AtomicU64::new(self.next_tick()),
            },
        );
    }

    fn evict_one(entries: &mut HashMap<PathBuf, CacheEntry>) -> bool {
        let victim = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
            .map(|(path, _)| path.clone());
        match victim {
            Some(path) => {
                log::debug!("Metadata cache evicted {}", path.display());
                entries.remove(&path);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.entries.write().remove(path).is_some()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.read().contains_key(path)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Disabling clears all entries under the writer lock
    pub fn set_enabled(&self, enabled: bool) {
        let mut entries = self.entries.write();
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            entries.clear();
        }
    }

    pub fn set_max_size(&self, max_size: usize) {
        let max = max_size.max(1);
        self.max_size.store(max, Ordering::Relaxed);
        let mut entries = self.entries.write();
        while entries.len() > max {
            if !Self::evict_one(&mut entries) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: self.len(),
            max_size: self.max_size.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn artifact_file(dir: &TempDir, name: &str, contents: &[u8]) -> Artifact {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        Artifact::inspect(&path).unwrap()
    }

    fn meta(id: &str) -> PluginMetadata {
        PluginMetadata::new(id, Version::new(1, 0, 0))
    }

    fn set_mtime(path: &Path, mtime: SystemTime) {
        File::options().write(true).open(path).unwrap().set_modified(mtime).unwrap();
    }

    #[test]
    fn test_hit_and_miss() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::new(true, 8);
        let artifact = artifact_file(&dir, "a.plugin", b"a");
        let path = artifact.file_path.clone();

        assert!(cache.lookup(&path).unwrap().is_none());
        cache.insert(artifact, meta("a"));
        let (_, cached) = cache.lookup(&path).unwrap().unwrap();
        assert_eq!(cached, meta("a"));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_touch_with_same_digest_refreshes() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::new(true, 8);
        let artifact = artifact_file(&dir, "a.plugin", b"same");
        let path = artifact.file_path.clone();
        cache.insert(artifact.clone(), meta("a"));

        set_mtime(&path, artifact.mtime + Duration::from_secs(5));
        let (refreshed, _) = cache.lookup(&path).unwrap().unwrap();
        assert_eq!(refreshed.mtime, artifact.mtime + Duration::from_secs(5));
        assert_eq!(refreshed.content_digest, artifact.content_digest);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_changed_contents_invalidate() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::new(true, 8);
        let artifact = artifact_file(&dir, "a.plugin", b"one");
        let path = artifact.file_path.clone();
        cache.insert(artifact, meta("a"));

        std::fs::write(&path, b"two!").unwrap();
        assert!(cache.lookup(&path).unwrap().is_none());
        assert!(!cache.contains(&path));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::new(true, 2);
        let a = artifact_file(&dir, "a.plugin", b"a");
        let b = artifact_file(&dir, "b.plugin", b"b");
        let c = artifact_file(&dir, "c.plugin", b"c");
        cache.insert(a.clone(), meta("a"));
        cache.insert(b.clone(), meta("b"));
        // touch a so b becomes least recently used
        cache.lookup(&a.file_path).unwrap();
        cache.insert(c.clone(), meta("c"));

        assert!(cache.contains(&a.file_path));
        assert!(!cache.contains(&b.file_path));
        assert!(cache.contains(&c.file_path));

        cache.set_max_size(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&c.file_path));
    }

    #[test]
    fn test_disable_clears() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::new(true, 4);
        let a = artifact_file(&dir, "a.plugin", b"a");
        cache.insert(a.clone(), meta("a"));
        cache.set_enabled(false);
        assert!(cache.is_empty());
        assert!(cache.lookup(&a.file_path).unwrap().is_none());
        cache.insert(a, meta("a"));
        assert!(cache.is_empty());
    }
}

//! Persistent SHA1 cache: `cache-key TAB blob-sha`, one entry per line.
//!
//! Keys on `(gitattributes-tree, file-path, source-hash, format-spec-hash)`
//! so re-running a conversion with unchanged content transformers never
//! re-runs them just to re-derive a blob hash it already knows. Grounded on
//! the teacher's `db/mod.rs` (`Mutex`-wrapped handle, poison-recovery via
//! `poisoned.into_inner()`, explicit open/flush lifecycle) but as a flat
//! line-oriented file instead of SQLite — the on-disk format here is fixed
//! and simple enough that a database would be over-engineering it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

/// The four components a cache entry is keyed on, joined with `\0`
/// into a single line-safe string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub gitattributes_tree: String,
    pub file_path: String,
    pub source_hash: String,
    pub format_spec_hash: String,
}

impl CacheKey {
    fn encode(&self) -> String {
        format!(
            "{}\0{}\0{}\0{}",
            self.gitattributes_tree, self.file_path, self.source_hash, self.format_spec_hash
        )
    }

    fn decode(s: &str) -> Option<Self> {
        let mut parts = s.split('\0');
        Some(Self {
            gitattributes_tree: parts.next()?.to_string(),
            file_path: parts.next()?.to_string(),
            source_hash: parts.next()?.to_string(),
            format_spec_hash: parts.next()?.to_string(),
        })
    }
}

/// Line-oriented `cache-key TAB blob-sha` persistent cache, shared across
/// blob-stage workers behind a `Mutex` so `Sha1Cache` is `Send + Sync` and
/// usable from inside an `Arc`.
pub struct Sha1Cache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, String>>,
    dirty: Mutex<bool>,
}

impl Sha1Cache {
    /// Opens (or starts fresh, if absent) the cache file at `path`.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();
        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    match line.split_once('\t') {
                        Some((key, sha)) => {
                            entries.insert(key.to_string(), sha.to_string());
                        }
                        None => warn!(line, "malformed sha1-map line, skipping"),
                    }
                }
                info!(path = %path.display(), count = entries.len(), "loaded sha1 cache");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no existing sha1 cache, starting empty");
            }
            Err(e) => return Err(e),
        }
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
            dirty: Mutex::new(false),
        })
    }

    /// An in-memory cache with no backing file — never persisted, used when
    /// `--sha1-map` was not passed.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
            dirty: Mutex::new(false),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("sha1 cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<String> {
        self.lock_entries().get(&key.encode()).cloned()
    }

    /// Insert-once: a second insert under the same key is a no-op rather
    /// than an overwrite, matching the blob memo table's semantics.
    pub fn insert(&self, key: CacheKey, blob_sha: String) {
        let encoded = key.encode();
        let mut entries = self.lock_entries();
        if entries.contains_key(&encoded) {
            return;
        }
        entries.insert(encoded, blob_sha);
        drop(entries);
        *self.dirty.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the cache to disk if it has a backing path and has changed
    /// since the last flush. Rewrites the whole file; the cache is small
    /// enough (one line per distinct blob) that append-only drift isn't
    /// worth the bookkeeping.
    pub fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut dirty = self.dirty.lock().unwrap_or_else(|p| p.into_inner());
        if !*dirty {
            return Ok(());
        }
        let entries = self.lock_entries();
        let mut file = File::create(path)?;
        for (key, sha) in entries.iter() {
            writeln!(file, "{key}\t{sha}")?;
        }
        *dirty = false;
        info!(path = %path.display(), count = entries.len(), "flushed sha1 cache");
        Ok(())
    }

    /// Iterates decoded keys, for diagnostics.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.lock_entries()
            .keys()
            .filter_map(|s| CacheKey::decode(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> CacheKey {
        CacheKey {
            gitattributes_tree: "tree1".into(),
            file_path: format!("a/{n}.txt"),
            source_hash: "src".into(),
            format_spec_hash: "fmt".into(),
        }
    }

    #[test]
    fn insert_once_ignores_second_write() {
        let cache = Sha1Cache::in_memory();
        cache.insert(key("x"), "sha-a".into());
        cache.insert(key("x"), "sha-b".into());
        assert_eq!(cache.get(&key("x")), Some("sha-a".to_string()));
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sha1-map");
        {
            let cache = Sha1Cache::open(&path).unwrap();
            cache.insert(key("a"), "deadbeef".into());
            cache.insert(key("b"), "cafef00d".into());
            cache.flush().unwrap();
        }
        let reopened = Sha1Cache::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&key("a")), Some("deadbeef".to_string()));
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Sha1Cache::open(dir.path().join("does-not-exist")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn in_memory_flush_is_a_no_op() {
        let cache = Sha1Cache::in_memory();
        cache.insert(key("a"), "sha".into());
        cache.flush().unwrap();
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sha1-map");
        std::fs::write(&path, "not-a-valid-line\nvalid-key\tvalid-sha\n").unwrap();
        let cache = Sha1Cache::open(&path).unwrap();
        assert_eq!(cache.len(), 1);
    }
}

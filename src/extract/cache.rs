// src/extract/cache.rs
//! Response cache keyed by `(content_hash, kind)`: in-memory map with an optional JSON file
//! per entry on disk, so identical content skips the capability across restarts too.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::ExtractionKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    stored_at: DateTime<Utc>,
    value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    mem: RwLock<HashMap<(String, ExtractionKind), CacheEntry>>,
    dir: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Memory + disk. The directory is created best-effort.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cache dir unavailable, memory only");
            return Self::default();
        }
        Self {
            dir: Some(dir),
            ..Self::default()
        }
    }

    pub fn get(&self, hash: &str, kind: ExtractionKind) -> Option<Value> {
        let key = (hash.to_string(), kind);
        let found = self
            .mem
            .read()
            .ok()
            .and_then(|m| m.get(&key).map(|e| e.value.clone()));
        let found = found.or_else(|| {
            let entry = read_cache_file(self.dir.as_deref()?, hash, kind)?;
            let value = entry.value.clone();
            if let Ok(mut m) = self.mem.write() {
                m.insert(key, entry);
            }
            Some(value)
        });

        match &found {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("extraction_cache_hits_total", "kind" => kind.as_str()).increment(1);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    pub fn put(&self, hash: &str, kind: ExtractionKind, value: Value) {
        let entry = CacheEntry {
            stored_at: Utc::now(),
            value,
        };
        if let Some(dir) = &self.dir {
            if let Err(e) = write_cache_file(dir, hash, kind, &entry) {
                warn!(error = %e, kind = kind.as_str(), "cache write failed");
            }
        }
        if let Ok(mut m) = self.mem.write() {
            m.insert((hash.to_string(), kind), entry);
        }
    }

    /// Drop entries stored before `cutoff`, in memory and on disk. Returns how many were
    /// removed (disk files counted once even when also in memory).
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        if let Ok(mut m) = self.mem.write() {
            let before = m.len();
            m.retain(|_, e| e.stored_at >= cutoff);
            removed = before - m.len();
        }
        if let Some(dir) = &self.dir {
            let disk = purge_dir(dir, cutoff).unwrap_or_else(|e| {
                warn!(error = %e, "cache purge failed");
                0
            });
            removed = removed.max(disk);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.mem.read().map(|m| m.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn cache_path(dir: &Path, hash: &str, kind: ExtractionKind) -> PathBuf {
    dir.join(format!("{hash}.{}.json", kind.as_str()))
}

fn read_cache_file(dir: &Path, hash: &str, kind: ExtractionKind) -> Option<CacheEntry> {
    let s = fs::read_to_string(cache_path(dir, hash, kind)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_cache_file(
    dir: &Path,
    hash: &str,
    kind: ExtractionKind,
    entry: &CacheEntry,
) -> io::Result<()> {
    let path = cache_path(dir, hash, kind);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(entry).map_err(io::Error::other)?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(json.as_bytes())?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn purge_dir(dir: &Path, cutoff: DateTime<Utc>) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stale = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<CacheEntry>(&s).ok())
            .map(|e| e.stored_at < cutoff)
            .unwrap_or(true);
        if stale {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_hit_and_miss_are_counted() {
        let c = ResponseCache::in_memory();
        assert!(c.get("h", ExtractionKind::AnalyzeContent).is_none());
        c.put("h", ExtractionKind::AnalyzeContent, json!({"title": "t"}));
        assert_eq!(c.get("h", ExtractionKind::AnalyzeContent), Some(json!({"title": "t"})));
        assert!(c.get("h", ExtractionKind::ExtractEntities).is_none());
        let s = c.stats();
        assert_eq!((s.entries, s.hits, s.misses), (1, 1, 2));
    }

    #[test]
    fn purge_drops_everything_before_cutoff() {
        let c = ResponseCache::in_memory();
        c.put("h", ExtractionKind::ClassifyPage, json!({"is_listing": false}));
        assert_eq!(c.purge_older_than(Utc::now() - chrono::Duration::days(1)), 0);
        assert_eq!(c.purge_older_than(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert_eq!(c.stats().entries, 0);
    }
}

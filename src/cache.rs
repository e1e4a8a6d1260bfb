//! On-disk copy of the latest fresh snapshot per stop.
//!
//! The file is a JSON object keyed by stop code. Writes go to a sibling
//! `.tmp` file that is then renamed over the original.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::model::StopSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub cached_at: DateTime<Utc>,
    pub snapshot: StopSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub total_entries: usize,
    pub valid_entries: usize,
    pub oldest_age_minutes: Option<f64>,
}

impl CacheInfo {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: None,
            total_entries: 0,
            valid_entries: 0,
            oldest_age_minutes: None,
        }
    }
}

#[derive(Debug)]
pub struct SnapshotCache {
    path: PathBuf,
    max_age: TimeDelta,
    entries: BTreeMap<String, CachedSnapshot>,
    dirty: bool,
}

impl SnapshotCache {
    /// Opens the cache at `path`, keeping entries younger than `max_age`.
    /// An unreadable file is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>, max_age: Duration, now: DateTime<Utc>) -> Self {
        let path = path.into();
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);

        let entries = match load(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load cache, starting empty");
                BTreeMap::new()
            }
        };
        let total = entries.len();
        let entries: BTreeMap<_, _> = entries
            .into_iter()
            .filter(|(stop_code, entry)| {
                let fresh = now - entry.cached_at <= max_age;
                if !fresh {
                    debug!(%stop_code, cached_at = %entry.cached_at, "Discarding expired cache entry");
                }
                fresh
            })
            .collect();
        if total > 0 {
            info!(loaded = entries.len(), expired = total - entries.len(), "Loaded snapshot cache");
        }

        Self {
            path,
            max_age,
            dirty: entries.len() != total,
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_valid(&self, entry: &CachedSnapshot, now: DateTime<Utc>) -> bool {
        now - entry.cached_at <= self.max_age
    }

    /// The cached snapshot for `stop_code`, if it has not expired.
    pub fn get(&self, stop_code: &str, now: DateTime<Utc>) -> Option<&CachedSnapshot> {
        self.entries
            .get(stop_code)
            .filter(|entry| self.is_valid(entry, now))
    }

    pub fn insert(&mut self, snapshot: StopSnapshot, now: DateTime<Utc>) {
        self.entries.insert(
            snapshot.stop_code.clone(),
            CachedSnapshot {
                cached_at: now,
                snapshot,
            },
        );
        self.dirty = true;
    }

    /// Removes one stop's entry, or every entry. Returns how many were removed.
    pub fn clear(&mut self, stop_code: Option<&str>) -> usize {
        let removed = match stop_code {
            Some(code) => usize::from(self.entries.remove(code).is_some()),
            None => {
                let n = self.entries.len();
                self.entries.clear();
                n
            }
        };
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Writes the cache to disk if it changed since the last write.
    pub fn persist(&mut self) -> Result<(), CacheError> {
        match self.pending_write()? {
            Some(write) => write.commit().inspect_err(|_| self.dirty = true),
            None => Ok(()),
        }
    }

    /// Serializes the entries if they changed since the last write. The
    /// returned write can be committed off the async runtime; if it fails,
    /// call [`SnapshotCache::mark_dirty`] so the next write retries.
    pub fn pending_write(&mut self) -> Result<Option<PendingWrite>, CacheError> {
        if !self.dirty {
            return Ok(None);
        }
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        self.dirty = false;
        Ok(Some(PendingWrite {
            path: self.path.clone(),
            bytes,
            entries: self.entries.len(),
        }))
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn info(&self, now: DateTime<Utc>) -> CacheInfo {
        let oldest = self.entries.values().map(|e| e.cached_at).min();
        CacheInfo {
            enabled: true,
            path: Some(self.path.clone()),
            total_entries: self.entries.len(),
            valid_entries: self
                .entries
                .values()
                .filter(|e| self.is_valid(e, now))
                .count(),
            oldest_age_minutes: oldest.map(|at| (now - at).num_seconds() as f64 / 60.0),
        }
    }
}

/// A serialized cache waiting to be written to disk.
#[derive(Debug)]
pub struct PendingWrite {
    path: PathBuf,
    bytes: Vec<u8>,
    entries: usize,
}

impl PendingWrite {
    /// Blocking write through a sibling `.tmp` file and rename.
    pub fn commit(self) -> Result<(), CacheError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &self.bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = self.entries, "Persisted snapshot cache");
        Ok(())
    }
}

fn load(path: &Path) -> Result<BTreeMap<String, CachedSnapshot>, CacheError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopConfig;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
    }

    fn snapshot(code: &str) -> StopSnapshot {
        StopSnapshot::fresh(&StopConfig::new(code), "SF", Vec::new(), now())
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("muni_times_cache_test_{name}"));
        let _ = fs::remove_dir_all(&dir);
        dir.join("transit_data.json")
    }

    #[test]
    fn test_persist_and_reload() {
        let path = temp_path("reload");
        let mut cache = SnapshotCache::open(&path, Duration::from_secs(1800), now());
        cache.insert(snapshot("13543"), now());
        cache.insert(snapshot("15184"), now());
        cache.persist().unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reopened = SnapshotCache::open(&path, Duration::from_secs(1800), now() + TimeDelta::minutes(5));
        let entry = reopened.get("13543", now() + TimeDelta::minutes(5)).unwrap();
        assert_eq!(entry.snapshot, snapshot("13543"));
        assert_eq!(reopened.info(now()).total_entries, 2);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let path = temp_path("expiry");
        let mut cache = SnapshotCache::open(&path, Duration::from_secs(1800), now());
        cache.insert(snapshot("13543"), now());
        cache.persist().unwrap();

        assert!(cache.get("13543", now() + TimeDelta::minutes(31)).is_none());
        let info = cache.info(now() + TimeDelta::minutes(31));
        assert_eq!((info.total_entries, info.valid_entries), (1, 0));

        let reopened = SnapshotCache::open(&path, Duration::from_secs(1800), now() + TimeDelta::minutes(31));
        assert_eq!(reopened.info(now()).total_entries, 0);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let path = temp_path("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        let cache = SnapshotCache::open(&path, Duration::from_secs(1800), now());
        assert_eq!(cache.info(now()).total_entries, 0);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_pending_write_only_when_changed() {
        let path = temp_path("pending");
        let mut cache = SnapshotCache::open(&path, Duration::from_secs(1800), now());
        assert!(cache.pending_write().unwrap().is_none());

        cache.insert(snapshot("13543"), now());
        let write = cache.pending_write().unwrap().unwrap();
        assert!(cache.pending_write().unwrap().is_none());
        write.commit().unwrap();
        assert!(path.exists());

        cache.mark_dirty();
        assert!(cache.pending_write().unwrap().is_some());

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_clear_one_or_all() {
        let path = temp_path("clear");
        let mut cache = SnapshotCache::open(&path, Duration::from_secs(1800), now());
        cache.insert(snapshot("13543"), now());
        cache.insert(snapshot("15184"), now());

        assert_eq!(cache.clear(Some("13543")), 1);
        assert_eq!(cache.clear(Some("13543")), 0);
        assert_eq!(cache.clear(None), 1);
        assert!(cache.get("15184", now()).is_none());
    }
}

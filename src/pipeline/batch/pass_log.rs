//! Per-client record of pages that already cleared confidence checks.
//!
//! Stored as `<dir>/<client>.json`, a map of document key to page numbers.
//! The log only grows. Merges hold `<dir>/<client>.lock` for the whole
//! read-modify-write and replace the file atomically. The lock records its
//! owner's pid and acquisition time; a lock older than a minute is left over
//! from a crashed run and is broken.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PipelineError;
use crate::pipeline::template::safe_client_id;

pub type PassLog = BTreeMap<String, BTreeSet<usize>>;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
const LOCK_ATTEMPTS: u32 = 100;
/// Merges take milliseconds; a lock this old outlived its process.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

/// Contents of a lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Key a document by its file stem: lowercased, whitespace runs become `_`.
pub fn document_key(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

pub struct PassLogStore {
    dir: PathBuf,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release pass log lock");
        }
    }
}

impl PassLogStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, client: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_client_id(client)))
    }

    fn lock_path(&self, client: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", safe_client_id(client)))
    }

    /// Current log for `client`; empty when none has been written yet.
    pub fn load(&self, client: &str) -> Result<PassLog, PipelineError> {
        let path = self.log_path(client);
        if !path.is_file() {
            return Ok(PassLog::new());
        }
        let bytes = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Union `additions` into the stored log and return the merged result.
    pub fn merge(&self, client: &str, additions: &PassLog) -> Result<PassLog, PipelineError> {
        let _lock = self.acquire(client)?;

        let mut log = self.load(client)?;
        let before: usize = log.values().map(BTreeSet::len).sum();
        for (key, pages) in additions {
            log.entry(key.clone()).or_default().extend(pages.iter().copied());
        }
        let after: usize = log.values().map(BTreeSet::len).sum();

        if after != before || !self.log_path(client).is_file() {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(&serde_json::to_vec_pretty(&log)?)?;
            tmp.persist(self.log_path(client)).map_err(|e| PipelineError::Io(e.error))?;
        }

        info!(
            client,
            documents = log.len(),
            new_pages = after - before,
            "Pass log merged"
        );
        Ok(log)
    }

    fn acquire(&self, client: &str) -> Result<LockGuard, PipelineError> {
        let path = self.lock_path(client);
        for attempt in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let guard = LockGuard { path };
                    let owner = LockOwner {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    file.write_all(&serde_json::to_vec(&owner)?)?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if break_if_stale(&path)? {
                        continue;
                    }
                    debug!(client, attempt, "Pass log locked, retrying");
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::PassLogLocked(client.to_string()))
    }
}

/// Remove the lock at `path` if it is older than [`LOCK_STALE_AFTER`].
/// A lock without readable contents is aged by its modification time.
/// Returns `true` when the lock is gone and acquisition should retry at once.
fn break_if_stale(path: &Path) -> Result<bool, PipelineError> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    let owner: Option<LockOwner> = serde_json::from_slice(&contents).ok();
    let age = match &owner {
        Some(owner) => (Utc::now() - owner.acquired_at).to_std().unwrap_or_default(),
        None => match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        },
    };
    if age < LOCK_STALE_AFTER {
        return Ok(false);
    }

    warn!(
        lock = %path.display(),
        pid = ?owner.as_ref().map(|o| o.pid),
        age_secs = age.as_secs(),
        "Breaking stale pass log lock"
    );
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn additions(key: &str, pages: &[usize]) -> PassLog {
        let mut log = PassLog::new();
        log.insert(key.to_string(), pages.iter().copied().collect());
        log
    }

    #[test]
    fn keys_are_normalized_stems() {
        assert_eq!(document_key(Path::new("/in/Drawing  No 7.pdf")), "drawing_no_7");
        assert_eq!(document_key(Path::new("PART.json")), "part");
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        assert!(store.load("acme").unwrap().is_empty());
    }

    #[test]
    fn merges_are_unions() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        store.merge("acme", &additions("part", &[0, 2])).unwrap();
        let merged = store.merge("acme", &additions("part", &[1, 2])).unwrap();
        assert_eq!(merged["part"], BTreeSet::from([0, 1, 2]));
        assert_eq!(store.load("acme").unwrap(), merged);
        assert!(store.load("globex").unwrap().is_empty());
    }

    #[test]
    fn log_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        store.merge("acme", &additions("part", &[0, 1])).unwrap();
        let merged = store.merge("acme", &PassLog::new()).unwrap();
        assert_eq!(merged["part"], BTreeSet::from([0, 1]));
    }

    #[test]
    fn lock_is_released_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        store.merge("Acme Corp", &additions("part", &[0])).unwrap();
        assert!(!store.lock_path("Acme Corp").exists());
        assert!(dir.path().join("acme_corp.json").is_file());
    }

    #[test]
    fn lock_records_its_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        let guard = store.acquire("acme").unwrap();
        let owner: LockOwner =
            serde_json::from_slice(&std::fs::read(store.lock_path("acme")).unwrap()).unwrap();
        assert_eq!(owner.pid, std::process::id());
        drop(guard);
        assert!(!store.lock_path("acme").exists());
    }

    #[test]
    fn stale_lock_from_a_crashed_run_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        let crashed = LockOwner {
            pid: 999_999,
            acquired_at: Utc::now() - chrono::Duration::minutes(10),
        };
        std::fs::write(store.lock_path("acme"), serde_json::to_vec(&crashed).unwrap()).unwrap();

        let merged = store.merge("acme", &additions("part", &[0])).unwrap();
        assert_eq!(merged["part"], BTreeSet::from([0]));
        assert!(!store.lock_path("acme").exists());
    }

    #[test]
    fn old_unreadable_lock_is_broken_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        let lock = std::fs::File::create(store.lock_path("acme")).unwrap();
        lock.set_modified(std::time::SystemTime::now() - Duration::from_secs(600))
            .unwrap();
        drop(lock);

        store.merge("acme", &additions("part", &[1])).unwrap();
        assert!(!store.lock_path("acme").exists());
    }

    #[test]
    fn fresh_lock_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassLogStore::open(dir.path()).unwrap();
        let live = LockOwner {
            pid: 1,
            acquired_at: Utc::now(),
        };
        let path = store.lock_path("acme");
        std::fs::write(&path, serde_json::to_vec(&live).unwrap()).unwrap();
        assert!(!break_if_stale(&path).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn concurrent_merges_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let store = PassLogStore::open(root).unwrap();
                    store.merge("acme", &additions(&format!("doc{i}"), &[i])).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let log = PassLogStore::open(&root).unwrap().load("acme").unwrap();
        assert_eq!(log.len(), 4);
    }
}

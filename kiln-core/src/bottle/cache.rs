// kiln-core/src/bottle/cache.rs
// Content-verified store of precompiled kegs, one directory per key digest:
//
//   <cache>/bottles/<digest>/entry.json
//   <cache>/bottles/<digest>/bottle.tar.gz
//
// The manifest is published last, so an entry without one is incomplete
// and invisible to lookups.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::ArtifactRef;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::key::BottleKey;
use crate::checksum::{sha256_file, verify_checksum};

pub const MANIFEST_FILE: &str = "entry.json";
pub const ARTIFACT_FILE: &str = "bottle.tar.gz";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: BottleKey,
    pub sha256: String,
    pub file: String,
    pub stored_at: u64,
}

/// Shared across workers. Reads and writes of one key are serialized; the
/// first successful store of a key wins and later stores are no-ops.
#[derive(Debug)]
pub struct BottleCache {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BottleCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.bottle_cache_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    fn lock_for(&self, digest: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock()?;
        Ok(Arc::clone(locks.entry(digest.to_string()).or_default()))
    }

    /// Verified artifact stored under `key`, if any. A corrupt or tampered
    /// entry is evicted and reported as an integrity error.
    pub fn lookup(&self, key: &BottleKey) -> Result<Option<ArtifactRef>> {
        let digest = key.digest();
        let lock = self.lock_for(&digest)?;
        let _guard = lock.lock()?;
        self.lookup_locked(key, &digest)
    }

    fn lookup_locked(&self, key: &BottleKey, digest: &str) -> Result<Option<ArtifactRef>> {
        let dir = self.entry_dir(digest);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            debug!("[BOTTLE_CACHE] miss for {} ({})", key, &digest[..12]);
            return Ok(None);
        }
        match self.read_verified(&dir, key) {
            Ok(entry) => {
                debug!("[BOTTLE_CACHE] hit for {} ({})", key, &digest[..12]);
                Ok(Some(ArtifactRef {
                    digest: digest.to_string(),
                    path: dir.join(&entry.file),
                    sha256: entry.sha256,
                }))
            }
            Err(e) => {
                warn!("[BOTTLE_CACHE] evicting {} for {}: {}", &digest[..12], key, e);
                self.remove_entry_dir(&dir)?;
                Err(e)
            }
        }
    }

    fn read_verified(&self, dir: &Path, key: &BottleKey) -> Result<CacheEntry> {
        let raw = fs::read_to_string(dir.join(MANIFEST_FILE)).map_err(|e| {
            KilnError::Cache(format!("cannot read manifest in {}: {e}", dir.display()))
        })?;
        let entry: CacheEntry = serde_json::from_str(&raw).map_err(|e| {
            KilnError::Cache(format!("malformed manifest in {}: {e}", dir.display()))
        })?;
        if &entry.key != key {
            return Err(KilnError::Integrity(format!(
                "manifest in {} belongs to {}",
                dir.display(),
                entry.key
            )));
        }
        if entry.file.contains('/') || entry.file.contains("..") {
            return Err(KilnError::Integrity(format!(
                "manifest in {} names file '{}'",
                dir.display(),
                entry.file
            )));
        }
        verify_checksum(&dir.join(&entry.file), &entry.sha256)?;
        Ok(entry)
    }

    /// Stores a copy of `artifact` under `key` once it matches
    /// `sha256_expected`. When a valid entry already exists it is returned
    /// unchanged.
    pub fn store(&self, key: &BottleKey, artifact: &Path, sha256_expected: &str) -> Result<ArtifactRef> {
        let digest = key.digest();
        let lock = self.lock_for(&digest)?;
        let _guard = lock.lock()?;

        match self.lookup_locked(key, &digest) {
            Ok(Some(existing)) => {
                debug!("[BOTTLE_CACHE] {} already stored, keeping first copy", key);
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => debug!("[BOTTLE_CACHE] replacing bad entry for {}: {}", key, e),
        }

        verify_checksum(artifact, sha256_expected)?;

        let dir = self.entry_dir(&digest);
        if dir.exists() {
            // Leftovers of an interrupted store.
            self.remove_entry_dir(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let mut staged = NamedTempFile::new_in(&dir)?;
        io::copy(&mut File::open(artifact)?, staged.as_file_mut())?;
        staged.as_file_mut().sync_all()?;
        let copied_sha = sha256_file(staged.path())?;
        if !copied_sha.eq_ignore_ascii_case(sha256_expected) {
            return Err(KilnError::Integrity(format!(
                "copy of {} changed while storing (got {})",
                artifact.display(),
                copied_sha
            )));
        }
        let final_path = dir.join(ARTIFACT_FILE);
        staged
            .persist(&final_path)
            .map_err(|e| KilnError::from(e.error))?;

        let entry = CacheEntry {
            key: key.clone(),
            sha256: sha256_expected.to_ascii_lowercase(),
            file: ARTIFACT_FILE.to_string(),
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let mut manifest = NamedTempFile::new_in(&dir)?;
        manifest.write_all(serde_json::to_string_pretty(&entry)?.as_bytes())?;
        manifest
            .persist(dir.join(MANIFEST_FILE))
            .map_err(|e| KilnError::from(e.error))?;
        debug!("[BOTTLE_CACHE] stored {} as {}", key, &digest[..12]);

        Ok(ArtifactRef {
            digest,
            path: final_path,
            sha256: entry.sha256,
        })
    }

    /// Removes the entry for `key`. Returns whether one existed.
    pub fn evict(&self, key: &BottleKey) -> Result<bool> {
        let digest = key.digest();
        let lock = self.lock_for(&digest)?;
        let _guard = lock.lock()?;
        let dir = self.entry_dir(&digest);
        let existed = dir.exists();
        self.remove_entry_dir(&dir)?;
        Ok(existed)
    }

    /// Removes every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.root.is_dir() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                self.remove_entry_dir(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Manifests of all complete entries, unverified.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.root.is_dir() {
            return Ok(entries);
        }
        for dir in fs::read_dir(&self.root)? {
            let manifest = dir?.path().join(MANIFEST_FILE);
            if let Ok(raw) = fs::read_to_string(&manifest) {
                match serde_json::from_str::<CacheEntry>(&raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("[BOTTLE_CACHE] unreadable {}: {}", manifest.display(), e),
                }
            }
        }
        entries.sort_by(|a, b| (&a.key.name, &a.key.version).cmp(&(&b.key.name, &b.key.version)));
        Ok(entries)
    }

    fn remove_entry_dir(&self, dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KilnError::Cache(format!(
                "cannot remove {}: {e}",
                dir.display()
            ))),
        }
    }
}

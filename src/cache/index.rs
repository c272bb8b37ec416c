//! Content-addressed record of the verified bundle files on disk.
//!
//! Only mutated from the scheduler thread. Background workers report results
//! through queues and never touch the index. An index opened from a file is
//! written back after every change, so the next run starts from it.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoContext, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    store: Option<PathBuf>,
}

impl CacheIndex {
    /// Load the index persisted at `store`. Entries whose file went missing or
    /// changed size since are dropped.
    pub fn open(store: impl Into<PathBuf>) -> Self {
        let store = store.into();
        let entries: HashMap<String, CacheEntry> = match fs::read(&store) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable cache index {}: {e}", store.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        let loaded = entries.len();
        let entries: HashMap<_, _> = entries
            .into_iter()
            .filter(|(_, entry)| {
                fs::metadata(&entry.path).is_ok_and(|m| m.is_file() && m.len() == entry.size)
            })
            .collect();
        if entries.len() < loaded {
            info!("Dropped {} stale cache index entries", loaded - entries.len());
        }

        let index = Self {
            entries,
            store: Some(store),
        };
        if index.len() < loaded {
            index.save();
        }
        index
    }

    fn write(&self, store: &Path) -> Result<()> {
        let json =
            serde_json::to_vec(&self.entries).map_err(|e| Error::io(store, io::Error::other(e)))?;
        let temp = store.with_extension("tmp");
        fs::write(&temp, json).at_path(&temp)?;
        fs::rename(&temp, store).at_path(store)
    }

    fn save(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = self.write(store) {
                warn!("Failed to save cache index: {e}");
            }
        }
    }

    /// Record a verified file under its content hash. An older entry for the
    /// same path is forgotten, the file now holds this content.
    pub fn insert(&mut self, hash: &str, entry: CacheEntry) {
        debug!("Cached {hash} at {}", entry.path.display());
        self.entries.retain(|h, e| h == hash || e.path != entry.path);
        self.entries.insert(hash.to_string(), entry);
        self.save();
    }

    pub fn is_cached(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&CacheEntry> {
        self.entries.get(hash)
    }

    /// Entry stored at `path`, with its hash
    pub fn find_path(&self, path: &Path) -> Option<(&str, &CacheEntry)> {
        self.entries
            .iter()
            .find(|(_, e)| e.path == path)
            .map(|(h, e)| (h.as_str(), e))
    }

    /// Forget an entry, leaving the file alone
    pub fn remove(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash);
        if entry.is_some() {
            self.save();
        }
        entry
    }

    /// Forget whichever entry points at `path`
    pub fn remove_path(&mut self, path: &Path) -> Option<CacheEntry> {
        let hash = self.find_path(path).map(|(h, _)| h.to_string())?;
        self.remove(&hash)
    }

    /// Forget an entry and delete its file
    pub fn discard(&mut self, hash: &str) -> bool {
        let Some(entry) = self.remove(hash) else {
            return false;
        };
        if let Err(e) = fs::remove_file(&entry.path) {
            warn!("Failed to delete {}: {e}", entry.path.display());
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.save();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

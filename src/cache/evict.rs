//! Time-sliced removal of cached files

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, info, warn};

use super::{CacheIndex, CacheLayout, PART_EXTENSION};
use crate::{
    error::{IoContext, Result},
    hasher::digest_file,
    manifest::Manifest,
    operation::{Operation, OperationState},
};

#[derive(Debug, Clone)]
pub enum ClearCacheMode {
    /// Keep files named in the map, as long as their content still has the
    /// mapped hash. Partial downloads map to `None` and are kept as is.
    Unused(HashMap<String, Option<String>>),
    All,
}

impl ClearCacheMode {
    /// Keep the bundles and partial downloads referenced by `manifest`
    pub fn unused(manifest: &Manifest, layout: &CacheLayout) -> Self {
        let keep = manifest
            .bundles
            .iter()
            .filter(|b| !b.is_builtin)
            .flat_map(|b| {
                [
                    (b.file_name(layout.style()), Some(b.hash.clone())),
                    (format!("{}.{PART_EXTENSION}", b.hash), None),
                ]
            })
            .collect();
        ClearCacheMode::Unused(keep)
    }

    fn should_remove(&self, path: &Path, file_name: &str, index: &CacheIndex) -> bool {
        let ClearCacheMode::Unused(keep) = self else {
            return true;
        };
        let expected = match keep.get(file_name) {
            None => return true,
            Some(None) => return false,
            Some(Some(hash)) => hash,
        };
        // Same name, maybe different content under a name-only style
        match index.find_path(path) {
            Some((hash, _)) => hash != expected,
            None => match digest_file(path, true) {
                Ok(digest) => digest.hash.as_deref() != Some(expected.as_str()),
                Err(e) => {
                    warn!("Failed to hash {}: {e}", path.display());
                    true
                }
            },
        }
    }
}

pub struct ClearCacheOperation {
    state: OperationState,
    layout: CacheLayout,
    index: Rc<RefCell<CacheIndex>>,
    mode: ClearCacheMode,
    files_per_tick: usize,
    pending: VecDeque<PathBuf>,
    total: usize,
    removed: usize,
}

impl ClearCacheOperation {
    pub fn new(
        layout: CacheLayout,
        index: Rc<RefCell<CacheIndex>>,
        mode: ClearCacheMode,
        files_per_tick: usize,
    ) -> Self {
        Self {
            state: OperationState::default(),
            layout,
            index,
            mode,
            files_per_tick: files_per_tick.max(1),
            pending: VecDeque::new(),
            total: 0,
            removed: 0,
        }
    }

    pub fn removed_count(&self) -> usize {
        self.removed
    }

    fn list_files(&self) -> Result<VecDeque<PathBuf>> {
        let mut files = VecDeque::new();
        for dir in [self.layout.bundles_dir(), self.layout.temp_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir).at_path(&dir)? {
                let path = entry.at_path(&dir)?.path();
                if path.is_file() {
                    files.push_back(path);
                }
            }
        }
        Ok(files)
    }
}

impl Operation for ClearCacheOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn start(&mut self) {
        match self.list_files() {
            Ok(files) => {
                self.total = files.len();
                self.pending = files;
            }
            Err(e) => self.state.fail(e),
        }
    }

    fn update(&mut self) {
        for _ in 0..self.files_per_tick {
            let Some(path) = self.pending.pop_front() else {
                break;
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !self.mode.should_remove(&path, name, &self.index.borrow()) {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Evicted {}", path.display());
                    self.removed += 1;
                }
                Err(e) => warn!("Failed to evict {}: {e}", path.display()),
            }
            self.index.borrow_mut().remove_path(&path);
        }

        if self.total > 0 {
            let done = self.total - self.pending.len();
            self.state.set_progress(done as f32 / self.total as f32);
        }
        if self.pending.is_empty() {
            if matches!(self.mode, ClearCacheMode::All) {
                self.index.borrow_mut().clear();
            }
            info!("Cache cleanup removed {} files", self.removed);
            self.state.succeed();
        }
    }
}

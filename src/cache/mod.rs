//! Local bundle cache: directory layout, index, verification and eviction

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::{IoContext, Result},
    manifest::BundleRecord,
    settings::FileNameStyle,
};

pub mod app_version;
pub mod evict;
pub mod index;
pub mod verify;

pub use evict::{ClearCacheMode, ClearCacheOperation};
pub use index::{CacheEntry, CacheIndex};
pub use verify::{verify_bytes, verify_download, verify_file, VerifyCacheOperation};

const BUNDLES_DIR: &str = "bundles";
const MANIFESTS_DIR: &str = "manifests";
const TEMP_DIR: &str = "temp";
const PART_EXTENSION: &str = "part";
const INDEX_FILE: &str = "index.json";

/// Where every cached file of a package lives
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    style: FileNameStyle,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>, style: FileNameStyle) -> Self {
        Self {
            root: root.into(),
            style,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn style(&self) -> FileNameStyle {
        self.style
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join(BUNDLES_DIR)
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join(MANIFESTS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn bundle_path(&self, record: &BundleRecord) -> PathBuf {
        self.bundles_dir().join(record.file_name(self.style))
    }

    /// Partial download of a bundle, keyed by hash so renames never collide
    pub fn temp_path(&self, record: &BundleRecord) -> PathBuf {
        self.temp_dir().join(format!("{}.{PART_EXTENSION}", record.hash))
    }

    /// Persisted cache index
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn manifest_path(&self, file_name: &str) -> PathBuf {
        self.manifests_dir().join(file_name)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.bundles_dir(), self.manifests_dir(), self.temp_dir()] {
            fs::create_dir_all(&dir).at_path(&dir)?;
        }
        Ok(())
    }

    /// Wipe every cached file, keeping the directory structure
    pub fn wipe(&self) -> Result<()> {
        for dir in [self.bundles_dir(), self.manifests_dir(), self.temp_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir).at_path(&dir)?;
            }
        }
        let index = self.index_path();
        if index.exists() {
            fs::remove_file(&index).at_path(&index)?;
        }
        self.ensure_dirs()
    }
}

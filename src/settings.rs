//! Package configuration

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, IoContext, Result};

/// Hard ceiling on concurrent file downloads
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 64;

/// Hard ceiling on concurrent background verifications
pub const MAX_VERIFY_IN_FLIGHT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Everything ships with the application
    Offline,
    /// Built-in files first, then a local cache backed by remote servers
    Host,
    /// Bundles are fetched into memory, nothing is cached on disk
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNameStyle {
    Hash,
    BundleName,
    BundleNameHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// File exists
    Low,
    /// File exists and has the right size
    Middle,
    /// Size and CRC match
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    SingleThread,
    MultiThread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSettings {
    pub package_name: String,
    pub storage_mode: StorageMode,
    pub cache_root: PathBuf,
    pub builtin_root: Option<PathBuf>,
    pub primary_url: Option<Url>,
    pub fallback_url: Option<Url>,
    pub file_name_style: FileNameStyle,
    pub verify_level: VerifyLevel,
    pub verify_mode: VerifyMode,
    pub max_verify_in_flight: usize,
    pub download_concurrency: usize,
    pub download_retry: u32,
    pub download_timeout_secs: u64,
    /// Per-tick budget of the scheduler
    pub time_slice_ms: u64,
    /// Files examined per tick by cache eviction
    pub eviction_files_per_tick: usize,
    pub app_version: String,
    pub clear_cache_on_app_upgrade: bool,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            package_name: "default".to_string(),
            storage_mode: StorageMode::Host,
            cache_root: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("bundle_delivery"),
            builtin_root: None,
            primary_url: None,
            fallback_url: None,
            file_name_style: FileNameStyle::Hash,
            verify_level: VerifyLevel::High,
            verify_mode: VerifyMode::MultiThread,
            max_verify_in_flight: 8,
            download_concurrency: 10,
            download_retry: 3,
            download_timeout_secs: 60,
            time_slice_ms: 30,
            eviction_files_per_tick: 64,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            clear_cache_on_app_upgrade: true,
        }
    }
}

impl PackageSettings {
    /// Read settings from a JSON file, missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path).at_path(path)?;
        let settings: PackageSettings =
            serde_json::from_slice(&content).map_err(|e| Error::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.package_name.is_empty() {
            return Err(Error::Settings("package_name is empty".to_string()));
        }
        if self.storage_mode != StorageMode::Offline && self.primary_url.is_none() {
            return Err(Error::Settings(format!(
                "storage mode {:?} needs a primary_url",
                self.storage_mode
            )));
        }
        if self.storage_mode == StorageMode::Offline && self.builtin_root.is_none() {
            return Err(Error::Settings(
                "offline storage mode needs a builtin_root".to_string(),
            ));
        }
        Ok(())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn time_slice(&self) -> Duration {
        Duration::from_millis(self.time_slice_ms)
    }

    pub fn download_concurrency(&self) -> usize {
        self.download_concurrency.clamp(1, MAX_DOWNLOAD_CONCURRENCY)
    }

    pub fn max_verify_in_flight(&self) -> usize {
        self.max_verify_in_flight.clamp(1, MAX_VERIFY_IN_FLIGHT)
    }

    /// Cache directory of this package
    pub fn package_cache_dir(&self) -> PathBuf {
        self.cache_root.join(&self.package_name)
    }
}

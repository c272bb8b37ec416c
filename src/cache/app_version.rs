//! Persisted stamp of the application version that last reset the cache

use std::fs;

use log::info;

use super::CacheLayout;
use crate::error::{IoContext, Result};

const STAMP_FILE: &str = "app_version.txt";

pub fn read_stamp(layout: &CacheLayout) -> Option<String> {
    fs::read_to_string(layout.root().join(STAMP_FILE))
        .ok()
        .map(|s| s.trim().to_string())
}

pub fn write_stamp(layout: &CacheLayout, app_version: &str) -> Result<()> {
    let path = layout.root().join(STAMP_FILE);
    fs::write(&path, app_version).at_path(&path)
}

/// Wipe the cache when the application was upgraded since the last run.
/// Returns whether the cache was wiped.
pub fn reset_on_app_upgrade(layout: &CacheLayout, app_version: &str) -> Result<bool> {
    layout.ensure_dirs()?;
    let wiped = match read_stamp(layout) {
        Some(stamp) if stamp == app_version => false,
        Some(stamp) => {
            info!("App upgraded from {stamp} to {app_version}, clearing cache");
            layout.wipe()?;
            true
        }
        // First run, nothing to clear
        None => false,
    };
    write_stamp(layout, app_version)?;
    Ok(wiped)
}

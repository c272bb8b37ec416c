//! Commands keeping the local cache in step with the remote package

use anyhow::{Context, Result};

use super::run_to_completion;
use crate::{download::DownloadProgress, package::ResourcePackage};

/// Latest version published for the package
pub fn request_version(package: &ResourcePackage) -> Result<String> {
    let op = package.request_package_version();
    run_to_completion(package.scheduler(), &op).context("Failed to request package version")?;
    op.with(|op| op.version().map(str::to_string))
        .flatten()
        .context("Version request finished without a version")
}

/// Activate the manifest of `version`, or of the latest version, then register
/// the intact cached files
pub fn update_manifest(package: &ResourcePackage, version: Option<&str>) -> Result<String> {
    let version = match version {
        Some(version) => version.to_string(),
        None => request_version(package)?,
    };
    let op = package.update_package_manifest(&version);
    run_to_completion(package.scheduler(), &op)
        .with_context(|| format!("Failed to update manifest to {version}"))?;

    verify_cache(package)?;
    Ok(version)
}

/// Check cached files against the active manifest, reporting the broken ones
pub fn verify_cache(package: &ResourcePackage) -> Result<()> {
    let op = package.verify_cache()?;
    run_to_completion(package.scheduler(), &op).context("Failed to verify cache")?;
    op.with(|op| {
        for (record, e) in op.verify_fail_list() {
            eprintln!("Failed to verify {}: {}", record.name, e);
        }
        eprintln!("Verified {} cached files", op.verified_count());
    });
    Ok(())
}

/// Download the bundles selected by tags or asset paths, everything when both
/// are empty
pub fn download(package: &ResourcePackage, tags: &[String], paths: &[String]) -> Result<()> {
    let mut downloader = match (tags.is_empty(), paths.is_empty()) {
        (true, true) => package.create_resource_downloader()?,
        (false, true) => package.create_resource_downloader_by_tags(tags)?,
        (true, false) => package.create_resource_downloader_by_paths(paths)?,
        (false, false) => {
            let mut downloader = package.create_resource_downloader_by_tags(tags)?;
            let by_paths = package.create_resource_downloader_by_paths(paths)?;
            downloader.combine(&by_paths);
            downloader
        }
    };
    if downloader.total_download_count() == 0 {
        eprintln!("Everything is up to date");
        return Ok(());
    }

    downloader.set_progress_callback(|p: DownloadProgress| {
        eprintln!(
            "Downloaded {}/{} files, {}/{} bytes",
            p.current_count, p.total_count, p.current_bytes, p.total_bytes
        )
    });
    downloader.set_error_callback(|file, e| eprintln!("Failed to download {}: {}", file, e));

    let op = package.begin_download(downloader);
    run_to_completion(package.scheduler(), &op).context("Download failed")
}

/// Remove cached files the active manifest doesn't use, or every cached file
pub fn clean(package: &ResourcePackage, all: bool) -> Result<()> {
    let op = if all {
        package.clear_all_cache_files()?
    } else {
        package.clear_unused_cache_files()?
    };
    run_to_completion(package.scheduler(), &op).context("Failed to clear cache")?;
    if let Some(removed) = op.with(|op| op.removed_count()) {
        eprintln!("Removed {} files", removed);
    }
    Ok(())
}

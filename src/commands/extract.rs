use std::{fs, path::Path};

use anyhow::{Context, Result};
use glob::Pattern;

use super::{cat::read_asset, matches_any};
use crate::{error::Error, package::ResourcePackage};

/// Extract assets matching a glob pattern to disk
pub fn extract_assets(
    package: &ResourcePackage,
    patterns: &[Pattern],
    output_folder: &Path,
) -> Result<()> {
    let manifest = package.active_manifest().ok_or(Error::ManifestMissing)?;
    let paths = manifest
        .asset_paths()
        .filter(|path| matches_any(patterns, path))
        .collect::<Vec<_>>();

    paths
        .into_iter()
        .map(|path| -> Result<_> {
            let contents = read_asset(package, path)?;
            let out_filename = output_folder.join(path);
            if let Some(parent) = out_filename.parent() {
                fs::create_dir_all(parent).context("Failed to create folder")?;
            }
            fs::write(&out_filename, &contents).context("Failed to write file")?;
            Ok(path)
        })
        // Report results
        .for_each(|result| match result {
            Ok(path) => eprintln!("Extracted asset: {}", path),
            Err(e) => eprintln!("Failed to extract asset: {:?}", e),
        });

    // Bundles loaded for the extraction are no longer referenced
    package.unload_unused_assets();
    Ok(())
}

use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::{error::Error, package::ResourcePackage};

/// Contents of one asset, raw file bundles included
pub fn read_asset(package: &ResourcePackage, path: &str) -> Result<Bytes> {
    let manifest = package.active_manifest().ok_or(Error::ManifestMissing)?;
    let asset = manifest.asset(path)?;
    let is_raw = manifest.owner_bundle(asset).is_raw_file;

    let handle = if is_raw {
        package.load_raw_file_sync(path)
    } else {
        package.load_asset_sync(path, None)
    };
    if let Some(e) = handle.error() {
        return Err(e.into());
    }
    let contents = if is_raw {
        handle.raw_data()
    } else {
        handle.asset().map(|asset| asset.data)
    };
    contents.with_context(|| format!("Asset {path} loaded without contents"))
}

/// Write the contents of the asset to stdout
pub fn cat_asset(package: &ResourcePackage, path: &str) -> Result<()> {
    let contents = read_asset(package, path).context("Failed to read asset")?;

    let mut stdout = BufWriter::new(io::stdout().lock());
    stdout
        .write_all(&contents)
        .context("Failed to write to stdout")?;

    stdout.flush().context("Failed to flush stdout")
}

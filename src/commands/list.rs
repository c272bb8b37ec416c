use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use glob::Pattern;

use super::matches_any;
use crate::manifest::Manifest;

/// List asset paths matching a glob pattern
pub fn list_assets(manifest: &Manifest, patterns: &[Pattern]) -> Result<()> {
    // Use a buffered writer since we're dumping a lot of data
    let mut stdout = BufWriter::new(io::stdout().lock());

    manifest
        .asset_paths()
        .filter(|path| matches_any(patterns, path))
        .try_for_each(|p| writeln!(stdout, "{}", p).context("Failed to write to stdout"))?;

    stdout.flush().context("Failed to flush stdout")
}

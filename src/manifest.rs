//! The versioned manifest describing every bundle and asset of a package.
//!
//! Produced by the offline build pipeline, consumed read-only here.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    settings::FileNameStyle,
};

pub const MANIFEST_FORMAT_VERSION: &str = "1";

/// Remote file holding the latest version string of a package.
pub fn version_file_name(package: &str) -> String {
    format!("{package}.version")
}

/// Remote file holding the content hash of a manifest.
pub fn hash_file_name(package: &str, version: &str) -> String {
    format!("{package}_{version}.hash")
}

pub fn manifest_file_name(package: &str, version: &str) -> String {
    format!("{package}_{version}.json")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleRecord {
    pub name: String,
    /// Lowercase hex content hash
    pub hash: String,
    pub crc: u32,
    pub size: u64,
    /// Indices into [`Manifest::bundles`]
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_raw_file: bool,
    #[serde(default)]
    pub is_builtin: bool,
}

impl BundleRecord {
    /// File name under the cache, built-in, or remote directory
    pub fn file_name(&self, style: FileNameStyle) -> String {
        match style {
            FileNameStyle::Hash => self.hash.clone(),
            FileNameStyle::BundleName => self.name.clone(),
            FileNameStyle::BundleNameHash => format!("{}_{}", self.name, self.hash),
        }
    }

    pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter()
            .any(|tag| self.tags.iter().any(|t| t == tag.as_ref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRecord {
    pub path: String,
    /// Index of the owning bundle
    pub bundle: u32,
    /// Flattened dependency closure, owner excluded
    #[serde(default)]
    pub dependencies: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    pub package_name: String,
    pub package_version: String,
    pub bundles: Vec<BundleRecord>,
    pub assets: Vec<AssetRecord>,
    #[serde(skip)]
    asset_lut: HashMap<String, usize>,
    #[serde(skip)]
    bundle_lut: HashMap<String, usize>,
}

impl Manifest {
    pub fn new(
        package_name: &str,
        package_version: &str,
        bundles: Vec<BundleRecord>,
        assets: Vec<AssetRecord>,
    ) -> Result<Self> {
        let mut manifest = Self {
            format_version: MANIFEST_FORMAT_VERSION.to_string(),
            package_name: package_name.to_string(),
            package_version: package_version.to_string(),
            bundles,
            assets,
            asset_lut: HashMap::new(),
            bundle_lut: HashMap::new(),
        };
        manifest.index()?;
        Ok(manifest)
    }

    /// Parse and validate a manifest document
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut manifest: Manifest =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(Error::InvalidManifest(format!(
                "Unsupported format version {}",
                manifest.format_version
            )));
        }
        manifest.index()?;
        Ok(manifest)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::InvalidManifest(e.to_string()))
    }

    // Build the lookup tables and check every index points at a bundle
    fn index(&mut self) -> Result<()> {
        let bundle_count = self.bundles.len();
        let check = |index: u32, owner: &str| {
            if (index as usize) < bundle_count {
                Ok(())
            } else {
                Err(Error::InvalidManifest(format!(
                    "{owner} references missing bundle index {index}"
                )))
            }
        };

        self.bundle_lut.clear();
        for (i, bundle) in self.bundles.iter().enumerate() {
            bundle.dependencies.iter().try_for_each(|&d| check(d, &bundle.name))?;
            if self.bundle_lut.insert(bundle.name.clone(), i).is_some() {
                return Err(Error::InvalidManifest(format!(
                    "Duplicate bundle name {}",
                    bundle.name
                )));
            }
        }

        self.asset_lut.clear();
        for (i, asset) in self.assets.iter().enumerate() {
            check(asset.bundle, &asset.path)?;
            asset.dependencies.iter().try_for_each(|&d| check(d, &asset.path))?;
            if self.asset_lut.insert(asset.path.clone(), i).is_some() {
                return Err(Error::InvalidManifest(format!(
                    "Duplicate asset path {}",
                    asset.path
                )));
            }
        }

        Ok(())
    }

    pub fn asset(&self, path: &str) -> Result<&AssetRecord> {
        self.asset_lut
            .get(path)
            .map(|&i| &self.assets[i])
            .ok_or_else(|| Error::AssetNotFound(path.to_string()))
    }

    pub fn bundle(&self, index: u32) -> &BundleRecord {
        &self.bundles[index as usize]
    }

    pub fn bundle_by_name(&self, name: &str) -> Result<&BundleRecord> {
        self.bundle_lut
            .get(name)
            .map(|&i| &self.bundles[i])
            .ok_or_else(|| Error::BundleNotFound(name.to_string()))
    }

    pub fn owner_bundle(&self, asset: &AssetRecord) -> &BundleRecord {
        self.bundle(asset.bundle)
    }

    /// Dependency bundles of an asset, deduplicated, owner excluded
    pub fn dependency_bundles(&self, asset: &AssetRecord) -> Vec<&BundleRecord> {
        let mut seen = HashSet::from([asset.bundle]);
        asset
            .dependencies
            .iter()
            .filter(|&&d| seen.insert(d))
            .map(|&d| self.bundle(d))
            .collect()
    }

    /// Asset paths, in manifest order
    pub fn asset_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.assets.iter().map(|a| a.path.as_str())
    }

    /// Bundles needed to load the given assets, owners and dependencies
    pub fn bundles_for_assets<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<&BundleRecord>> {
        let mut seen = HashSet::new();
        let mut bundles = Vec::new();
        for path in paths {
            let asset = self.asset(path.as_ref())?;
            for index in std::iter::once(asset.bundle).chain(asset.dependencies.iter().copied()) {
                if seen.insert(index) {
                    bundles.push(self.bundle(index));
                }
            }
        }
        Ok(bundles)
    }

    pub fn bundles_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Vec<&BundleRecord> {
        self.bundles.iter().filter(|b| b.has_any_tag(tags)).collect()
    }
}

//! In-memory representation of a decoded bundle.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! magic        b"BNDL"
//! version      u32
//! entry_count  u32
//! entries      entry_count * { path_len u16, path, type_len u16, type, offset u64, size u64 }
//! payload      remaining bytes, entry offsets are relative to its start
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take},
    combinator::map_res,
    multi::count,
    number::complete::{le_u16, le_u32, le_u64},
    IResult,
};

use crate::error::{Error, Result};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"BNDL";
pub const ARCHIVE_VERSION: u32 = 1;

/// Separator between an asset path and the name of one of its sub-assets
pub const SUB_ASSET_SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub asset_type: String,
    pub offset: u64,
    pub size: u64,
}

/// One extracted asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetObject {
    pub path: String,
    pub asset_type: String,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct BundleArchive {
    entries: Vec<ArchiveEntry>,
    lut: HashMap<String, usize>,
    payload: Bytes,
}

/// A bundle as held in memory while loaded
#[derive(Debug)]
pub enum LoadedBundle {
    Archive(BundleArchive),
    Raw(Bytes),
}

// Parser for a length-prefixed UTF-8 string
fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = le_u16(input)?;
    map_res(take(len), |s: &[u8]| String::from_utf8(s.to_vec()))(input)
}

// Parser for an entry of the table
fn parse_entry(input: &[u8]) -> IResult<&[u8], ArchiveEntry> {
    let (input, path) = parse_string(input)?;
    let (input, asset_type) = parse_string(input)?;
    let (input, offset) = le_u64(input)?;
    let (input, size) = le_u64(input)?;
    Ok((
        input,
        ArchiveEntry {
            path,
            asset_type,
            offset,
            size,
        },
    ))
}

// Parser for the header and entry table
fn parse_header(input: &[u8]) -> IResult<&[u8], (u32, Vec<ArchiveEntry>)> {
    let (input, _) = tag(ARCHIVE_MAGIC.as_slice())(input)?;
    let (input, version) = le_u32(input)?;
    let (input, entry_count) = le_u32(input)?;
    let (input, entries) = count(parse_entry, entry_count as usize)(input)?;
    Ok((input, (version, entries)))
}

impl BundleArchive {
    /// Decode a bundle file. `name` is only used for error reporting.
    pub fn parse(name: &str, content: Bytes) -> Result<Self> {
        let decode_error = |message: String| Error::Decode {
            bundle: name.to_string(),
            message,
        };

        let (rest, (version, entries)) =
            parse_header(&content).map_err(|e| decode_error(format!("Bad header: {e}")))?;
        if version != ARCHIVE_VERSION {
            return Err(decode_error(format!("Unsupported version {version}")));
        }

        // Zero copy view of the payload
        let payload = content.slice(content.len() - rest.len()..);

        let mut lut = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let end = entry.offset.checked_add(entry.size);
            if !matches!(end, Some(end) if end <= payload.len() as u64) {
                return Err(decode_error(format!("Entry {} out of bounds", entry.path)));
            }
            lut.insert(entry.path.clone(), i);
        }

        Ok(Self {
            entries,
            lut,
            payload,
        })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn object(&self, entry: &ArchiveEntry) -> AssetObject {
        let start = entry.offset as usize;
        AssetObject {
            path: entry.path.clone(),
            asset_type: entry.asset_type.clone(),
            data: self.payload.slice(start..start + entry.size as usize),
        }
    }

    pub fn read(&self, path: &str) -> Option<AssetObject> {
        self.lut.get(path).map(|&i| self.object(&self.entries[i]))
    }

    /// Entries stored as `<path>#<name>`
    pub fn read_sub_assets(&self, path: &str) -> Vec<AssetObject> {
        let prefix = format!("{path}{SUB_ASSET_SEPARATOR}");
        self.entries
            .iter()
            .filter(|e| e.path.starts_with(&prefix))
            .map(|e| self.object(e))
            .collect()
    }

    pub fn read_all(&self) -> Vec<AssetObject> {
        self.entries.iter().map(|e| self.object(e)).collect()
    }
}

impl LoadedBundle {
    pub fn decode(name: &str, content: Bytes, is_raw_file: bool) -> Result<Self> {
        if is_raw_file {
            Ok(LoadedBundle::Raw(content))
        } else {
            BundleArchive::parse(name, content).map(LoadedBundle::Archive)
        }
    }

    pub fn archive(&self) -> Option<&BundleArchive> {
        match self {
            LoadedBundle::Archive(archive) => Some(archive),
            LoadedBundle::Raw(_) => None,
        }
    }

    pub fn raw(&self) -> Option<&Bytes> {
        match self {
            LoadedBundle::Raw(data) => Some(data),
            LoadedBundle::Archive(_) => None,
        }
    }
}

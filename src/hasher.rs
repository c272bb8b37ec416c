//! Checksums over bundle files: CRC32 and BLAKE3 content hashes

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{IoContext, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const READ_CHUNK: usize = 64 * 1024;

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Lowercase hex BLAKE3 hash
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Size and checksums of a file, computed in a single streaming pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub crc: u32,
    pub hash: Option<String>,
}

/// Stream a file through CRC32, and BLAKE3 when `with_hash` is set
pub fn digest_file(path: &Path, with_hash: bool) -> Result<FileDigest> {
    let file = File::open(path).at_path(path)?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);

    let mut crc = CRC32.digest();
    let mut hasher = with_hash.then(blake3::Hasher::new);
    let mut size = 0u64;
    let mut buf = vec![0; READ_CHUNK];
    loop {
        let read = reader.read(&mut buf).at_path(path)?;
        if read == 0 {
            break;
        }
        crc.update(&buf[..read]);
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..read]);
        }
        size += read as u64;
    }

    Ok(FileDigest {
        size,
        crc: crc.finalize(),
        hash: hasher.map(|h| h.finalize().to_hex().to_string()),
    })
}

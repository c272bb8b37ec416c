//! Fixtures shared by the unit tests: an in-memory remote server and builders
//! for bundle archives, records and published packages.

use std::{
    collections::{HashMap, HashSet},
    io::{self, Cursor, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use url::Url;

use crate::{
    archive::{ARCHIVE_MAGIC, ARCHIVE_VERSION},
    error::{Error, Result},
    hasher::{content_hash, crc32},
    manifest::{hash_file_name, manifest_file_name, version_file_name, BundleRecord, Manifest},
    operation::OperationRef,
    remote::{FetchResponse, Fetcher},
    scheduler::Scheduler,
};

/// A request seen by [`MemoryFetcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub host: String,
    /// Last path segment of the URL
    pub name: String,
    pub offset: u64,
}

/// Remote server serving files from memory, keyed by the last URL segment.
/// Hosts are ignored so primary and fallback serve the same content.
#[derive(Default)]
pub struct MemoryFetcher {
    files: RwLock<HashMap<String, Bytes>>,
    failing: Mutex<HashSet<String>>,
    truncated: Mutex<HashMap<String, usize>>,
    blocked: Mutex<HashSet<String>>,
    ignore_ranges: AtomicBool,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MemoryFetcher {
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.files
            .write()
            .unwrap()
            .insert(name.to_string(), Bytes::from(data));
    }

    pub fn remove(&self, name: &str) {
        self.files.write().unwrap().remove(name);
    }

    /// Every request for `name` fails with a server error
    pub fn fail_always(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// The next transfer of `name` breaks off after `bytes` bytes
    pub fn fail_after_bytes(&self, name: &str, bytes: usize) {
        self.truncated
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes);
    }

    /// Answer ranged requests with the whole file
    pub fn ignore_ranges(&self) {
        self.ignore_ranges.store(true, Ordering::Relaxed);
    }

    /// Requests for `name` hang until unblocked or timed out
    pub fn block(&self, name: &str) {
        self.blocked.lock().unwrap().insert(name.to_string());
    }

    pub fn unblock_all(&self) {
        self.blocked.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, url: &Url, offset: u64, timeout: Duration) -> Result<FetchResponse> {
        let name = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or_default()
            .to_string();
        self.requests.lock().unwrap().push(FetchRequest {
            host: url.host_str().unwrap_or_default().to_string(),
            name: name.clone(),
            offset,
        });

        let start = Instant::now();
        while self.blocked.lock().unwrap().contains(&name) {
            if start.elapsed() > timeout {
                return Err(Error::Timeout {
                    url: url.to_string(),
                });
            }
            thread::sleep(Duration::from_millis(1));
        }

        if self.failing.lock().unwrap().contains(&name) {
            return Err(Error::Http {
                url: url.to_string(),
                message: "503 Service Unavailable".to_string(),
            });
        }
        let data = self
            .files
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::Http {
                url: url.to_string(),
                message: "404 Not Found".to_string(),
            })?;

        let partial = offset > 0
            && !self.ignore_ranges.load(Ordering::Relaxed)
            && offset < data.len() as u64;
        let body = if partial {
            data.slice(offset as usize..)
        } else {
            data
        };

        let body: Box<dyn Read + Send> = match self.truncated.lock().unwrap().remove(&name) {
            Some(remaining) => Box::new(BrokenReader {
                inner: Cursor::new(body),
                remaining,
            }),
            None => Box::new(Cursor::new(body)),
        };
        Ok(FetchResponse { partial, body })
    }
}

// Reader whose connection drops after `remaining` bytes
struct BrokenReader {
    inner: Cursor<Bytes>,
    remaining: usize,
}

impl Read for BrokenReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        let len = buf.len().min(self.remaining);
        let read = self.inner.read(&mut buf[..len])?;
        self.remaining -= read;
        Ok(read)
    }
}

/// Record of a bundle with the given content, no dependencies or tags
pub fn bundle_record(name: &str, data: &[u8]) -> BundleRecord {
    BundleRecord {
        name: name.to_string(),
        hash: content_hash(data),
        crc: crc32(data),
        size: data.len() as u64,
        dependencies: vec![],
        tags: vec![],
        is_raw_file: false,
        is_builtin: false,
    }
}

/// Writes the bundle archive format
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<(String, String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn add(mut self, path: &str, asset_type: &str, data: &[u8]) -> Self {
        self.entries
            .push((path.to_string(), asset_type.to_string(), data.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(ARCHIVE_MAGIC);
        out.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        let mut offset = 0u64;
        for (path, asset_type, data) in &self.entries {
            for s in [path, asset_type] {
                out.extend_from_slice(&(s.len() as u16).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            offset += data.len() as u64;
        }
        for (_, _, data) in &self.entries {
            out.extend_from_slice(data);
        }
        out
    }
}

/// Put a manifest version and all of its bundle contents on the server
pub fn publish(fetcher: &MemoryFetcher, manifest: &Manifest, contents: &HashMap<String, Vec<u8>>) {
    let package = &manifest.package_name;
    let version = &manifest.package_version;
    let json = manifest.to_vec().unwrap();
    fetcher.insert(&version_file_name(package), version.as_bytes().to_vec());
    fetcher.insert(
        &hash_file_name(package, version),
        content_hash(&json).into_bytes(),
    );
    fetcher.insert(&manifest_file_name(package, version), json);
    for bundle in &manifest.bundles {
        if let Some(data) = contents.get(&bundle.name) {
            fetcher.insert(&bundle.hash, data.clone());
        }
    }
}

/// Tick `scheduler` until the operation behind `op` is done
pub fn run_until_done<T: crate::operation::Operation + 'static>(
    scheduler: &Scheduler,
    op: &OperationRef<T>,
) {
    let start = Instant::now();
    while !op.is_done() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "operation did not finish"
        );
        scheduler.tick();
        thread::sleep(Duration::from_millis(1));
    }
}

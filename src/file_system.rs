//! Storage backends a bundle can be read from.
//!
//! A package combines an optional read-only built-in directory shipped with the
//! application and an optional remote-backed backend (disk cache or web).

use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    path::PathBuf,
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, warn};

use crate::{
    cache::{CacheIndex, CacheLayout},
    download::{FetchTarget, FileFetchOperation},
    error::{Error, IoContext, Result},
    manifest::BundleRecord,
    operation::{Operation, OperationStatus},
    remote::{Fetcher, RemoteServices},
    settings::FileNameStyle,
};

pub trait FileSystem {
    fn name(&self) -> &'static str;

    /// The file can be read right now, without touching the network
    fn is_local(&self, record: &BundleRecord) -> bool;

    /// The file should be part of a pre-download
    fn need_download(&self, _record: &BundleRecord) -> bool {
        false
    }

    fn read(&self, record: &BundleRecord) -> Result<Bytes>;

    /// Start or join a fetch of the file. Concurrent callers for the same file
    /// may share one operation.
    fn fetch(
        &self,
        record: &BundleRecord,
        retry: u32,
        timeout: Duration,
    ) -> Result<Rc<RefCell<FileFetchOperation>>>;

    fn remove(&self, record: &BundleRecord) -> Result<()>;
}

/// Files shipped with the application, read in place
pub struct BuiltinFileSystem {
    root: PathBuf,
    style: FileNameStyle,
}

impl BuiltinFileSystem {
    pub fn new(root: impl Into<PathBuf>, style: FileNameStyle) -> Self {
        Self {
            root: root.into(),
            style,
        }
    }

    pub fn path(&self, record: &BundleRecord) -> PathBuf {
        self.root.join(record.file_name(self.style))
    }
}

impl FileSystem for BuiltinFileSystem {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn is_local(&self, record: &BundleRecord) -> bool {
        self.path(record).is_file()
    }

    fn read(&self, record: &BundleRecord) -> Result<Bytes> {
        let path = self.path(record);
        fs::read(&path).at_path(&path).map(Bytes::from)
    }

    fn fetch(
        &self,
        record: &BundleRecord,
        _retry: u32,
        _timeout: Duration,
    ) -> Result<Rc<RefCell<FileFetchOperation>>> {
        Err(Error::BundleNotFound(record.name.clone()))
    }

    fn remove(&self, record: &BundleRecord) -> Result<()> {
        warn!("Refusing to delete built-in file {}", record.name);
        Ok(())
    }
}

/// Fetch operations in flight, keyed by bundle hash
#[derive(Default)]
struct FetchRegistry {
    ops: RefCell<HashMap<String, Weak<RefCell<FileFetchOperation>>>>,
}

impl FetchRegistry {
    fn get_or_insert(
        &self,
        hash: &str,
        create: impl FnOnce() -> FileFetchOperation,
    ) -> Rc<RefCell<FileFetchOperation>> {
        let mut ops = self.ops.borrow_mut();
        ops.retain(|_, op| op.strong_count() > 0);

        let existing = ops.get(hash).and_then(Weak::upgrade).filter(|op| {
            op.try_borrow()
                .map(|op| op.status() != OperationStatus::Failed)
                .unwrap_or(true)
        });
        if let Some(op) = existing {
            debug!("Joining fetch of {hash} already in flight");
            return op;
        }

        let op = Rc::new(RefCell::new(create()));
        ops.insert(hash.to_string(), Rc::downgrade(&op));
        op
    }
}

/// Local disk cache filled from remote servers
pub struct CacheFileSystem {
    layout: CacheLayout,
    index: Rc<RefCell<CacheIndex>>,
    remote: Rc<RemoteServices>,
    fetcher: Arc<dyn Fetcher>,
    registry: FetchRegistry,
}

impl CacheFileSystem {
    pub fn new(
        layout: CacheLayout,
        index: Rc<RefCell<CacheIndex>>,
        remote: Rc<RemoteServices>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            layout,
            index,
            remote,
            fetcher,
            registry: FetchRegistry::default(),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }
}

impl FileSystem for CacheFileSystem {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn is_local(&self, record: &BundleRecord) -> bool {
        self.index.borrow().is_cached(&record.hash)
    }

    fn need_download(&self, record: &BundleRecord) -> bool {
        !self.is_local(record)
    }

    fn read(&self, record: &BundleRecord) -> Result<Bytes> {
        let path = self
            .index
            .borrow()
            .get(&record.hash)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| Error::BundleNotFound(record.name.clone()))?;
        fs::read(&path).at_path(&path).map(Bytes::from)
    }

    fn fetch(
        &self,
        record: &BundleRecord,
        retry: u32,
        timeout: Duration,
    ) -> Result<Rc<RefCell<FileFetchOperation>>> {
        Ok(self.registry.get_or_insert(&record.hash, || {
            FileFetchOperation::new(
                record.clone(),
                FetchTarget::Disk {
                    temp: self.layout.temp_path(record),
                    dest: self.layout.bundle_path(record),
                    index: self.index.clone(),
                },
                self.remote.clone(),
                self.fetcher.clone(),
                self.layout.style(),
                retry,
                timeout,
            )
        }))
    }

    fn remove(&self, record: &BundleRecord) -> Result<()> {
        self.index.borrow_mut().discard(&record.hash);
        for path in [self.layout.bundle_path(record), self.layout.temp_path(record)] {
            if path.exists() {
                debug!("Deleting {}", path.display());
                fs::remove_file(&path).at_path(&path)?;
            }
        }
        Ok(())
    }
}

/// Remote files fetched straight into memory, nothing is cached
pub struct WebFileSystem {
    remote: Rc<RemoteServices>,
    fetcher: Arc<dyn Fetcher>,
    style: FileNameStyle,
    registry: FetchRegistry,
}

impl WebFileSystem {
    pub fn new(
        remote: Rc<RemoteServices>,
        fetcher: Arc<dyn Fetcher>,
        style: FileNameStyle,
    ) -> Self {
        Self {
            remote,
            fetcher,
            style,
            registry: FetchRegistry::default(),
        }
    }
}

impl FileSystem for WebFileSystem {
    fn name(&self) -> &'static str {
        "web"
    }

    fn is_local(&self, _record: &BundleRecord) -> bool {
        false
    }

    fn read(&self, record: &BundleRecord) -> Result<Bytes> {
        Err(Error::BundleNotFound(record.name.clone()))
    }

    fn fetch(
        &self,
        record: &BundleRecord,
        retry: u32,
        timeout: Duration,
    ) -> Result<Rc<RefCell<FileFetchOperation>>> {
        Ok(self.registry.get_or_insert(&record.hash, || {
            FileFetchOperation::new(
                record.clone(),
                FetchTarget::Memory,
                self.remote.clone(),
                self.fetcher.clone(),
                self.style,
                retry,
                timeout,
            )
        }))
    }

    fn remove(&self, _record: &BundleRecord) -> Result<()> {
        Ok(())
    }
}

/// The backends of one package
pub struct FileSystemSet {
    builtin: Option<BuiltinFileSystem>,
    remote: Option<Box<dyn FileSystem>>,
}

impl FileSystemSet {
    pub fn new(builtin: Option<BuiltinFileSystem>, remote: Option<Box<dyn FileSystem>>) -> Self {
        Self { builtin, remote }
    }

    /// Backend responsible for a bundle. Built-in files win when present.
    pub fn select(&self, record: &BundleRecord) -> Result<&dyn FileSystem> {
        if let Some(builtin) = &self.builtin {
            if (record.is_builtin || self.remote.is_none()) && builtin.is_local(record) {
                return Ok(builtin);
            }
        }
        match &self.remote {
            Some(remote) => Ok(remote.as_ref()),
            None => Err(Error::BundleNotFound(record.name.clone())),
        }
    }

    pub fn need_download(&self, record: &BundleRecord) -> bool {
        self.select(record)
            .map(|fs| fs.need_download(record))
            .unwrap_or(false)
    }
}

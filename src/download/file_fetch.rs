//! Fetch of a single bundle file with retry and resume.
//!
//! Each attempt runs on its own background thread and reports back through a
//! one-slot channel. Disk fetches stream into `temp/<hash>.part` first and are
//! renamed into place only once verified, so an interrupted transfer never
//! leaves a partial file under the bundle directory.

use std::{
    cell::RefCell,
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use log::{debug, info, warn};
use url::Url;

use crate::{
    cache::{verify_bytes, verify_download, CacheEntry, CacheIndex},
    error::{Error, IoContext, Result},
    manifest::BundleRecord,
    operation::{Operation, OperationState},
    remote::{Fetcher, RemoteServices},
    settings::FileNameStyle,
};

const CHUNK_SIZE: usize = 64 * 1024;

/// Where a fetched file ends up
pub enum FetchTarget {
    /// Streamed to `temp`, then moved to `dest` and registered in the index
    Disk {
        temp: PathBuf,
        dest: PathBuf,
        index: Rc<RefCell<CacheIndex>>,
    },
    /// Kept in memory, nothing touches the disk
    Memory,
}

/// Everything a worker thread needs, all of it `Send`
struct Job {
    fetcher: Arc<dyn Fetcher>,
    url: Url,
    record: BundleRecord,
    timeout: Duration,
    /// Temp and destination path for disk fetches
    paths: Option<(PathBuf, PathBuf)>,
    cancel: Arc<AtomicBool>,
    downloaded: Arc<AtomicU64>,
}

impl Job {
    fn run(&self) -> Result<Option<Bytes>> {
        match &self.paths {
            Some((temp, dest)) => self.run_to_disk(temp, dest).map(|_| None),
            None => self.run_to_memory().map(Some),
        }
    }

    fn copy(&self, body: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(Error::UserCancelled);
            }
            let read = body.read(&mut buf).map_err(|e| Error::Http {
                url: self.url.to_string(),
                message: e.to_string(),
            })?;
            if read == 0 {
                return Ok(());
            }
            out.write_all(&buf[..read]).map_err(|e| Error::io("download", e))?;
            self.downloaded.fetch_add(read as u64, Ordering::Relaxed);
        }
    }

    fn run_to_disk(&self, temp: &Path, dest: &Path) -> Result<()> {
        // Resume from whatever a previous attempt left behind
        let mut offset = fs::metadata(temp).map(|m| m.len()).unwrap_or(0);
        if offset >= self.record.size {
            let _ = fs::remove_file(temp);
            offset = 0;
        }

        let mut response = self.fetcher.fetch(&self.url, offset, self.timeout)?;
        let mut file = if offset > 0 && response.partial {
            debug!("Resuming {} at byte {offset}", self.record.name);
            OpenOptions::new().append(true).open(temp).at_path(temp)?
        } else {
            offset = 0;
            File::create(temp).at_path(temp)?
        };
        self.downloaded.store(offset, Ordering::Relaxed);

        self.copy(&mut response.body, &mut file)
            .map_err(|e| match e {
                Error::Io { source, .. } => Error::Io {
                    path: temp.to_path_buf(),
                    source,
                },
                e => e,
            })?;
        file.flush().at_path(temp)?;
        drop(file);

        if let Err(e) = verify_download(temp, &self.record) {
            // A corrupt partial file must not be resumed
            let _ = fs::remove_file(temp);
            return Err(e);
        }
        fs::rename(temp, dest).at_path(dest)
    }

    fn run_to_memory(&self) -> Result<Bytes> {
        let mut response = self.fetcher.fetch(&self.url, 0, self.timeout)?;
        let mut buf = Vec::with_capacity(self.record.size as usize);
        self.downloaded.store(0, Ordering::Relaxed);
        self.copy(&mut response.body, &mut buf)?;
        verify_bytes(&buf, &self.record)?;
        Ok(Bytes::from(buf))
    }
}

/// Download of one bundle file. Driven by whoever holds it, usually a
/// [`DownloaderOperation`](super::DownloaderOperation) or a bundle loader.
pub struct FileFetchOperation {
    state: OperationState,
    record: BundleRecord,
    target: FetchTarget,
    remote: Rc<RemoteServices>,
    fetcher: Arc<dyn Fetcher>,
    style: FileNameStyle,
    retry: u32,
    timeout: Duration,
    attempts: u32,
    cancel: Arc<AtomicBool>,
    downloaded: Arc<AtomicU64>,
    rx: Option<Receiver<Result<Option<Bytes>>>>,
    bytes: Option<Bytes>,
}

impl FileFetchOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record: BundleRecord,
        target: FetchTarget,
        remote: Rc<RemoteServices>,
        fetcher: Arc<dyn Fetcher>,
        style: FileNameStyle,
        retry: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            state: OperationState::default(),
            record,
            target,
            remote,
            fetcher,
            style,
            retry,
            timeout,
            attempts: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            downloaded: Arc::new(AtomicU64::new(0)),
            rx: None,
            bytes: None,
        }
    }

    pub fn record(&self) -> &BundleRecord {
        &self.record
    }

    /// Attempts started so far, the first one included
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed).min(self.record.size)
    }

    /// Content of a finished in-memory fetch
    pub fn bytes(&self) -> Option<Bytes> {
        self.bytes.clone()
    }

    fn spawn_attempt(&mut self) -> Result<()> {
        self.attempts += 1;
        let url = self.remote.next_url(&self.record.file_name(self.style))?;
        debug!(
            "Fetching {} from {url} (attempt {})",
            self.record.name, self.attempts
        );

        let paths = match &self.target {
            FetchTarget::Disk { temp, dest, .. } => Some((temp.clone(), dest.clone())),
            FetchTarget::Memory => None,
        };
        let job = Job {
            fetcher: self.fetcher.clone(),
            url,
            record: self.record.clone(),
            timeout: self.timeout,
            paths,
            cancel: self.cancel.clone(),
            downloaded: self.downloaded.clone(),
        };

        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(format!("fetch-{}", self.record.name))
            .spawn(move || {
                let _ = tx.send(job.run());
            })
            .map_err(|e| Error::io("fetch thread", e))?;
        self.rx = Some(rx);
        Ok(())
    }

    fn on_success(&mut self, bytes: Option<Bytes>) {
        if let FetchTarget::Disk { dest, index, .. } = &self.target {
            index.borrow_mut().insert(
                &self.record.hash,
                CacheEntry {
                    path: dest.clone(),
                    size: self.record.size,
                },
            );
        }
        info!("Downloaded {}", self.record.name);
        self.bytes = bytes;
        self.state.succeed();
    }

    fn on_error(&mut self, e: Error) {
        if e.is_transient() && self.attempts <= self.retry {
            warn!(
                "Fetch of {} failed ({e}), retrying {}/{}",
                self.record.name, self.attempts, self.retry
            );
            if let Err(e) = self.spawn_attempt() {
                self.state.fail(e);
            }
        } else {
            warn!("Giving up on {}: {e}", self.record.name);
            self.state.fail(e);
        }
    }
}

impl Operation for FileFetchOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn start(&mut self) {
        if let Err(e) = self.spawn_attempt() {
            self.state.fail(e);
        }
    }

    fn update(&mut self) {
        let Some(rx) = &self.rx else {
            return;
        };
        match rx.try_recv() {
            Ok(Ok(bytes)) => {
                self.rx = None;
                self.on_success(bytes);
            }
            Ok(Err(e)) => {
                self.rx = None;
                self.on_error(e);
            }
            Err(TryRecvError::Empty) => {
                if self.record.size > 0 {
                    let progress = self.downloaded_bytes() as f32 / self.record.size as f32;
                    self.state.set_progress(progress);
                }
            }
            Err(TryRecvError::Disconnected) => {
                self.rx = None;
                self.on_error(Error::Http {
                    url: self.record.name.clone(),
                    message: "Fetch thread exited without a result".to_string(),
                });
            }
        }
    }

    fn abort(&mut self, reason: Error) {
        self.cancel.store(true, Ordering::Release);
        self.rx = None;
        self.state.fail(reason);
    }
}

impl Drop for FileFetchOperation {
    fn drop(&mut self) {
        // Stop orphaned workers at their next chunk
        self.cancel.store(true, Ordering::Release);
    }
}

//! Reference-counted owners of decoded bundles.
//!
//! A [`BundleLoader`] walks one bundle from "maybe on disk" to "decoded in
//! memory". Loaders are shared through the [`LoaderPool`] by every provider
//! whose asset lives in the bundle or depends on it.

use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

use bytes::Bytes;
use log::{debug, error, warn};

use crate::{
    archive::LoadedBundle,
    download::FileFetchOperation,
    error::{Error, Result},
    file_system::FileSystemSet,
    manifest::BundleRecord,
    operation::{step, Operation, OperationState, OperationStatus},
    scheduler::Scheduler,
};

enum Stage {
    CheckFile,
    Fetching(Rc<RefCell<FileFetchOperation>>),
    Decoding(Bytes),
    Done,
}

pub struct BundleLoader {
    state: OperationState,
    record: BundleRecord,
    file_systems: Rc<FileSystemSet>,
    retry: u32,
    timeout: Duration,
    stage: Stage,
    ref_count: usize,
    bundle: Option<Rc<LoadedBundle>>,
    decode_count: usize,
}

impl BundleLoader {
    pub fn new(
        record: BundleRecord,
        file_systems: Rc<FileSystemSet>,
        retry: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            state: OperationState::default(),
            record,
            file_systems,
            retry,
            timeout,
            stage: Stage::CheckFile,
            ref_count: 0,
            bundle: None,
            decode_count: 0,
        }
    }

    pub fn record(&self) -> &BundleRecord {
        &self.record
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Decoded bundle. `None` until loaded, and after an unload.
    pub fn bundle(&self) -> Option<Rc<LoadedBundle>> {
        self.bundle.clone()
    }

    /// Times the bundle was decoded, at most one per loader
    pub fn decode_count(&self) -> usize {
        self.decode_count
    }

    pub fn reference(&mut self) {
        self.ref_count += 1;
    }

    pub fn release(&mut self) -> Result<()> {
        if self.ref_count == 0 {
            let e = Error::LoaderOverReleased(self.record.name.clone());
            error!("{e}");
            return Err(e);
        }
        self.ref_count -= 1;
        Ok(())
    }

    /// Unreferenced and not waiting on a download
    pub fn can_destroy(&self) -> bool {
        self.ref_count == 0 && !matches!(self.stage, Stage::Fetching(_))
    }

    fn destroy(&mut self) {
        debug!("Unloading bundle {}", self.record.name);
        self.bundle = None;
        self.stage = Stage::Done;
        self.state.fail(Error::BundleDestroyed(self.record.name.clone()));
    }

    /// Drop the decoded bundle behind the loader's back, the way a misbehaving
    /// host would.
    #[cfg(test)]
    pub(crate) fn simulate_host_unload(&mut self) {
        self.bundle = None;
    }

    fn check_file(&self) -> Result<Stage> {
        let fs = self.file_systems.select(&self.record)?;
        if fs.is_local(&self.record) {
            debug!("Reading {} from {}", self.record.name, fs.name());
            Ok(Stage::Decoding(fs.read(&self.record)?))
        } else {
            debug!("Fetching {} through {}", self.record.name, fs.name());
            let op = fs.fetch(&self.record, self.retry, self.timeout)?;
            Ok(Stage::Fetching(op))
        }
    }

    fn poll_fetch(&mut self, op: &Rc<RefCell<FileFetchOperation>>) -> Result<Option<Stage>> {
        let mut fetch = op.borrow_mut();
        step(&mut *fetch);
        self.state.set_progress(fetch.progress() * 0.9);
        match fetch.status() {
            OperationStatus::Succeeded => {
                let bytes = match fetch.bytes() {
                    Some(bytes) => bytes,
                    None => self.file_systems.select(&self.record)?.read(&self.record)?,
                };
                Ok(Some(Stage::Decoding(bytes)))
            }
            OperationStatus::Failed => Err(fetch
                .error()
                .cloned()
                .unwrap_or_else(|| Error::BundleNotFound(self.record.name.clone()))),
            _ => Ok(None),
        }
    }
}

impl Operation for BundleLoader {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn update(&mut self) {
        if let Stage::CheckFile = self.stage {
            match self.check_file() {
                Ok(stage) => self.stage = stage,
                Err(e) => {
                    self.stage = Stage::Done;
                    self.state.fail(e);
                    return;
                }
            }
        }

        if let Stage::Fetching(op) = &self.stage {
            let op = op.clone();
            match self.poll_fetch(&op) {
                Ok(Some(stage)) => self.stage = stage,
                Ok(None) => return,
                Err(e) => {
                    self.stage = Stage::Done;
                    self.state.fail(e);
                    return;
                }
            }
        }

        if let Stage::Decoding(bytes) = std::mem::replace(&mut self.stage, Stage::Done) {
            match LoadedBundle::decode(&self.record.name, bytes, self.record.is_raw_file) {
                Ok(bundle) => {
                    self.decode_count += 1;
                    self.bundle = Some(Rc::new(bundle));
                    debug!("Loaded bundle {}", self.record.name);
                    self.state.succeed();
                }
                Err(e) => {
                    // Undecodable files are dropped so the next load fetches them again
                    if let Ok(fs) = self.file_systems.select(&self.record) {
                        if let Err(e) = fs.remove(&self.record) {
                            warn!("Failed to remove corrupt {}: {e}", self.record.name);
                        }
                    }
                    self.state.fail(e);
                }
            }
        }
    }
}

/// Loaders of one package, keyed by bundle name
pub struct LoaderPool {
    scheduler: Scheduler,
    group: String,
    file_systems: Rc<FileSystemSet>,
    retry: u32,
    timeout: Duration,
    loaders: HashMap<String, Rc<RefCell<BundleLoader>>>,
}

impl LoaderPool {
    pub fn new(
        scheduler: Scheduler,
        group: &str,
        file_systems: Rc<FileSystemSet>,
        retry: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            group: group.to_string(),
            file_systems,
            retry,
            timeout,
            loaders: HashMap::new(),
        }
    }

    /// Referenced loader for a bundle, created and scheduled on first use
    pub fn acquire(&mut self, record: &BundleRecord) -> Rc<RefCell<BundleLoader>> {
        let loader = self
            .loaders
            .entry(record.name.clone())
            .or_insert_with(|| {
                let loader = Rc::new(RefCell::new(BundleLoader::new(
                    record.clone(),
                    self.file_systems.clone(),
                    self.retry,
                    self.timeout,
                )));
                self.scheduler.submit_shared(Some(&self.group), loader.clone());
                loader
            })
            .clone();
        loader.borrow_mut().reference();
        loader
    }

    pub fn release(&mut self, loader: &Rc<RefCell<BundleLoader>>) -> Result<()> {
        loader.borrow_mut().release()
    }

    pub fn get(&self, name: &str) -> Option<Rc<RefCell<BundleLoader>>> {
        self.loaders.get(name).cloned()
    }

    /// Unload every unreferenced loader, returns how many went
    pub fn collect_unused(&mut self) -> usize {
        let before = self.loaders.len();
        self.loaders.retain(|_, loader| match loader.try_borrow_mut() {
            Ok(mut loader) if loader.can_destroy() => {
                loader.destroy();
                false
            }
            _ => true,
        });
        before - self.loaders.len()
    }

    pub fn force_unload_all(&mut self) {
        for loader in self.loaders.values() {
            if let Ok(mut loader) = loader.try_borrow_mut() {
                loader.destroy();
            }
        }
        self.loaders.clear();
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

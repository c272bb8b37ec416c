//! Per-asset load state machine.
//!
//! A provider waits for its owner bundle and every dependency bundle, extracts
//! the requested object and hands the outcome to each handle attached to it.
//! Completion callbacks are snapshotted before they run: handles created by a
//! callback are not notified twice, handles released by one were still
//! notified.

use std::{
    cell::RefCell,
    collections::HashSet,
    fmt, mem,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error};

use crate::{
    archive::{AssetObject, LoadedBundle},
    bundle_loader::{BundleLoader, LoaderPool},
    error::{Error, Result},
    operation::{step, Notification, Operation, OperationState, OperationStatus},
};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneMode {
    Single,
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Asset,
    SubAssets,
    AllAssets,
    Scene(SceneMode),
    RawFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Extraction happens in the same update the bundles become ready
    Sync,
    /// Extraction completes one update later
    Async,
}

/// What a provider loads. Two requests with the same identity share a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetIdentity {
    pub kind: ProviderKind,
    pub path: String,
    pub asset_type: Option<String>,
}

impl AssetIdentity {
    pub fn new(kind: ProviderKind, path: &str, asset_type: Option<&str>) -> Self {
        Self {
            kind,
            path: path.to_string(),
            asset_type: asset_type.map(str::to_string),
        }
    }

    /// Stable key of the identity
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AssetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.path)?;
        if let Some(asset_type) = &self.asset_type {
            write!(f, ":{asset_type}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum LoadedAsset {
    Asset(AssetObject),
    SubAssets(Vec<AssetObject>),
    AllAssets(Vec<AssetObject>),
    Scene { scene: AssetObject, mode: SceneMode },
    RawFile(Bytes),
}

pub type LoadOutcome = Result<Rc<LoadedAsset>>;

pub type Completion = Box<dyn FnOnce(&LoadOutcome)>;

fn type_matches(object: &AssetObject, asset_type: Option<&str>) -> bool {
    asset_type.map_or(true, |t| object.asset_type == t)
}

impl AssetIdentity {
    /// Pull the requested object out of a decoded bundle
    fn extract(&self, bundle: &LoadedBundle) -> Option<LoadedAsset> {
        let asset_type = self.asset_type.as_deref();
        if self.kind == ProviderKind::RawFile {
            return bundle.raw().cloned().map(LoadedAsset::RawFile);
        }

        let archive = bundle.archive()?;
        match self.kind {
            ProviderKind::Asset => archive
                .read(&self.path)
                .filter(|o| type_matches(o, asset_type))
                .map(LoadedAsset::Asset),
            ProviderKind::SubAssets => {
                let objects: Vec<_> = archive
                    .read_sub_assets(&self.path)
                    .into_iter()
                    .filter(|o| type_matches(o, asset_type))
                    .collect();
                (!objects.is_empty()).then_some(LoadedAsset::SubAssets(objects))
            }
            ProviderKind::AllAssets => {
                let objects: Vec<_> = archive
                    .read_all()
                    .into_iter()
                    .filter(|o| type_matches(o, asset_type))
                    .collect();
                (!objects.is_empty()).then_some(LoadedAsset::AllAssets(objects))
            }
            ProviderKind::Scene(mode) => archive
                .read(&self.path)
                .map(|scene| LoadedAsset::Scene { scene, mode }),
            ProviderKind::RawFile => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStage {
    None,
    CheckBundle,
    Loading,
    Checking,
    Done,
}

struct HandleSlot {
    id: u64,
    callbacks: Vec<Completion>,
}

pub struct Provider {
    state: OperationState,
    identity: AssetIdentity,
    owner: Option<Rc<RefCell<BundleLoader>>>,
    dependencies: Vec<Rc<RefCell<BundleLoader>>>,
    stage: ProviderStage,
    mode: LoadMode,
    handles: Vec<HandleSlot>,
    released: HashSet<u64>,
    loading: Option<Rc<LoadedBundle>>,
    outcome: Option<LoadOutcome>,
    destroyed: bool,
    notifications: Vec<Notification>,
}

impl Provider {
    pub fn new(
        identity: AssetIdentity,
        owner: Rc<RefCell<BundleLoader>>,
        dependencies: Vec<Rc<RefCell<BundleLoader>>>,
        mode: LoadMode,
    ) -> Self {
        Self {
            state: OperationState::default(),
            identity,
            owner: Some(owner),
            dependencies,
            stage: ProviderStage::None,
            mode,
            handles: Vec::new(),
            released: HashSet::new(),
            loading: None,
            outcome: None,
            destroyed: false,
            notifications: Vec::new(),
        }
    }

    /// Provider that failed before it could start, e.g. unknown asset
    pub fn failed(identity: AssetIdentity, e: Error) -> Self {
        let mut state = OperationState::default();
        state.fail(e.clone());
        Self {
            state,
            identity,
            owner: None,
            dependencies: Vec::new(),
            stage: ProviderStage::Done,
            mode: LoadMode::Sync,
            handles: Vec::new(),
            released: HashSet::new(),
            loading: None,
            outcome: Some(Err(e)),
            destroyed: false,
            notifications: Vec::new(),
        }
    }

    pub fn identity(&self) -> &AssetIdentity {
        &self.identity
    }

    pub fn stage(&self) -> ProviderStage {
        self.stage
    }

    pub fn ref_count(&self) -> usize {
        self.handles.len()
    }

    pub fn outcome(&self) -> Option<LoadOutcome> {
        self.outcome.clone()
    }

    pub fn owner(&self) -> Option<&Rc<RefCell<BundleLoader>>> {
        self.owner.as_ref()
    }

    pub fn dependencies(&self) -> &[Rc<RefCell<BundleLoader>>] {
        &self.dependencies
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Attach a new handle, returns its id
    pub fn create_handle(&mut self) -> u64 {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        self.handles.push(HandleSlot {
            id,
            callbacks: Vec::new(),
        });
        id
    }

    pub fn release_handle(&mut self, id: u64) -> Result<()> {
        match self.handles.iter().position(|h| h.id == id) {
            Some(i) => {
                self.handles.swap_remove(i);
                self.released.insert(id);
                Ok(())
            }
            None => {
                let e = if self.released.contains(&id) {
                    Error::HandleReleased(id)
                } else {
                    Error::UnknownHandle(id)
                };
                error!("Releasing handle of {}: {e}", self.identity);
                Err(e)
            }
        }
    }

    /// Register a completion callback for a handle. Returns the callback when
    /// the provider has already finished, for the caller to run.
    pub(crate) fn add_callback(&mut self, id: u64, callback: Completion) -> Option<Completion> {
        if self.stage == ProviderStage::Done {
            return Some(callback);
        }
        match self.handles.iter_mut().find(|h| h.id == id) {
            Some(slot) => {
                slot.callbacks.push(callback);
                None
            }
            None => {
                error!("Callback registered for unknown handle {id}");
                None
            }
        }
    }

    /// No handles left and not in the middle of extracting
    pub fn can_destroy(&self) -> bool {
        self.handles.is_empty()
            && !matches!(
                self.stage,
                ProviderStage::Loading | ProviderStage::Checking
            )
    }

    /// Give back every loader reference. Terminal.
    pub fn destroy(&mut self, pool: &mut LoaderPool) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        debug!("Destroying provider {}", self.identity);
        for loader in self.owner.take().into_iter().chain(self.dependencies.drain(..)) {
            if let Err(e) = pool.release(&loader) {
                error!("Provider {} over-released a loader: {e}", self.identity);
            }
        }
        self.loading = None;
        if !self.state.is_done() {
            self.finish(Err(Error::UserCancelled));
        }
    }

    fn loaders(&self) -> impl Iterator<Item = &Rc<RefCell<BundleLoader>>> {
        self.owner.iter().chain(self.dependencies.iter())
    }

    fn finish(&mut self, outcome: LoadOutcome) {
        self.stage = ProviderStage::Done;
        match &outcome {
            Ok(_) => self.state.succeed(),
            Err(e) => {
                debug!("Provider {} failed: {e}", self.identity);
                self.state.fail(e.clone());
            }
        }
        self.outcome = Some(outcome.clone());

        // Snapshot: every live handle at this point is notified exactly once
        for slot in &mut self.handles {
            for callback in slot.callbacks.drain(..) {
                let outcome = outcome.clone();
                self.notifications.push(Box::new(move || callback(&outcome)));
            }
        }
    }

    fn check_bundles(&mut self) -> Option<Error> {
        let mut progress = 0.0;
        let mut count = 0;
        let mut ready = true;
        for loader in self.loaders() {
            let loader = loader.borrow();
            match loader.status() {
                OperationStatus::Failed => {
                    return Some(loader.error().cloned().unwrap_or_else(|| {
                        Error::BundleNotFound(loader.record().name.clone())
                    }));
                }
                OperationStatus::Succeeded => {}
                _ => ready = false,
            }
            progress += loader.progress();
            count += 1;
        }
        if count > 0 {
            self.state.set_progress(progress / count as f32 * 0.9);
        }
        if ready {
            self.stage = ProviderStage::Loading;
        }
        None
    }

    fn begin_extract(&mut self) -> Result<()> {
        let owner = self
            .owner
            .as_ref()
            .ok_or_else(|| Error::BundleDestroyed(self.identity.path.clone()))?
            .borrow();
        // Succeeded without a bundle means the host dropped it
        let bundle = owner
            .bundle()
            .ok_or_else(|| Error::BundleDestroyed(owner.record().name.clone()))?;
        drop(owner);
        self.loading = Some(bundle);
        self.stage = ProviderStage::Checking;
        Ok(())
    }

    fn check_extract(&mut self) {
        let Some(bundle) = self.loading.take() else {
            return;
        };
        let outcome = match self.identity.extract(&bundle) {
            Some(asset) => Ok(Rc::new(asset)),
            None => Err(Error::AssetNotInBundle {
                path: self.identity.path.clone(),
                bundle: self
                    .owner
                    .as_ref()
                    .map(|o| o.borrow().record().name.clone())
                    .unwrap_or_default(),
            }),
        };
        self.finish(outcome);
    }
}

impl Operation for Provider {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn update(&mut self) {
        if self.destroyed {
            return;
        }
        if self.stage == ProviderStage::None {
            self.stage = ProviderStage::CheckBundle;
        }

        if self.stage == ProviderStage::CheckBundle {
            if let Some(e) = self.check_bundles() {
                self.finish(Err(e));
                return;
            }
        }

        if self.stage == ProviderStage::Loading {
            if let Err(e) = self.begin_extract() {
                self.finish(Err(e));
                return;
            }
            if self.mode == LoadMode::Async {
                return;
            }
        }

        if self.stage == ProviderStage::Checking {
            self.check_extract();
        }
    }

    fn abort(&mut self, reason: Error) {
        if !self.state.is_done() {
            self.finish(Err(reason));
        }
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        mem::take(&mut self.notifications)
    }

    /// Load the bundles and extract on the calling thread
    fn wait_for_async_complete(&mut self) {
        self.mode = LoadMode::Sync;
        while !self.state.is_done() {
            for loader in self.loaders() {
                let mut loader = loader.borrow_mut();
                if !loader.is_done() {
                    step(&mut *loader);
                }
            }
            step(self);
            if !self.state.is_done() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

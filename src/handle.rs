//! Caller-facing tickets for loaded assets.
//!
//! Every handle holds one reference on its provider. Releasing the last one
//! lets the provider, and then its bundles, be unloaded on the next garbage
//! collection pass.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use bytes::Bytes;
use log::debug;

use crate::{
    archive::AssetObject,
    error::{Error, Result},
    operation::{complete_now, Operation, OperationStatus},
    provider::{LoadOutcome, LoadedAsset, Provider, SceneMode},
};

pub struct Handle {
    provider: Rc<RefCell<Provider>>,
    id: u64,
    valid: Cell<bool>,
}

impl Handle {
    pub(crate) fn new(provider: Rc<RefCell<Provider>>) -> Self {
        let id = provider.borrow_mut().create_handle();
        Self {
            provider,
            id,
            valid: Cell::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub fn status(&self) -> OperationStatus {
        self.provider.borrow().status()
    }

    pub fn progress(&self) -> f32 {
        self.provider.borrow().progress()
    }

    pub fn is_done(&self) -> bool {
        self.provider.borrow().is_done()
    }

    pub fn error(&self) -> Option<Error> {
        self.provider.borrow().error().cloned()
    }

    /// `None` while loading
    pub fn result(&self) -> Option<LoadOutcome> {
        self.provider.borrow().outcome()
    }

    fn loaded(&self) -> Option<Rc<LoadedAsset>> {
        self.result().and_then(|outcome| outcome.ok())
    }

    pub fn asset(&self) -> Option<AssetObject> {
        match self.loaded()?.as_ref() {
            LoadedAsset::Asset(object) => Some(object.clone()),
            _ => None,
        }
    }

    pub fn sub_assets(&self) -> Option<Vec<AssetObject>> {
        match self.loaded()?.as_ref() {
            LoadedAsset::SubAssets(objects) => Some(objects.clone()),
            _ => None,
        }
    }

    pub fn all_assets(&self) -> Option<Vec<AssetObject>> {
        match self.loaded()?.as_ref() {
            LoadedAsset::AllAssets(objects) => Some(objects.clone()),
            _ => None,
        }
    }

    pub fn scene(&self) -> Option<(AssetObject, SceneMode)> {
        match self.loaded()?.as_ref() {
            LoadedAsset::Scene { scene, mode } => Some((scene.clone(), *mode)),
            _ => None,
        }
    }

    pub fn raw_data(&self) -> Option<Bytes> {
        match self.loaded()?.as_ref() {
            LoadedAsset::RawFile(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Run `f` once the load finishes, right away if it already has
    pub fn on_completed(&self, f: impl FnOnce(&LoadOutcome) + 'static) {
        let ready = self
            .provider
            .borrow_mut()
            .add_callback(self.id, Box::new(f));
        if let Some(f) = ready {
            let outcome = self
                .provider
                .borrow()
                .outcome()
                .unwrap_or(Err(Error::HandleReleased(self.id)));
            f(&outcome);
        }
    }

    /// Block until the load finishes
    pub fn wait_for_async_complete(&self) {
        complete_now(&self.provider);
    }

    pub fn release(&self) -> Result<()> {
        if !self.valid.replace(false) {
            return Err(Error::HandleReleased(self.id));
        }
        self.provider.borrow_mut().release_handle(self.id)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.valid.get() {
            return;
        }
        match self.provider.try_borrow_mut() {
            Ok(mut provider) => {
                self.valid.set(false);
                let _ = provider.release_handle(self.id);
            }
            Err(_) => debug!("Provider busy, leaking handle {}", self.id),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("valid", &self.valid.get())
            .finish()
    }
}

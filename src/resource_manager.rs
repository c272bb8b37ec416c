//! Registry of the live providers of a package.
//!
//! Requests for an identity that already has a provider attach a new handle to
//! it. Providers without handles are destroyed by [`ResourceManager::collect_garbage`],
//! which also unloads bundles nothing references any more. A destroyed
//! provider is never reused.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use log::debug;

use crate::{
    bundle_loader::LoaderPool,
    error::{Error, Result},
    handle::Handle,
    manifest::Manifest,
    operation::{Operation, OperationState},
    provider::{AssetIdentity, LoadMode, Provider, ProviderKind},
    scheduler::Scheduler,
};

pub struct ResourceManager {
    scheduler: Scheduler,
    group: String,
    loaders: LoaderPool,
    providers: HashMap<String, Rc<RefCell<Provider>>>,
}

impl ResourceManager {
    pub fn new(scheduler: Scheduler, group: &str, loaders: LoaderPool) -> Self {
        Self {
            scheduler,
            group: group.to_string(),
            loaders,
            providers: HashMap::new(),
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }

    pub fn loaders(&self) -> &LoaderPool {
        &self.loaders
    }

    pub fn provider(&self, identity: &AssetIdentity) -> Option<Rc<RefCell<Provider>>> {
        self.providers.get(&identity.key()).cloned()
    }

    /// Handle on the provider for `identity`, creating and scheduling the
    /// provider if there is none yet
    pub fn load(&mut self, manifest: &Manifest, identity: AssetIdentity, mode: LoadMode) -> Handle {
        let key = identity.key();
        if let Some(provider) = self.providers.get(&key) {
            return Handle::new(provider.clone());
        }

        let provider = match self.create_provider(manifest, &identity, mode) {
            Ok(provider) => provider,
            Err(e) => Provider::failed(identity, e),
        };
        let provider = Rc::new(RefCell::new(provider));
        if !provider.borrow().is_done() {
            self.scheduler.submit_shared(Some(&self.group), provider.clone());
        }
        debug!("Created provider {key}");
        self.providers.insert(key, provider.clone());
        Handle::new(provider)
    }

    fn create_provider(
        &mut self,
        manifest: &Manifest,
        identity: &AssetIdentity,
        mode: LoadMode,
    ) -> Result<Provider> {
        let asset = manifest.asset(&identity.path)?;
        let owner = manifest.owner_bundle(asset);
        match (identity.kind == ProviderKind::RawFile, owner.is_raw_file) {
            (true, false) => return Err(Error::NotRawBundle(owner.name.clone())),
            (false, true) => return Err(Error::RawBundle(owner.name.clone())),
            _ => {}
        }

        let owner = self.loaders.acquire(owner);
        let dependencies = manifest
            .dependency_bundles(asset)
            .into_iter()
            .map(|record| self.loaders.acquire(record))
            .collect();
        Ok(Provider::new(identity.clone(), owner, dependencies, mode))
    }

    /// Destroy unreferenced providers and unload the bundles they held.
    /// Returns the number of providers destroyed.
    pub fn collect_garbage(&mut self) -> usize {
        let loaders = &mut self.loaders;
        let before = self.providers.len();
        self.providers.retain(|_, provider| match provider.try_borrow_mut() {
            Ok(mut provider) if provider.can_destroy() => {
                provider.destroy(loaders);
                false
            }
            _ => true,
        });
        let destroyed = before - self.providers.len();
        let unloaded = self.loaders.collect_unused();
        if destroyed > 0 || unloaded > 0 {
            debug!("Destroyed {destroyed} providers, unloaded {unloaded} bundles");
        }
        destroyed
    }

    /// Tear everything down, whether referenced or not
    pub fn force_unload_all(&mut self) {
        for provider in self.providers.values() {
            if let Ok(mut provider) = provider.try_borrow_mut() {
                provider.destroy(&mut self.loaders);
            }
        }
        self.providers.clear();
        self.loaders.force_unload_all();
    }
}

/// Runs garbage collection of a resource manager once per tick, for as long
/// as the manager lives
pub struct MaintenanceOperation {
    state: OperationState,
    manager: Weak<RefCell<ResourceManager>>,
}

impl MaintenanceOperation {
    pub fn new(manager: &Rc<RefCell<ResourceManager>>) -> Self {
        Self {
            state: OperationState::default(),
            manager: Rc::downgrade(manager),
        }
    }
}

impl Operation for MaintenanceOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn update(&mut self) {
        match self.manager.upgrade() {
            Some(manager) => {
                if let Ok(mut manager) = manager.try_borrow_mut() {
                    manager.collect_garbage();
                }
            }
            None => self.state.succeed(),
        }
    }
}

//! The public surface of one resource package.
//!
//! Typical flow: request the package version, update the manifest, verify the
//! cache, create and begin a downloader, then load assets through handles.
//! Everything the package schedules runs in a scheduler group named after the
//! package, so dropping the package stops all of it.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use log::{debug, info};

use crate::{
    bundle_loader::LoaderPool,
    cache::{
        app_version::reset_on_app_upgrade, CacheIndex, CacheLayout, ClearCacheMode,
        ClearCacheOperation, VerifyCacheOperation,
    },
    download::DownloaderOperation,
    error::{Error, Result},
    file_system::{BuiltinFileSystem, CacheFileSystem, FileSystem, FileSystemSet, WebFileSystem},
    handle::Handle,
    manifest::{BundleRecord, Manifest},
    operation::OperationRef,
    provider::{AssetIdentity, LoadMode, Provider, ProviderKind, SceneMode},
    remote::{Fetcher, RemoteServices},
    resource_manager::{MaintenanceOperation, ResourceManager},
    scheduler::Scheduler,
    settings::{PackageSettings, StorageMode},
};

pub mod update;

pub use update::{ManifestSource, RequestPackageVersionOperation, UpdateManifestOperation};

pub struct ResourcePackage {
    settings: PackageSettings,
    scheduler: Scheduler,
    source: Rc<ManifestSource>,
    layout: Option<CacheLayout>,
    index: Rc<RefCell<CacheIndex>>,
    file_systems: Rc<FileSystemSet>,
    manager: Rc<RefCell<ResourceManager>>,
    manifest: Rc<RefCell<Option<Rc<Manifest>>>>,
}

impl ResourcePackage {
    pub fn new(
        settings: PackageSettings,
        scheduler: Scheduler,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        settings.validate()?;
        scheduler.set_max_time_slice(settings.time_slice());

        let remote = match settings.storage_mode {
            StorageMode::Offline => None,
            _ => settings
                .primary_url
                .clone()
                .map(|url| Rc::new(RemoteServices::new(url, settings.fallback_url.clone()))),
        };
        let builtin = settings
            .builtin_root
            .as_ref()
            .map(|root| BuiltinFileSystem::new(root, settings.file_name_style));
        let mut index = Rc::new(RefCell::new(CacheIndex::default()));
        let mut layout = None;
        let remote_fs: Option<Box<dyn FileSystem>> = match (settings.storage_mode, &remote) {
            (StorageMode::Host, Some(remote)) => {
                let cache =
                    CacheLayout::new(settings.package_cache_dir(), settings.file_name_style);
                if settings.clear_cache_on_app_upgrade {
                    reset_on_app_upgrade(&cache, &settings.app_version)?;
                }
                cache.ensure_dirs()?;
                index = Rc::new(RefCell::new(CacheIndex::open(cache.index_path())));
                debug!("Opened cache index with {} files", index.borrow().len());
                layout = Some(cache.clone());
                Some(Box::new(CacheFileSystem::new(
                    cache,
                    index.clone(),
                    remote.clone(),
                    fetcher.clone(),
                )))
            }
            (StorageMode::Web, Some(remote)) => Some(Box::new(WebFileSystem::new(
                remote.clone(),
                fetcher.clone(),
                settings.file_name_style,
            ))),
            _ => None,
        };

        let source = match (remote, &settings.builtin_root) {
            (Some(remote), _) => ManifestSource::Remote { remote, fetcher },
            (None, Some(root)) => ManifestSource::Builtin(root.clone()),
            (None, None) => {
                return Err(Error::Settings(
                    "no remote or built-in source for manifests".to_string(),
                ))
            }
        };

        let file_systems = Rc::new(FileSystemSet::new(builtin, remote_fs));
        let pool = LoaderPool::new(
            scheduler.clone(),
            &settings.package_name,
            file_systems.clone(),
            settings.download_retry,
            settings.download_timeout(),
        );
        let manager = Rc::new(RefCell::new(ResourceManager::new(
            scheduler.clone(),
            &settings.package_name,
            pool,
        )));
        scheduler.submit(
            Some(&settings.package_name),
            MaintenanceOperation::new(&manager),
        );

        info!(
            "Created package {} in {:?} mode",
            settings.package_name, settings.storage_mode
        );
        Ok(Self {
            settings,
            scheduler,
            source: Rc::new(source),
            layout,
            index,
            file_systems,
            manager,
            manifest: Rc::new(RefCell::new(None)),
        })
    }

    pub fn package_name(&self) -> &str {
        &self.settings.package_name
    }

    pub fn settings(&self) -> &PackageSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Cache directory layout, `None` unless the package caches on disk
    pub fn cache_layout(&self) -> Option<&CacheLayout> {
        self.layout.as_ref()
    }

    pub fn cached_file_count(&self) -> usize {
        self.index.borrow().len()
    }

    fn group(&self) -> Option<&str> {
        Some(&self.settings.package_name)
    }

    pub fn request_package_version(&self) -> OperationRef<RequestPackageVersionOperation> {
        let op = RequestPackageVersionOperation::new(
            &self.settings.package_name,
            &self.source,
            self.settings.download_retry,
            self.settings.download_timeout(),
        );
        self.scheduler.submit(self.group(), op)
    }

    /// Fetch the manifest of `version` and make it the active one
    pub fn update_package_manifest(&self, version: &str) -> OperationRef<UpdateManifestOperation> {
        let op = UpdateManifestOperation::new(
            &self.settings.package_name,
            version,
            self.source.clone(),
            self.layout.clone(),
            self.manifest.clone(),
            self.settings.download_retry,
            self.settings.download_timeout(),
        );
        self.scheduler.submit(self.group(), op)
    }

    pub fn active_manifest(&self) -> Option<Rc<Manifest>> {
        self.manifest.borrow().clone()
    }

    pub fn package_version(&self) -> Option<String> {
        self.active_manifest().map(|m| m.package_version.clone())
    }

    fn require_manifest(&self) -> Result<Rc<Manifest>> {
        self.active_manifest().ok_or(Error::ManifestMissing)
    }

    fn require_layout(&self) -> Result<&CacheLayout> {
        self.layout.as_ref().ok_or_else(|| {
            Error::Settings(format!(
                "storage mode {:?} has no disk cache",
                self.settings.storage_mode
            ))
        })
    }

    /// Check the cached files of the active manifest and register the intact
    /// ones. Files the index lost track of are picked up again.
    pub fn verify_cache(&self) -> Result<OperationRef<VerifyCacheOperation>> {
        let manifest = self.require_manifest()?;
        let token = self.scheduler.group_token(self.group());
        let op = match &self.layout {
            Some(layout) => VerifyCacheOperation::for_manifest(
                &manifest,
                layout,
                self.index.clone(),
                self.settings.verify_level,
                self.settings.verify_mode,
                self.settings.max_verify_in_flight(),
                token,
            ),
            None => VerifyCacheOperation::new(
                Vec::new(),
                self.index.clone(),
                self.settings.verify_level,
                self.settings.verify_mode,
                self.settings.max_verify_in_flight(),
                token,
            ),
        };
        Ok(self.scheduler.submit(self.group(), op))
    }

    fn downloader<'a>(
        &self,
        records: impl IntoIterator<Item = &'a BundleRecord>,
    ) -> DownloaderOperation {
        let records: Vec<_> = records
            .into_iter()
            .filter(|record| self.file_systems.need_download(record))
            .cloned()
            .collect();
        debug!("Creating downloader for {} files", records.len());
        DownloaderOperation::new(
            &self.settings.package_name,
            self.file_systems.clone(),
            records,
            self.settings.download_concurrency(),
            self.settings.download_retry,
            self.settings.download_timeout(),
        )
    }

    /// Downloader for every bundle of the active manifest not available yet
    pub fn create_resource_downloader(&self) -> Result<DownloaderOperation> {
        let manifest = self.require_manifest()?;
        Ok(self.downloader(&manifest.bundles))
    }

    pub fn create_resource_downloader_by_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> Result<DownloaderOperation> {
        let manifest = self.require_manifest()?;
        Ok(self.downloader(manifest.bundles_by_tags(tags)))
    }

    /// Downloader for the owner and dependency bundles of the given assets
    pub fn create_resource_downloader_by_paths<S: AsRef<str>>(
        &self,
        paths: &[S],
    ) -> Result<DownloaderOperation> {
        let manifest = self.require_manifest()?;
        let bundles = manifest.bundles_for_assets(paths)?;
        Ok(self.downloader(bundles))
    }

    /// Hand a downloader to the scheduler. Pause, resume and cancel go through
    /// the returned reference.
    pub fn begin_download(
        &self,
        downloader: DownloaderOperation,
    ) -> OperationRef<DownloaderOperation> {
        self.scheduler.submit(self.group(), downloader)
    }

    fn load(
        &self,
        kind: ProviderKind,
        path: &str,
        asset_type: Option<&str>,
        mode: LoadMode,
    ) -> Handle {
        let identity = AssetIdentity::new(kind, path, asset_type);
        let handle = match self.require_manifest() {
            Ok(manifest) => self.manager.borrow_mut().load(&manifest, identity, mode),
            Err(e) => Handle::new(Rc::new(RefCell::new(Provider::failed(identity, e)))),
        };
        if mode == LoadMode::Sync {
            handle.wait_for_async_complete();
        }
        handle
    }

    pub fn load_asset_sync(&self, path: &str, asset_type: Option<&str>) -> Handle {
        self.load(ProviderKind::Asset, path, asset_type, LoadMode::Sync)
    }

    pub fn load_asset_async(&self, path: &str, asset_type: Option<&str>) -> Handle {
        self.load(ProviderKind::Asset, path, asset_type, LoadMode::Async)
    }

    pub fn load_sub_assets_sync(&self, path: &str, asset_type: Option<&str>) -> Handle {
        self.load(ProviderKind::SubAssets, path, asset_type, LoadMode::Sync)
    }

    pub fn load_sub_assets_async(&self, path: &str, asset_type: Option<&str>) -> Handle {
        self.load(ProviderKind::SubAssets, path, asset_type, LoadMode::Async)
    }

    /// Every asset of the bundle owning `path`
    pub fn load_all_assets_sync(&self, path: &str, asset_type: Option<&str>) -> Handle {
        self.load(ProviderKind::AllAssets, path, asset_type, LoadMode::Sync)
    }

    pub fn load_all_assets_async(&self, path: &str, asset_type: Option<&str>) -> Handle {
        self.load(ProviderKind::AllAssets, path, asset_type, LoadMode::Async)
    }

    pub fn load_scene_sync(&self, path: &str, mode: SceneMode) -> Handle {
        self.load(ProviderKind::Scene(mode), path, None, LoadMode::Sync)
    }

    pub fn load_scene_async(&self, path: &str, mode: SceneMode) -> Handle {
        self.load(ProviderKind::Scene(mode), path, None, LoadMode::Async)
    }

    pub fn load_raw_file_sync(&self, path: &str) -> Handle {
        self.load(ProviderKind::RawFile, path, None, LoadMode::Sync)
    }

    pub fn load_raw_file_async(&self, path: &str) -> Handle {
        self.load(ProviderKind::RawFile, path, None, LoadMode::Async)
    }

    /// Destroy providers without handles and unload bundles nothing uses.
    /// Returns the number of providers destroyed.
    pub fn unload_unused_assets(&self) -> usize {
        self.manager.borrow_mut().collect_garbage()
    }

    /// Unload everything. Outstanding handles keep their last result.
    pub fn force_unload_all_assets(&self) {
        self.manager.borrow_mut().force_unload_all();
    }

    pub fn provider_count(&self) -> usize {
        self.manager.borrow().provider_count()
    }

    pub fn loaded_bundle_count(&self) -> usize {
        self.manager.borrow().loader_count()
    }

    /// Delete cached files the active manifest no longer references
    pub fn clear_unused_cache_files(&self) -> Result<OperationRef<ClearCacheOperation>> {
        let manifest = self.require_manifest()?;
        let layout = self.require_layout()?;
        let mode = ClearCacheMode::unused(&manifest, layout);
        Ok(self.clear_cache(layout.clone(), mode))
    }

    pub fn clear_all_cache_files(&self) -> Result<OperationRef<ClearCacheOperation>> {
        let layout = self.require_layout()?;
        Ok(self.clear_cache(layout.clone(), ClearCacheMode::All))
    }

    fn clear_cache(
        &self,
        layout: CacheLayout,
        mode: ClearCacheMode,
    ) -> OperationRef<ClearCacheOperation> {
        let op = ClearCacheOperation::new(
            layout,
            self.index.clone(),
            mode,
            self.settings.eviction_files_per_tick,
        );
        self.scheduler.submit(self.group(), op)
    }

    /// Unload everything and stop every operation of the package
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for ResourcePackage {
    fn drop(&mut self) {
        if let Ok(mut manager) = self.manager.try_borrow_mut() {
            manager.force_unload_all();
        }
        self.scheduler.clear_group(&self.settings.package_name);
        debug!("Destroyed package {}", self.settings.package_name);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, thread, time::Duration};

    use url::Url;

    use super::*;
    use crate::{
        cache::verify_file,
        manifest::AssetRecord,
        operation::OperationStatus,
        settings::{FileNameStyle, VerifyLevel, VerifyMode},
        test_utils::{bundle_record, publish, run_until_done, ArchiveBuilder, MemoryFetcher},
    };

    struct Fixture {
        dir: tempfile::TempDir,
        fetcher: Arc<MemoryFetcher>,
        scheduler: Scheduler,
        package: ResourcePackage,
    }

    fn settings(dir: &tempfile::TempDir) -> PackageSettings {
        PackageSettings {
            package_name: "main".to_string(),
            storage_mode: StorageMode::Host,
            cache_root: dir.path().to_path_buf(),
            primary_url: Some(Url::parse("https://primary.test/main/").unwrap()),
            fallback_url: Some(Url::parse("https://fallback.test/main/").unwrap()),
            file_name_style: FileNameStyle::Hash,
            verify_mode: VerifyMode::MultiThread,
            download_retry: 1,
            download_timeout_secs: 5,
            eviction_files_per_tick: 2,
            ..PackageSettings::default()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::default());
        let scheduler = Scheduler::default();
        let package =
            ResourcePackage::new(settings(&dir), scheduler.clone(), fetcher.clone()).unwrap();
        Fixture {
            dir,
            fetcher,
            scheduler,
            package,
        }
    }

    // Bundle "b" depends on "a", `extra` more independent bundles follow
    fn publish_version(f: &Fixture, version: &str, extra: &[&str]) -> Manifest {
        let mut contents = HashMap::new();
        let mut bundles = Vec::new();
        let mut assets = Vec::new();
        let names = ["a", "b"].iter().chain(extra).copied();
        for (i, name) in names.enumerate() {
            let path = format!("{name}/asset.bin");
            let data = ArchiveBuilder::default()
                .add(&path, "blob", format!("{name} {version}").as_bytes())
                .build();
            bundles.push(bundle_record(name, &data));
            assets.push(AssetRecord {
                path,
                bundle: i as u32,
                dependencies: vec![],
            });
            contents.insert(name.to_string(), data);
        }
        bundles[1].dependencies = vec![0];
        assets[1].dependencies = vec![0];
        let manifest = Manifest::new("main", version, bundles, assets).unwrap();
        publish(&f.fetcher, &manifest, &contents);
        manifest
    }

    fn activate(f: &Fixture, version: &str) {
        let op = f.package.update_package_manifest(version);
        run_until_done(&f.scheduler, &op);
        assert_eq!(f.package.package_version().as_deref(), Some(version));
    }

    fn download_all(f: &Fixture) {
        let downloader = f.package.create_resource_downloader().unwrap();
        let op = f.package.begin_download(downloader);
        run_until_done(&f.scheduler, &op);
        assert_eq!(op.status(), Some(OperationStatus::Succeeded));
    }

    #[test]
    fn version_then_manifest() {
        let f = fixture();
        publish_version(&f, "v1", &[]);
        let op = f.package.request_package_version();
        run_until_done(&f.scheduler, &op);
        let version = op.with(|op| op.version().map(str::to_string)).flatten().unwrap();
        assert_eq!(version, "v1");
        activate(&f, &version);
    }

    #[test]
    fn loading_without_manifest_fails_cleanly() {
        let f = fixture();
        let handle = f.package.load_asset_sync("a/asset.bin", None);
        assert_eq!(handle.status(), OperationStatus::Failed);
        assert!(matches!(handle.error(), Some(Error::ManifestMissing)));
        assert!(matches!(
            f.package.create_resource_downloader(),
            Err(Error::ManifestMissing)
        ));
    }

    #[test]
    fn asset_waits_for_dependency_and_unloads_with_it() {
        let f = fixture();
        publish_version(&f, "v1", &[]);
        activate(&f, "v1");

        let downloader = f
            .package
            .create_resource_downloader_by_paths(&["b/asset.bin"])
            .unwrap();
        assert_eq!(downloader.total_download_count(), 2);

        // Loading alone fetches both bundles on demand, "a" held back for now
        let a_hash = f.package.active_manifest().unwrap().bundles[0].hash.clone();
        f.fetcher.block(&a_hash);
        let handle = f.package.load_asset_async("b/asset.bin", None);
        for _ in 0..20 {
            f.scheduler.tick();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!handle.is_done());

        f.fetcher.unblock_all();
        while !handle.is_done() {
            f.scheduler.tick();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.asset().unwrap().data.as_ref(), b"b v1");
        assert_eq!(f.package.loaded_bundle_count(), 2);

        drop(handle);
        f.scheduler.tick();
        assert_eq!(f.package.provider_count(), 0);
        assert_eq!(f.package.loaded_bundle_count(), 0);
    }

    #[test]
    fn corrupted_cache_file_is_refetched() {
        let f = fixture();
        let manifest = publish_version(&f, "v1", &["c"]);
        activate(&f, "v1");
        download_all(&f);
        assert_eq!(f.package.cached_file_count(), 3);

        // The next run trusts its index until a verify pass says otherwise
        let layout = f.package.cache_layout().unwrap().clone();
        let victim = &manifest.bundles[2];
        let path = layout.bundle_path(victim);
        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xff;
        fs::write(&path, data).unwrap();

        let scheduler = Scheduler::default();
        let package =
            ResourcePackage::new(settings(&f.dir), scheduler.clone(), f.fetcher.clone()).unwrap();
        assert_eq!(package.cached_file_count(), 3);
        run_until_done(&scheduler, &package.update_package_manifest("v1"));
        let verify = package.verify_cache().unwrap();
        run_until_done(&scheduler, &verify);
        let fail_names = verify
            .with(|op| {
                op.verify_fail_list()
                    .iter()
                    .map(|(record, _)| record.name.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(fail_names, vec!["c".to_string()]);
        assert_eq!(package.cached_file_count(), 2);

        let before = f.fetcher.requests().len();
        let downloader = package.create_resource_downloader().unwrap();
        assert_eq!(downloader.total_download_count(), 1);
        run_until_done(&scheduler, &package.begin_download(downloader));
        assert_eq!(f.fetcher.requests().len(), before + 1);
        assert!(verify_file(&path, victim, VerifyLevel::High).is_ok());
    }

    #[test]
    fn restart_reuses_cached_bundles() {
        let f = fixture();
        publish_version(&f, "v1", &[]);
        activate(&f, "v1");
        download_all(&f);

        let scheduler = Scheduler::default();
        let package =
            ResourcePackage::new(settings(&f.dir), scheduler.clone(), f.fetcher.clone()).unwrap();
        assert_eq!(package.cached_file_count(), 2);
        run_until_done(&scheduler, &package.update_package_manifest("v1"));
        assert_eq!(package.create_resource_downloader().unwrap().total_download_count(), 0);

        let before = f.fetcher.requests().len();
        let handle = package.load_asset_sync("b/asset.bin", None);
        assert_eq!(handle.asset().unwrap().data.as_ref(), b"b v1");
        assert_eq!(f.fetcher.requests().len(), before);
    }

    #[test]
    fn tampered_download_never_reaches_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::default());
        let scheduler = Scheduler::default();
        let settings = PackageSettings {
            verify_level: VerifyLevel::Low,
            ..settings(&dir)
        };
        let package = ResourcePackage::new(settings, scheduler.clone(), fetcher.clone()).unwrap();
        let f = Fixture {
            dir,
            fetcher,
            scheduler,
            package,
        };
        let manifest = publish_version(&f, "v1", &[]);
        activate(&f, "v1");
        let victim = &manifest.bundles[0];
        f.fetcher.insert(&victim.hash, vec![0u8; victim.size as usize]);

        let downloader = f.package.create_resource_downloader().unwrap();
        let op = f.package.begin_download(downloader);
        run_until_done(&f.scheduler, &op);

        assert_eq!(op.status(), Some(OperationStatus::Failed));
        assert!(matches!(
            op.error(),
            Some(Error::DownloadFailed { file, .. }) if file == victim.name
        ));
        assert!(f.package.cached_file_count() <= 1);
        let layout = f.package.cache_layout().unwrap();
        assert!(!layout.bundle_path(victim).exists());
        assert!(!layout.temp_path(victim).exists());
    }

    #[test]
    fn eviction_keeps_files_shared_with_new_version() {
        let f = fixture();
        let v1 = publish_version(&f, "v1", &["old"]);
        activate(&f, "v1");
        download_all(&f);

        let v2 = publish_version(&f, "v2", &[]);
        activate(&f, "v2");
        let layout = f.package.cache_layout().unwrap().clone();
        // "a" and "b" differ between versions, the new ones are not cached yet
        download_all(&f);

        let op = f.package.clear_unused_cache_files().unwrap();
        run_until_done(&f.scheduler, &op);

        for record in &v2.bundles {
            assert!(layout.bundle_path(record).exists());
        }
        for record in &v1.bundles {
            assert!(!layout.bundle_path(record).exists());
        }
        assert_eq!(f.package.cached_file_count(), v2.bundles.len());
    }

    #[test]
    fn raw_files_use_their_own_api() {
        let f = fixture();
        let data = b"raw config".to_vec();
        let record = BundleRecord {
            is_raw_file: true,
            ..bundle_record("config", &data)
        };
        let manifest = Manifest::new(
            "main",
            "v1",
            vec![record],
            vec![AssetRecord {
                path: "config.bin".to_string(),
                bundle: 0,
                dependencies: vec![],
            }],
        )
        .unwrap();
        publish(
            &f.fetcher,
            &manifest,
            &HashMap::from([("config".to_string(), data.clone())]),
        );
        activate(&f, "v1");

        let raw = f.package.load_raw_file_sync("config.bin");
        assert_eq!(raw.raw_data().unwrap().as_ref(), data.as_slice());
        let wrong = f.package.load_asset_sync("config.bin", None);
        assert!(matches!(wrong.error(), Some(Error::RawBundle(_))));
    }

    #[test]
    fn dropping_the_package_stops_its_operations() {
        let f = fixture();
        publish_version(&f, "v1", &[]);
        activate(&f, "v1");
        let hash = f.package.active_manifest().unwrap().bundles[0].hash.clone();
        f.fetcher.block(&hash);
        let downloader = f.package.create_resource_downloader().unwrap();
        let op = f.package.begin_download(downloader);
        f.scheduler.tick();

        let Fixture {
            package, scheduler, fetcher, ..
        } = f;
        drop(package);
        fetcher.unblock_all();
        // Removed from the scheduler, nothing owns the downloader any more
        assert!(!op.is_alive());
        scheduler.tick();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn dropping_the_package_notifies_pending_work() {
        let f = fixture();
        publish_version(&f, "v1", &[]);
        activate(&f, "v1");
        let manifest = f.package.active_manifest().unwrap();
        for record in &manifest.bundles {
            f.fetcher.block(&record.hash);
        }

        let handle = f.package.load_asset_async("a/asset.bin", None);
        let load_outcomes = Rc::new(RefCell::new(Vec::new()));
        {
            let load_outcomes = load_outcomes.clone();
            handle.on_completed(move |outcome| {
                load_outcomes.borrow_mut().push(outcome.is_ok());
            });
        }
        let mut downloader = f.package.create_resource_downloader().unwrap();
        let finished = Rc::new(RefCell::new(Vec::new()));
        {
            let finished = finished.clone();
            downloader.set_finish_callback(move |succeeded| finished.borrow_mut().push(succeeded));
        }
        f.package.begin_download(downloader);
        for _ in 0..3 {
            f.scheduler.tick();
        }
        assert!(load_outcomes.borrow().is_empty());

        let Fixture {
            package,
            scheduler,
            fetcher,
            ..
        } = f;
        drop(package);
        fetcher.unblock_all();
        for _ in 0..5 {
            scheduler.tick();
        }

        assert_eq!(*load_outcomes.borrow(), vec![false]);
        assert_eq!(*finished.borrow(), vec![false]);
        assert_eq!(handle.status(), OperationStatus::Failed);
    }
}

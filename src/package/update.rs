//! Discovery of the latest package version and download of its manifest

use std::{cell::RefCell, fs, path::PathBuf, rc::Rc, sync::Arc, time::Duration};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::{
    cache::CacheLayout,
    error::{Error, IoContext, Result},
    hasher::content_hash,
    manifest::{hash_file_name, manifest_file_name, version_file_name, Manifest},
    operation::{Operation, OperationState},
    remote::{Fetcher, RemoteServices, WebRequest},
};

/// Where version, hash and manifest files come from
pub enum ManifestSource {
    Remote {
        remote: Rc<RemoteServices>,
        fetcher: Arc<dyn Fetcher>,
    },
    /// Shipped with the application next to the built-in bundles
    Builtin(PathBuf),
}

impl ManifestSource {
    fn request(&self, file_name: &str, retry: u32, timeout: Duration) -> FileRequest {
        match self {
            ManifestSource::Remote { remote, fetcher } => FileRequest::Remote {
                file_name: file_name.to_string(),
                remote: remote.clone(),
                fetcher: fetcher.clone(),
                retry,
                timeout,
                attempts: 0,
                request: None,
            },
            ManifestSource::Builtin(root) => {
                let path = root.join(file_name);
                FileRequest::Local(Some(fs::read(&path).at_path(&path).map(Bytes::from)))
            }
        }
    }
}

/// Small metadata file, fetched whole
enum FileRequest {
    Local(Option<Result<Bytes>>),
    Remote {
        file_name: String,
        remote: Rc<RemoteServices>,
        fetcher: Arc<dyn Fetcher>,
        retry: u32,
        timeout: Duration,
        attempts: u32,
        request: Option<WebRequest>,
    },
}

impl FileRequest {
    /// `Some` once the file arrived or every attempt failed
    fn poll(&mut self) -> Option<Result<Bytes>> {
        match self {
            FileRequest::Local(result) => result.take(),
            FileRequest::Remote {
                file_name,
                remote,
                fetcher,
                retry,
                timeout,
                attempts,
                request,
            } => {
                if request.is_none() {
                    let url = match remote.next_url(file_name) {
                        Ok(url) => url,
                        Err(e) => return Some(Err(e)),
                    };
                    *attempts += 1;
                    *request = Some(WebRequest::get(fetcher.clone(), url, *timeout));
                }

                let result = request.as_mut()?.take_result()?;
                let url = request.take().map(|r| r.url().to_string()).unwrap_or_default();
                match result {
                    Err(e) if e.is_transient() && *attempts <= *retry => {
                        warn!("Attempt {attempts} for {url} failed, retrying: {e}");
                        None
                    }
                    result => Some(result),
                }
            }
        }
    }
}

// Version and hash files hold a single trimmed line
fn parse_line(bytes: &[u8], what: &str) -> Result<String> {
    let line = String::from_utf8_lossy(bytes).trim().to_string();
    if line.is_empty() {
        return Err(Error::InvalidManifest(format!("{what} is empty")));
    }
    Ok(line)
}

pub struct RequestPackageVersionOperation {
    state: OperationState,
    package: String,
    request: FileRequest,
    version: Option<String>,
}

impl RequestPackageVersionOperation {
    pub fn new(package: &str, source: &ManifestSource, retry: u32, timeout: Duration) -> Self {
        Self {
            state: OperationState::default(),
            package: package.to_string(),
            request: source.request(&version_file_name(package), retry, timeout),
            version: None,
        }
    }

    /// Latest version, once succeeded
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

impl Operation for RequestPackageVersionOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn update(&mut self) {
        let Some(result) = self.request.poll() else {
            return;
        };
        match result.and_then(|bytes| parse_line(&bytes, "version file")) {
            Ok(version) => {
                info!("Latest version of {} is {version}", self.package);
                self.version = Some(version);
                self.state.succeed();
            }
            Err(e) => self.state.fail(e),
        }
    }
}

enum Stage {
    Hash(FileRequest),
    Manifest { hash: String, request: FileRequest },
    Done,
}

/// Make a manifest version the active one, reusing the cached copy when it is
/// intact.
pub struct UpdateManifestOperation {
    state: OperationState,
    package: String,
    version: String,
    source: Rc<ManifestSource>,
    cache: Option<CacheLayout>,
    active: Rc<RefCell<Option<Rc<Manifest>>>>,
    retry: u32,
    timeout: Duration,
    stage: Stage,
    from_cache: bool,
}

impl UpdateManifestOperation {
    pub fn new(
        package: &str,
        version: &str,
        source: Rc<ManifestSource>,
        cache: Option<CacheLayout>,
        active: Rc<RefCell<Option<Rc<Manifest>>>>,
        retry: u32,
        timeout: Duration,
    ) -> Self {
        let request = source.request(&hash_file_name(package, version), retry, timeout);
        Self {
            state: OperationState::default(),
            package: package.to_string(),
            version: version.to_string(),
            source,
            cache,
            active,
            retry,
            timeout,
            stage: Stage::Hash(request),
            from_cache: false,
        }
    }

    /// The manifest was taken from the local cache
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    fn file_name(&self) -> String {
        manifest_file_name(&self.package, &self.version)
    }

    fn advance(&mut self) -> Result<()> {
        match &mut self.stage {
            Stage::Hash(request) => {
                let Some(result) = request.poll() else {
                    return Ok(());
                };
                let hash = parse_line(&result?, "hash file")?;
                if self.try_cached(&hash)? {
                    self.stage = Stage::Done;
                    return Ok(());
                }
                let request = self
                    .source
                    .request(&self.file_name(), self.retry, self.timeout);
                self.stage = Stage::Manifest { hash, request };
            }
            Stage::Manifest { hash, request } => {
                let Some(result) = request.poll() else {
                    return Ok(());
                };
                let expected = hash.clone();
                let bytes = result?;
                let actual = content_hash(&bytes);
                if actual != expected {
                    return Err(Error::HashMismatch {
                        file: self.file_name(),
                        expected,
                        actual,
                    });
                }
                if let Some(layout) = &self.cache {
                    let path = layout.manifest_path(&self.file_name());
                    fs::write(&path, &bytes).at_path(&path)?;
                }
                self.stage = Stage::Done;
                self.install(&bytes)?;
            }
            Stage::Done => {}
        }
        Ok(())
    }

    // Activate the cached manifest if its hash matches, drop it otherwise
    fn try_cached(&mut self, hash: &str) -> Result<bool> {
        let Some(layout) = &self.cache else {
            return Ok(false);
        };
        let path = layout.manifest_path(&self.file_name());
        let Ok(data) = fs::read(&path) else {
            return Ok(false);
        };
        if content_hash(&data) == hash {
            debug!("Using cached manifest {path:?}");
            self.from_cache = true;
            self.install(&data)?;
            return Ok(true);
        }
        warn!("Deleting corrupt cached manifest {path:?}");
        fs::remove_file(&path).at_path(&path)?;
        Ok(false)
    }

    fn install(&mut self, bytes: &[u8]) -> Result<()> {
        let manifest = Manifest::from_slice(bytes)?;
        if manifest.package_name != self.package || manifest.package_version != self.version {
            return Err(Error::InvalidManifest(format!(
                "Expected {} {}, found {} {}",
                self.package, self.version, manifest.package_name, manifest.package_version
            )));
        }
        info!(
            "Activated manifest {} {} with {} bundles",
            self.package,
            self.version,
            manifest.bundles.len()
        );
        *self.active.borrow_mut() = Some(Rc::new(manifest));
        self.state.succeed();
        Ok(())
    }
}

impl Operation for UpdateManifestOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn update(&mut self) {
        if let Err(e) = self.advance() {
            self.stage = Stage::Done;
            self.state.fail(e);
        }
    }
}

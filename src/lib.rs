pub mod archive;
pub mod bundle_loader;
pub mod cache;
pub mod commands;
pub mod download;
pub mod error;
pub mod file_system;
pub mod handle;
pub mod hasher;
pub mod manifest;
pub mod operation;
pub mod package;
pub mod provider;
pub mod remote;
pub mod resource_manager;
pub mod scheduler;
pub mod settings;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
pub use handle::Handle;
pub use package::ResourcePackage;
pub use scheduler::Scheduler;
pub use settings::PackageSettings;

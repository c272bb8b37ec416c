use std::{path::PathBuf, sync::Arc};

use anyhow::{ensure, Context, Result};
use bundle_delivery::{
    commands::{
        cat::cat_asset,
        extract::extract_assets,
        list::list_assets,
        sync::{clean, download, request_version, update_manifest, verify_cache},
    },
    remote::HttpFetcher,
    settings::StorageMode,
    PackageSettings, ResourcePackage, Scheduler,
};
use clap::{Parser, Subcommand};
use glob::Pattern;
use url::Url;

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the latest published version
    Version,
    /// Activate a manifest version, the latest one by default
    Update {
        /// Specific version to activate
        version: Option<String>,
    },
    /// Check the cached files against the manifest
    Verify,
    /// Download bundles into the cache
    Download {
        /// Only bundles carrying one of these tags
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
        /// Only the bundles needed by these assets
        #[arg(long, num_args = 1..)]
        paths: Vec<String>,
    },
    /// Remove cached files the manifest doesn't use
    Clean {
        /// Remove every cached file instead
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// List assets
    List {
        /// Glob patterns to filter the list of assets
        #[clap(default_value = "**")]
        #[arg(num_args = 1..)]
        globs: Vec<Pattern>,
    },
    /// Write a single asset to stdout
    Cat {
        /// Path to the asset
        path: String,
    },
    /// Extract matched assets to a folder
    Extract {
        /// Path to the folder to output the extracted assets
        output_folder: PathBuf,
        /// Glob patterns to filter the list of assets
        #[clap(default_value = "**")]
        #[arg(num_args = 1..)]
        globs: Vec<Pattern>,
    },
}

/// Keeps a local cache of a bundle package in sync with its servers and
/// extracts assets from it.
#[derive(Parser, Debug)]
#[command(name = "bundle_tool")]
#[clap(version)]
struct Cli {
    /// Package settings as JSON (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Package name, overrides the config
    #[arg(short, long)]
    package: Option<String>,

    /// Primary server base URL, overrides the config
    #[arg(long)]
    url: Option<Url>,

    /// Fallback server base URL, overrides the config
    #[arg(long)]
    fallback_url: Option<Url>,

    /// Specify the cache directory (optional)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory of files shipped with the application (optional)
    #[arg(long)]
    builtin_dir: Option<PathBuf>,

    /// Manifest version to use, the latest one by default
    #[arg(long)]
    manifest_version: Option<String>,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Validates user input and builds the package settings
fn parse_args() -> Result<(PackageSettings, Cli)> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => PackageSettings::load(path).context("Failed to load settings")?,
        None => PackageSettings::default(),
    };
    if let Some(package) = &cli.package {
        settings.package_name = package.clone();
    }
    if let Some(url) = &cli.url {
        settings.primary_url = Some(url.clone());
    }
    if let Some(url) = &cli.fallback_url {
        settings.fallback_url = Some(url.clone());
    }
    if let Some(cache_dir) = &cli.cache_dir {
        settings.cache_root = cache_dir.clone();
    }
    if let Some(builtin_dir) = &cli.builtin_dir {
        ensure!(builtin_dir.exists(), "Built-in folder doesn't exist");
        settings.builtin_root = Some(builtin_dir.clone());
    }
    if cli.url.is_none() && settings.primary_url.is_none() && settings.builtin_root.is_some() {
        settings.storage_mode = StorageMode::Offline;
    }

    Ok((settings, cli))
}

fn main() -> Result<()> {
    let (settings, cli) = parse_args()?;

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let fetcher = Arc::new(HttpFetcher::new().context("Failed to create HTTP client")?);
    let package = ResourcePackage::new(settings, Scheduler::default(), fetcher)
        .context("Failed to initialise package")?;

    if let Command::Version = cli.command {
        println!("{}", request_version(&package).context("Version command failed")?);
        return Ok(());
    }

    let requested = match &cli.command {
        Command::Update { version } => version.as_deref().or(cli.manifest_version.as_deref()),
        _ => cli.manifest_version.as_deref(),
    };
    let version = update_manifest(&package, requested).context("Failed to load manifest")?;
    let manifest = package
        .active_manifest()
        .context("No manifest after update")?;

    match cli.command {
        Command::Version => {}
        Command::Update { .. } => println!("{}", version),
        Command::Verify => verify_cache(&package).context("Verify command failed")?,
        Command::Download { tags, paths } => {
            download(&package, &tags, &paths).context("Download command failed")?
        }
        Command::Clean { all } => clean(&package, all).context("Clean command failed")?,
        Command::List { globs } => list_assets(&manifest, &globs).context("List command failed")?,
        Command::Cat { path } => cat_asset(&package, &path).context("Cat command failed")?,
        Command::Extract {
            output_folder,
            globs,
        } => extract_assets(&package, &globs, &output_folder).context("Extract command failed")?,
    }

    package.destroy();
    Ok(())
}

//! CLI command definitions and dispatch.

mod build;
mod history;
mod image_inspect;
mod image_prune;
mod image_tag;
mod images;
mod info;
mod layers;
mod load;
mod pull;
mod push;
mod rm_layer;
mod rmi;
mod save;
mod untag;
mod version;

use std::path::PathBuf;
use std::sync::Arc;

use a3s_store::{LayerId, OciRegistryGateway, RegistryAuth, RegistryGateway, Store};
use a3s_store_core::StoreConfig;
use clap::{Parser, Subcommand};

/// A3S Store - content-addressed layer and image store.
#[derive(Parser)]
#[command(name = "a3s-store", version, about)]
pub struct Cli {
    /// Store root directory (overrides the config file and A3S_STORE_ROOT)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Path to a YAML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// List images
    Images(images::ImagesArgs),
    /// List layers with their reference counts
    Layers(layers::LayersArgs),
    /// Build an image from a YAML build plan
    Build(build::BuildArgs),
    /// Create a tag that refers to an existing image
    Tag(image_tag::ImageTagArgs),
    /// Remove a tag, leaving the image in place
    Untag(untag::UntagArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
    /// Display detailed image information as JSON
    Inspect(image_inspect::ImageInspectArgs),
    /// Show the layers of an image, base first
    History(history::HistoryArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// Push a local image to a registry
    Push(push::PushArgs),
    /// Export a layer to a transfer bundle
    SaveLayer(save::SaveLayerArgs),
    /// Import a layer from a transfer bundle
    LoadLayer(load::LoadLayerArgs),
    /// Remove an unreferenced layer
    RmLayer(rm_layer::RmLayerArgs),
    /// Remove dangling images and unreferenced layers
    Prune(image_prune::PruneArgs),
    /// Show store location and usage
    Info(info::InfoArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Effective configuration for this invocation.
pub(crate) fn store_config(cli: &Cli) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = StoreConfig::resolve(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    Ok(config)
}

/// Open the store described by `config`.
pub(crate) fn open_store(config: &StoreConfig) -> Result<Store, Box<dyn std::error::Error>> {
    Ok(Store::open(config)?)
}

/// Resolve a full layer id or a unique prefix of one.
pub(crate) fn resolve_layer(store: &Store, id: &str) -> Result<LayerId, Box<dyn std::error::Error>> {
    let wanted = id.strip_prefix("sha256:").unwrap_or(id);
    let matches: Vec<LayerId> = store
        .layers
        .list()
        .into_iter()
        .map(|l| l.id)
        .filter(|l| l.as_str().starts_with(wanted))
        .collect();
    match matches.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(format!("Layer not found: {id}").into()),
        _ => Err(format!("Layer id prefix {id} matches {} layers", matches.len()).into()),
    }
}

/// Registry gateway with credentials from the environment.
pub(crate) fn registry_gateway(insecure: bool) -> Arc<dyn RegistryGateway> {
    let auth = RegistryAuth::from_env();
    if insecure {
        Arc::new(OciRegistryGateway::insecure(auth))
    } else {
        Arc::new(OciRegistryGateway::with_auth(auth))
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = store_config(&cli)?;
    tracing::debug!(root = %config.root.display(), "Using store");

    match cli.command {
        Command::Images(args) => images::execute(args, &config).await,
        Command::Layers(args) => layers::execute(args, &config).await,
        Command::Build(args) => build::execute(args, &config).await,
        Command::Tag(args) => image_tag::execute(args, &config).await,
        Command::Untag(args) => untag::execute(args, &config).await,
        Command::Rmi(args) => rmi::execute(args, &config).await,
        Command::Inspect(args) => image_inspect::execute(args, &config).await,
        Command::History(args) => history::execute(args, &config).await,
        Command::Pull(args) => pull::execute(args, &config).await,
        Command::Push(args) => push::execute(args, &config).await,
        Command::SaveLayer(args) => save::execute(args, &config).await,
        Command::LoadLayer(args) => load::execute(args, &config).await,
        Command::RmLayer(args) => rm_layer::execute(args, &config).await,
        Command::Prune(args) => image_prune::execute(args, &config).await,
        Command::Info(args) => info::execute(args, &config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

//! `a3s-store save-layer` command - Export a layer to a transfer bundle.
//!
//! The bundle carries the layer metadata and its packed archive, suitable
//! for moving to another store and loading with `a3s-store load-layer`.

use std::path::PathBuf;

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct SaveLayerArgs {
    /// Layer id or unique id prefix
    pub layer: String,

    /// Output file path
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(args: SaveLayerArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let id = super::resolve_layer(&store, &args.layer)?;

    store.layers.export_layer(&id, &args.output).await?;

    let size = std::fs::metadata(&args.output).map(|m| m.len()).unwrap_or(0);
    println!(
        "Saved layer {} to {} ({})",
        id.short(),
        args.output.display(),
        crate::output::format_bytes(size)
    );
    Ok(())
}

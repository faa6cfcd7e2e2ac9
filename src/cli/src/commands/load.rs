//! `a3s-store load-layer` command - Import a layer from a transfer bundle.
//!
//! Bundles are verified before anything is registered: the archive digest
//! and the unpacked tree digest must both match the bundle metadata, and
//! the parent layer must already be present.

use std::path::PathBuf;

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct LoadLayerArgs {
    /// Bundle files to import, parents first
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

pub async fn execute(args: LoadLayerArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    for input in &args.inputs {
        let id = store
            .layers
            .import_layer(input)
            .await
            .map_err(|e| format!("Failed to load {}: {e}", input.display()))?;
        println!("Loaded layer: {}", id);
    }
    Ok(())
}

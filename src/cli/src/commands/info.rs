//! `a3s-store info` command.

use a3s_store_core::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct InfoArgs;

pub async fn execute(_args: InfoArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-store version {}", a3s_store::VERSION);
    println!("Store root: {}", config.root.display());
    println!(
        "Pull timeout: {}s, concurrent downloads: {}",
        config.pull_timeout_secs, config.max_concurrent_downloads
    );

    let store = super::open_store(config)?;

    let images = store.catalog.list(true);
    let dangling = images.iter().filter(|i| i.is_dangling()).count();
    println!("Images: {} total, {} dangling", images.len(), dangling);

    let layers = store.layers.list();
    let unreferenced = layers.iter().filter(|l| l.is_unreferenced()).count();
    let unpacked: u64 = layers.iter().map(|l| l.size_bytes).sum();
    let packed: u64 = layers.iter().map(|l| l.packed_size).sum();
    println!(
        "Layers: {} total, {} unreferenced ({} unpacked, {} packed)",
        layers.len(),
        unreferenced,
        output::format_bytes(unpacked),
        output::format_bytes(packed)
    );

    Ok(())
}

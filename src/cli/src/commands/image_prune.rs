//! `a3s-store prune` command - remove dangling images and unreferenced layers.

use a3s_store_core::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct PruneArgs {
    /// Also remove untagged images that are still reachable by digest
    #[arg(short, long)]
    pub all: bool,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: PruneArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    let candidates: Vec<_> = store
        .catalog
        .list(true)
        .into_iter()
        .filter(|img| img.repo_tags.is_empty() && (args.all || img.repo_digests.is_empty()))
        .collect();
    let loose_layers = store
        .layers
        .list()
        .into_iter()
        .filter(|l| l.is_unreferenced())
        .count();

    if candidates.is_empty() && loose_layers == 0 {
        println!("Nothing to prune.");
        return Ok(());
    }

    // Show what will be removed
    if !args.force {
        println!(
            "WARNING: This will remove {} image(s) and every layer left unreferenced:",
            candidates.len()
        );
        for img in &candidates {
            println!("  {} ({})", img.id.short(), output::format_bytes(img.size_bytes));
        }
        if loose_layers > 0 {
            println!("  {loose_layers} layer(s) already unreferenced");
        }
        println!();
        println!("Use --force to skip this prompt.");
        return Ok(());
    }

    let before: u64 = store.layers.list().iter().map(|l| l.size_bytes).sum();
    let report = store.catalog.prune(args.all)?;
    let after: u64 = store.layers.list().iter().map(|l| l.size_bytes).sum();

    println!(
        "Removed {} image(s) and {} layer(s), freed {}",
        report.images.len(),
        report.layers.len(),
        output::format_bytes(before.saturating_sub(after))
    );
    Ok(())
}

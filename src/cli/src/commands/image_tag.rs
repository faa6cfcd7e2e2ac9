//! `a3s-store tag` command - create a tag that refers to an existing image.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct ImageTagArgs {
    /// Source image (reference, id or id prefix)
    pub source: String,

    /// Target image reference (new tag)
    pub target: String,
}

pub async fn execute(args: ImageTagArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let id = store.catalog.resolve(&args.source)?;

    // Last write wins: the target moves off whatever image it named before.
    store.catalog.tag(&id, &args.target)?;

    println!("{}", args.target);
    Ok(())
}

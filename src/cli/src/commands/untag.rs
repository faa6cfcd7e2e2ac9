//! `a3s-store untag` command - remove a tag without removing the image.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct UntagArgs {
    /// References to remove
    #[arg(required = true)]
    pub references: Vec<String>,
}

pub async fn execute(args: UntagArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    for reference in &args.references {
        let id = store.catalog.untag(reference)?;
        println!("Untagged: {reference} ({})", id.short());
    }
    Ok(())
}

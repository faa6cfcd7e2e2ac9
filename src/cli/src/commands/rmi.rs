//! `a3s-store rmi` command - remove one or more images.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct RmiArgs {
    /// Images to remove (reference, id or id prefix)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Remove images still named by a tag or digest reference
    #[arg(short, long)]
    pub force: bool,

    /// Also delete layers left unreferenced
    #[arg(long)]
    pub prune: bool,
}

pub async fn execute(args: RmiArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    let mut errors: Vec<String> = Vec::new();

    for reference in &args.images {
        let removed = store
            .catalog
            .resolve(reference)
            .and_then(|id| store.catalog.remove_image(&id, args.force).map(|_| id));
        match removed {
            Ok(id) => println!("Deleted: {}", id.short()),
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    if args.prune {
        let layers = store.layers.collect_garbage()?;
        if !layers.is_empty() {
            println!("Deleted {} unreferenced layer(s)", layers.len());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}

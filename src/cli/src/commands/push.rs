//! `a3s-store push` command - Push a local image to a registry.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct PushArgs {
    /// Local image (reference, id or id prefix)
    pub image: String,

    /// Target reference; defaults to the local reference
    pub target: Option<String>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Talk to the registry over plain HTTP
    #[arg(long)]
    pub insecure: bool,
}

pub async fn execute(args: PushArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let target = args.target.as_deref().unwrap_or(&args.image);

    if !args.quiet {
        println!("Pushing {} to {}...", args.image, target);
    }

    let pusher = store.pusher(super::registry_gateway(args.insecure));
    let digest = pusher.push(&args.image, target).await.map_err(|e| {
        format!(
            "Failed to push '{}': {e}. Set REGISTRY_USERNAME and REGISTRY_PASSWORD for private registries.",
            args.image
        )
    })?;

    if args.quiet {
        println!("{digest}");
    } else {
        println!("Pushed: {target}");
        println!("Digest: {digest}");
    }
    Ok(())
}

//! `a3s-store pull` command.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "alpine:latest", "ghcr.io/org/image:tag")
    pub image: String,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Talk to the registry over plain HTTP
    #[arg(long)]
    pub insecure: bool,
}

pub async fn execute(args: PullArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let puller = store.puller(super::registry_gateway(args.insecure), config);

    if !args.quiet {
        println!("Pulling {}...", args.image);
    }
    let id = puller.pull(&args.image).await?;

    if args.quiet {
        println!("{id}");
    } else {
        let record = store.catalog.inspect(&id)?;
        println!(
            "Pulled: {} ({}, {} layer(s))",
            args.image,
            id.short(),
            record.layer_chain.len()
        );
        for digest in &record.repo_digests {
            println!("Digest: {digest}");
        }
    }

    Ok(())
}

//! `a3s-store version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-store version {}", a3s_store::VERSION);
    println!("a3s-store-core version {}", a3s_store_core::VERSION);
    Ok(())
}

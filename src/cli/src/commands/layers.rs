//! `a3s-store layers` command.

use a3s_store::LayerRecord;
use a3s_store_core::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct LayersArgs {
    /// Only show layer ids (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Only show layers nothing references
    #[arg(long)]
    pub unreferenced: bool,
}

pub async fn execute(args: LayersArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let mut layers: Vec<LayerRecord> = store
        .layers
        .list()
        .into_iter()
        .filter(|l| !args.unreferenced || l.is_unreferenced())
        .collect();
    layers.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if args.quiet {
        for layer in &layers {
            println!("{}", layer.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["LAYER ID", "PARENT", "REFS", "CHILDREN", "CREATED", "SIZE"]);
    for layer in &layers {
        let parent = layer
            .parent
            .as_ref()
            .map(|p| p.short().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        table.add_row([
            layer.id.short().to_string(),
            parent,
            layer.references.to_string(),
            layer.children.to_string(),
            output::format_ago(&layer.created_at),
            output::format_bytes(layer.size_bytes),
        ]);
    }

    println!("{table}");
    Ok(())
}

//! `a3s-store rm-layer` command - remove layers nothing depends on.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct RmLayerArgs {
    /// Layer ids or unique id prefixes
    #[arg(required = true)]
    pub layers: Vec<String>,
}

pub async fn execute(args: RmLayerArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    let mut errors: Vec<String> = Vec::new();

    for layer in &args.layers {
        let removed = super::resolve_layer(&store, layer)
            .and_then(|id| store.layers.remove_layer(&id).map(|_| id).map_err(Into::into));
        match removed {
            Ok(id) => println!("Deleted: {}", id.short()),
            Err(e) => errors.push(format!("{layer}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove layer(s):\n{msg}").into())
    }
}

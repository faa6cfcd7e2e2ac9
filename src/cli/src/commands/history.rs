//! `a3s-store history` command - Show image layer history.

use a3s_store_core::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    pub image: String,
    /// Only show layer ids
    #[arg(short, long)]
    pub quiet: bool,
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(args: HistoryArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let id = store.catalog.resolve(&args.image)?;
    let history = store.catalog.history(&id)?;

    if args.quiet {
        for layer in &history {
            println!("{}", layer.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["LAYER", "CREATED", "SIZE", "DIFF ID", "LABELS"]);
    for layer in &history {
        let (id, diff_id) = if args.no_trunc {
            (layer.id.to_string(), layer.diff_id.to_string())
        } else {
            (layer.id.short().to_string(), layer.diff_id.short().to_string())
        };
        let labels = output::format_labels(&layer.labels);
        let labels = if args.no_trunc {
            labels
        } else {
            truncate_str(&labels, 40)
        };

        table.add_row([
            id,
            output::format_ago(&layer.created_at),
            output::format_bytes(layer.size_bytes),
            diff_id,
            labels,
        ]);
    }

    println!("{table}");
    Ok(())
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

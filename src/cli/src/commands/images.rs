//! `a3s-store images` command.

use a3s_store::{ImageRecord, ImageReference};
use a3s_store_core::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image ids (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Include untagged images
    #[arg(short, long)]
    pub all: bool,

    /// Show full image ids
    #[arg(long)]
    pub no_trunc: bool,

    /// Format output using placeholders: {{.Repository}}, {{.Tag}}, {{.ID}},
    /// {{.Size}}, {{.Created}}, {{.Layers}}
    #[arg(long)]
    pub format: Option<String>,
}

pub async fn execute(args: ImagesArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let images = store.catalog.list(args.all);

    // --quiet: print only ids
    if args.quiet {
        for image in &images {
            println!("{}", image.id.short());
        }
        return Ok(());
    }

    let rows: Vec<ImageRow> = images
        .iter()
        .flat_map(|image| ImageRow::from_record(image, args.no_trunc))
        .collect();

    // --format: custom template output
    if let Some(ref fmt) = args.format {
        for row in &rows {
            println!("{}", row.apply_format(fmt));
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "LAYERS", "CREATED", "SIZE"]);
    for row in &rows {
        table.add_row([
            &row.repository,
            &row.tag,
            &row.id,
            &row.layers,
            &row.created,
            &row.size,
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Pre-computed display fields for a single image row.
struct ImageRow {
    repository: String,
    tag: String,
    id: String,
    layers: String,
    created: String,
    size: String,
}

impl ImageRow {
    /// One row per tag; untagged images get a single `<none>` row.
    fn from_record(image: &ImageRecord, no_trunc: bool) -> Vec<Self> {
        let id = if no_trunc {
            image.id.to_string()
        } else {
            image.id.short().to_string()
        };
        let row = |repository: String, tag: String| Self {
            repository,
            tag,
            id: id.clone(),
            layers: image.layer_chain.len().to_string(),
            created: output::format_ago(&image.created_at),
            size: output::format_bytes(image.size_bytes),
        };

        if image.repo_tags.is_empty() {
            return vec![row("<none>".to_string(), "<none>".to_string())];
        }

        image
            .repo_tags
            .iter()
            .map(|tag| match ImageReference::parse(tag) {
                Ok(r) => row(r.name(), r.tag.unwrap_or_else(|| "<none>".to_string())),
                Err(_) => row(tag.clone(), "<none>".to_string()),
            })
            .collect()
    }

    /// Apply a format template, replacing `{{.Field}}` placeholders.
    fn apply_format(&self, fmt: &str) -> String {
        fmt.replace("{{.Repository}}", &self.repository)
            .replace("{{.Tag}}", &self.tag)
            .replace("{{.ID}}", &self.id)
            .replace("{{.Layers}}", &self.layers)
            .replace("{{.Created}}", &self.created)
            .replace("{{.Size}}", &self.size)
    }
}

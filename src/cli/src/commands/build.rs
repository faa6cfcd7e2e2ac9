//! `a3s-store build` command - Build an image from a YAML build plan.
//!
//! The plan lists a base image, the directory snapshots that become layers
//! and the config to overlay:
//!
//! ```yaml
//! base: alpine:3.19
//! steps:
//!   - source: ./rootfs
//! config:
//!   cmd: ["/bin/app"]
//! tag: app:latest
//! ```

use std::path::{Path, PathBuf};

use a3s_store::BuildPlan;
use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct BuildArgs {
    /// Path to the build plan
    #[arg(short = 'f', long = "file", default_value = "build.yaml")]
    pub file: PathBuf,

    /// Name and optionally tag for the image; overrides the plan's tag
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Only print the image id
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut plan = load_plan(&args.file)?;
    if args.tag.is_some() {
        plan.tag = args.tag.clone();
    }

    let store = super::open_store(config)?;
    if !args.quiet {
        println!(
            "Building {} step(s){}...",
            plan.steps.len(),
            plan.base
                .as_deref()
                .map(|b| format!(" on {b}"))
                .unwrap_or_default()
        );
    }

    let id = store.builder().build(&plan).await?;

    if args.quiet {
        println!("{id}");
    } else {
        match &plan.tag {
            Some(tag) => println!("Built {} ({})", tag, id.short()),
            None => println!("Built {}", id.short()),
        }
    }
    Ok(())
}

/// Read a plan, resolving step sources relative to the plan's directory.
fn load_plan(path: &Path) -> Result<BuildPlan, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read build plan {}: {e}", path.display()))?;
    let mut plan: BuildPlan = serde_yaml::from_str(&data)
        .map_err(|e| format!("Invalid build plan {}: {e}", path.display()))?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    for step in &mut plan.steps {
        if step.source.is_relative() {
            step.source = base_dir.join(&step.source);
        }
    }
    Ok(plan)
}

//! `a3s-store inspect` command - display detailed image metadata as JSON.

use a3s_store_core::StoreConfig;
use clap::Args;

#[derive(Args)]
pub struct ImageInspectArgs {
    /// Image to inspect (reference, id or id prefix)
    pub image: String,
}

pub async fn execute(args: ImageInspectArgs, config: &StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let id = store.catalog.resolve(&args.image)?;
    let record = store.catalog.inspect(&id)?;

    let output = serde_json::json!({
        "Id": format!("sha256:{}", record.id),
        "RepoTags": record.repo_tags,
        "RepoDigests": record.repo_digests,
        "Created": record.created_at.to_rfc3339(),
        "Size": record.size_bytes,
        "Architecture": record.config.architecture,
        "Os": record.config.os,
        "Config": {
            "Entrypoint": record.config.entrypoint,
            "Cmd": record.config.cmd,
            "Env": record.config.env,
            "WorkingDir": record.config.working_dir,
            "User": record.config.user,
            "ExposedPorts": record.config.exposed_ports,
            "Volumes": record.config.volumes,
            "Labels": record.config.labels,
        },
        "Layers": record.layer_chain,
        "Manifest": record.manifest,
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

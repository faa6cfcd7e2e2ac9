//! Local image builds from an already-parsed build plan.
//!
//! Parsing build files is someone else's job; the builder only turns an
//! ordered list of filesystem snapshots into layers on top of an optional
//! base image and assembles the result.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use a3s_store_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::image::{ImageCatalog, ImageConfig, ImageId};
use crate::layer::LayerLease;

/// One layer-producing step: the directory snapshot to capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub source: PathBuf,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// An ordered build recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildPlan {
    /// Reference of the image to build on; `None` builds from scratch
    pub base: Option<String>,
    pub steps: Vec<BuildStep>,
    /// Overlaid on the base image's config
    pub config: ImageConfig,
    pub tag: Option<String>,
}

/// Drives layer creation and image assembly for a [`BuildPlan`].
pub struct ImageBuilder {
    catalog: Arc<ImageCatalog>,
}

impl ImageBuilder {
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn build(&self, plan: &BuildPlan) -> Result<ImageId> {
        let layers = self.catalog.layers();
        let mut lease = LayerLease::new(layers);

        let (mut chain, base_config) = match &plan.base {
            Some(base) => {
                let base_id = self.catalog.resolve(base)?;
                tracing::debug!(base = %base, id = %base_id.short(), "Resolved base image");
                self.catalog.image_layers(&base_id)?
            }
            None => (Vec::new(), ImageConfig::default()),
        };
        for id in &chain {
            lease.hold(id)?;
        }

        for (index, step) in plan.steps.iter().enumerate() {
            let id = lease
                .create(&step.source, chain.last(), step.labels.clone())
                .await?;
            tracing::debug!(
                step = index + 1,
                source = %step.source.display(),
                id = %id.short(),
                "Built layer"
            );
            chain.push(id);
        }

        let config = base_config.merged_with(&plan.config);
        let id = self.catalog.assemble_image(&chain, &config)?;
        drop(lease);

        if let Some(tag) = &plan.tag {
            self.catalog.tag(&id, tag)?;
        }

        tracing::info!(
            id = %id.short(),
            layers = chain.len(),
            tag = plan.tag.as_deref().unwrap_or("<none>"),
            "Built image"
        );
        Ok(id)
    }
}

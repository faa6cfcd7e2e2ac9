//! Image catalog: image records, the tag table and layer reference counts.
//!
//! The catalog owns `images.json`, which holds both the image records and
//! the reference → id tag table so the two are always persisted together.
//! Every mutation runs inside the catalog's critical section; layer
//! reference counts are adjusted through the [`LayerStore`] while that
//! section is held (catalog lock first, then layer lock).

use std::path::PathBuf;
use std::sync::Arc;

use a3s_store_core::error::{Result, StoreError};
use a3s_store_core::StoreConfig;
use chrono::Utc;
use parking_lot::Mutex;

use super::manifest::{Descriptor, Manifest, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE};
use super::record::{CatalogIndex, ImageConfig, ImageId, ImageRecord};
use super::reference::ImageReference;
use crate::layer::{LayerId, LayerRecord, LayerStore};
use crate::persist::{load_json, save_json};

const INDEX_FILE: &str = "images.json";

/// Outcome of [`ImageCatalog::prune`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub images: Vec<ImageId>,
    pub layers: Vec<LayerId>,
}

/// Persistent catalog of assembled images.
pub struct ImageCatalog {
    index_path: PathBuf,
    state: Mutex<CatalogIndex>,
    layers: Arc<LayerStore>,
}

impl ImageCatalog {
    /// Open (or create) the catalog under `config.root`.
    pub fn open(config: &StoreConfig, layers: Arc<LayerStore>) -> Result<Self> {
        let index_path = config.root.join(INDEX_FILE);
        let state: CatalogIndex = load_json(&index_path)?;

        if config.verify_on_load {
            for record in state.images.values() {
                if let Some(missing) = record.layer_chain.iter().find(|l| !layers.contains(l)) {
                    tracing::warn!(
                        image = %record.id.short(),
                        layer = %missing,
                        "Image references a layer missing from the layer store"
                    );
                }
            }
        }

        tracing::debug!(
            images = state.images.len(),
            tags = state.tags.len(),
            "Opened image catalog"
        );

        Ok(Self {
            index_path,
            state: Mutex::new(state),
            layers,
        })
    }

    /// The layer store backing this catalog.
    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    /// Assemble an image from a base-first layer chain and a config.
    ///
    /// The chain must be a path through the layer forest: the first layer
    /// has no parent and every other layer's parent is its predecessor,
    /// otherwise `BrokenChain`. Idempotent: an identical (chain, config)
    /// pair yields the same id and takes no additional layer references.
    pub fn assemble_image(&self, chain: &[LayerId], config: &ImageConfig) -> Result<ImageId> {
        let mut state = self.state.lock();

        let records = chain
            .iter()
            .map(|id| self.layers.get(id))
            .collect::<Result<Vec<LayerRecord>>>()?;
        check_linkage(&records)?;
        let diff_ids: Vec<_> = records.iter().map(|r| r.diff_id.clone()).collect();
        let config_blob = config.to_oci_json(&diff_ids)?;
        let manifest = Manifest::new(
            Descriptor::for_blob(CONFIG_MEDIA_TYPE, &config_blob),
            records
                .iter()
                .map(|r| Descriptor::new(LAYER_MEDIA_TYPE, r.digest.clone(), r.packed_size))
                .collect(),
        );
        let id = ImageId::from_digest(&manifest.digest()?);

        if state.images.contains_key(&id) {
            tracing::debug!(id = %id.short(), "Image already assembled");
            return Ok(id);
        }

        let adopted = self.layers.retain_tracked(chain)?;

        let size_bytes =
            records.iter().map(|r| r.size_bytes).sum::<u64>() + config_blob.len() as u64;
        let record = ImageRecord {
            id: id.clone(),
            manifest,
            layer_chain: chain.to_vec(),
            config: config.clone(),
            repo_tags: Default::default(),
            repo_digests: Default::default(),
            size_bytes,
            created_at: Utc::now(),
        };

        let mut next = state.clone();
        next.images.insert(id.clone(), record);
        if let Err(e) = save_json(&self.index_path, &next) {
            if let Err(revert) = self.layers.revert_retain(chain, &adopted) {
                tracing::error!(id = %id.short(), error = %revert, "Failed to revert layer references");
            }
            return Err(e);
        }
        *state = next;

        tracing::info!(
            id = %id.short(),
            layers = chain.len(),
            size_bytes,
            "Assembled image"
        );
        Ok(id)
    }

    /// Point `reference` at `id`. Last write wins: the reference is taken
    /// away from any image it previously named.
    pub fn tag(&self, id: &ImageId, reference: &str) -> Result<()> {
        let parsed = ImageReference::parse(reference)?;
        let normalized = parsed.to_string();

        self.transact(|state| {
            if !state.images.contains_key(id) {
                return Err(StoreError::NotFound(format!("image {}", id)));
            }
            state.set_tag(normalized.clone(), id, parsed.is_digest());
            Ok(())
        })?;

        tracing::info!(id = %id.short(), reference = %normalized, "Tagged image");
        Ok(())
    }

    /// Record a `repo@digest` reference for `id`.
    pub fn add_repo_digest(&self, id: &ImageId, reference: &str) -> Result<()> {
        let parsed = ImageReference::parse(reference)?;
        if !parsed.is_digest() {
            return Err(StoreError::InvalidReference(format!(
                "{} is not a digest reference",
                reference
            )));
        }
        self.tag(id, reference)
    }

    /// Remove `reference` from the tag table. The image it named is kept,
    /// dangling if this was its last tag.
    pub fn untag(&self, reference: &str) -> Result<ImageId> {
        let normalized = ImageReference::parse(reference)?.to_string();

        let id = self.transact(|state| {
            state
                .remove_tag(&normalized)
                .ok_or_else(|| StoreError::NotFound(format!("reference {}", normalized)))
        })?;

        tracing::info!(id = %id.short(), reference = %normalized, "Untagged image");
        Ok(id)
    }

    /// Remove an image and release its layers.
    ///
    /// Fails with `ImageInUse` while any `repo:tag` or `repo@digest`
    /// reference still names it, unless `force` is set. Layers whose count
    /// reaches zero stay on disk until the next [`ImageCatalog::prune`] or
    /// [`LayerStore::collect_garbage`].
    pub fn remove_image(&self, id: &ImageId, force: bool) -> Result<()> {
        self.remove_where(id, |record| force || record.is_dangling())
    }

    /// Remove `id` if `removable` accepts its current record, releasing its
    /// layer references in the same critical section.
    fn remove_where(&self, id: &ImageId, removable: impl FnOnce(&ImageRecord) -> bool) -> Result<()> {
        let mut state = self.state.lock();

        let record = state
            .images
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("image {}", id)))?;
        if !removable(record) {
            return Err(StoreError::ImageInUse {
                image: id.to_string(),
                tags: record.references(),
            });
        }

        let mut next = state.clone();
        let removed = next
            .images
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("image {}", id)))?;
        next.tags.retain(|_, target| *target != *id);

        let (zeroed, undo) = self.layers.release_tracked(&removed.layer_chain)?;
        if let Err(e) = save_json(&self.index_path, &next) {
            if let Err(revert) = self.layers.revert_release(&removed.layer_chain, &undo) {
                tracing::error!(id = %id.short(), error = %revert, "Failed to restore layer references");
            }
            return Err(e);
        }
        *state = next;

        tracing::info!(
            id = %id.short(),
            references = removed.references().len(),
            unreferenced_layers = zeroed.len(),
            "Removed image"
        );
        Ok(())
    }

    /// Resolve a full id, a unique id prefix, `repo:tag` or `repo@digest`.
    pub fn resolve(&self, reference: &str) -> Result<ImageId> {
        let reference = reference.trim();
        let state = self.state.lock();

        if let Ok(parsed) = ImageReference::parse(reference) {
            if let Some(id) = state.tags.get(&parsed.to_string()) {
                return Ok(id.clone());
            }
            if let Some(digest) = &parsed.digest {
                let id = ImageId::from_digest(digest);
                if state.images.contains_key(&id) {
                    return Ok(id);
                }
            }
        }

        let candidate = reference.strip_prefix("sha256:").unwrap_or(reference);
        if !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
            let candidate = candidate.to_ascii_lowercase();
            let matches: Vec<&ImageId> = state
                .images
                .keys()
                .filter(|id| id.as_str().starts_with(&candidate))
                .collect();
            match matches.as_slice() {
                [] => {}
                [only] => return Ok((*only).clone()),
                many => {
                    return Err(StoreError::AmbiguousReference {
                        reference: reference.to_string(),
                        matches: many.iter().map(|id| id.to_string()).collect(),
                    })
                }
            }
        }

        Err(StoreError::NotFound(format!("image {}", reference)))
    }

    /// Images, newest first. Dangling images are included on request.
    pub fn list(&self, include_dangling: bool) -> Vec<ImageRecord> {
        let state = self.state.lock();
        let mut images: Vec<ImageRecord> = state
            .images
            .values()
            .filter(|r| include_dangling || !r.is_dangling())
            .cloned()
            .collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images
    }

    pub fn inspect(&self, id: &ImageId) -> Result<ImageRecord> {
        self.state
            .lock()
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("image {}", id)))
    }

    /// Layer records of the image's chain, base first, resolved through the
    /// parent links of its top layer.
    pub fn history(&self, id: &ImageId) -> Result<Vec<LayerRecord>> {
        let record = self.inspect(id)?;
        let Some(top) = record.layer_chain.last() else {
            return Ok(Vec::new());
        };
        let chain = self.layers.get_layer_chain(top).map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::BrokenChain {
                layer: id.to_string(),
                missing: top.to_string(),
            },
            other => other,
        })?;
        if chain != record.layer_chain {
            tracing::warn!(id = %id.short(), "Stored layer chain disagrees with parent links");
        }
        chain
            .iter()
            .map(|layer| {
                self.layers.get(layer).map_err(|_| StoreError::BrokenChain {
                    layer: id.to_string(),
                    missing: layer.to_string(),
                })
            })
            .collect()
    }

    pub fn config(&self, id: &ImageId) -> Result<ImageConfig> {
        Ok(self.inspect(id)?.config)
    }

    /// Layer chain and config, as consumed by the runtime.
    pub fn image_layers(&self, id: &ImageId) -> Result<(Vec<LayerId>, ImageConfig)> {
        let record = self.inspect(id)?;
        Ok((record.layer_chain, record.config))
    }

    /// Storage locations of the image's layers, base first, for mounting.
    pub fn layer_paths(&self, id: &ImageId) -> Result<Vec<PathBuf>> {
        self.inspect(id)?
            .layer_chain
            .iter()
            .map(|layer| self.layers.layer_path(layer))
            .collect()
    }

    /// Remove dangling images, then collect unreferenced layers.
    ///
    /// With `all`, images named only by `repo@digest` references are
    /// removed too, along with those references.
    pub fn prune(&self, all: bool) -> Result<PruneReport> {
        let prunable = |r: &ImageRecord| r.repo_tags.is_empty() && (all || r.repo_digests.is_empty());
        let candidates: Vec<ImageId> = {
            let state = self.state.lock();
            state
                .images
                .values()
                .filter(|r| prunable(r))
                .map(|r| r.id.clone())
                .collect()
        };

        let mut report = PruneReport::default();
        for id in candidates {
            match self.remove_where(&id, prunable) {
                Ok(()) => report.images.push(id),
                Err(StoreError::ImageInUse { .. }) | Err(StoreError::NotFound(_)) => {
                    tracing::debug!(id = %id.short(), "Image no longer eligible for pruning");
                }
                Err(e) => return Err(e),
            }
        }

        report.layers = self.layers.collect_garbage()?;
        tracing::info!(
            images = report.images.len(),
            layers = report.layers.len(),
            "Pruned store"
        );
        Ok(report)
    }

    fn transact<R>(&self, f: impl FnOnce(&mut CatalogIndex) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = f(&mut next)?;
        save_json(&self.index_path, &next)?;
        *state = next;
        Ok(out)
    }
}

/// Require `records` to follow parent links from a base layer upward.
fn check_linkage(records: &[LayerRecord]) -> Result<()> {
    let mut below: Option<&LayerId> = None;
    for record in records {
        if record.parent.as_ref() != below {
            return Err(StoreError::BrokenChain {
                layer: record.id.to_string(),
                missing: record
                    .parent
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "<none>".to_string()),
            });
        }
        below = Some(&record.id);
    }
    Ok(())
}

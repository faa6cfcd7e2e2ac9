//! Content-addressed layer store.
//!
//! Layers are keyed by the digest of their packed archive and stored under
//! `<root>/layers/<id>/`, holding the packed `layer.tar.gz` and the unpacked
//! `diff/` tree. The index (`layers.json`) is mutated only inside a single
//! critical section and persisted with atomic replace. Packing, unpacking
//! and hashing run on blocking tasks outside that section, in a staging
//! directory that is renamed into place only at commit, so a failed or
//! cancelled creation leaves neither a layer directory nor an index entry.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use a3s_store_core::error::{Result, StoreError};
use a3s_store_core::StoreConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::inflight::{wait_for_leader, InflightTable, Slot};
use super::record::{Claim, LayerId, LayerIndex, LayerRecord};
use crate::archive::{ArchiveCodec, TarGzCodec};
use crate::digest::{digest_file, digest_tree, Digest, DigestWriter};
use crate::persist::{load_json, save_json};
use crate::task::blocking;

const LAYERS_DIR: &str = "layers";
const TMP_DIR: &str = "tmp";
const INDEX_FILE: &str = "layers.json";
const BLOB_FILE: &str = "layer.tar.gz";
const DIFF_DIR: &str = "diff";
const BUNDLE_META_FILE: &str = "layer.json";

/// Metadata carried alongside the packed archive in an exported bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleMeta {
    digest: Digest,
    diff_id: Digest,
    parent: Option<LayerId>,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// A packed archive sitting in a staging directory, waiting to become a layer.
struct Ingest {
    staging: TempDir,
    digest: Digest,
    packed_size: u64,
    parent: Option<LayerId>,
    labels: BTreeMap<String, String>,
    expected_diff_id: Option<Digest>,
    created_at: Option<DateTime<Utc>>,
    claim: Claim,
}

/// Content-addressed store of filesystem layers.
pub struct LayerStore {
    layers_dir: PathBuf,
    tmp_dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<LayerIndex>,
    codec: Arc<dyn ArchiveCodec>,
    inflight: Arc<InflightTable>,
    wait_timeout: Duration,
}

impl LayerStore {
    /// Open (or create) the layer store under `config.root` with the default
    /// tar.gz codec.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::with_codec(config, Arc::new(TarGzCodec))
    }

    /// Open the layer store with a custom archive codec.
    ///
    /// Purges the staging area, loads `layers.json`, drops entries whose
    /// storage directory is gone (when `verify_on_load` is set) and removes
    /// layer directories the index does not know about.
    pub fn with_codec(config: &StoreConfig, codec: Arc<dyn ArchiveCodec>) -> Result<Self> {
        let layers_dir = config.root.join(LAYERS_DIR);
        let tmp_dir = config.root.join(TMP_DIR);
        let index_path = config.root.join(INDEX_FILE);

        std::fs::create_dir_all(&layers_dir).map_err(|e| {
            StoreError::StorageIo(format!(
                "Failed to create layer directory {}: {}",
                layers_dir.display(),
                e
            ))
        })?;
        purge_staging(&tmp_dir)?;

        let mut index: LayerIndex = load_json(&index_path)?;
        let mut dirty = false;

        if config.verify_on_load {
            let missing: Vec<LayerId> = index
                .layers
                .values()
                .filter(|r| !r.storage_location.is_dir())
                .map(|r| r.id.clone())
                .collect();
            for id in missing {
                tracing::warn!(id = %id, "Dropping layer whose storage directory vanished");
                index.layers.remove(&id);
                dirty = true;
            }
        }
        index.recount_children();

        remove_orphan_dirs(&layers_dir, &index)?;

        if dirty {
            save_json(&index_path, &index)?;
        }

        tracing::debug!(
            root = %config.root.display(),
            layers = index.layers.len(),
            "Opened layer store"
        );

        Ok(Self {
            layers_dir,
            tmp_dir,
            index_path,
            index: Mutex::new(index),
            codec,
            inflight: Arc::new(InflightTable::default()),
            wait_timeout: config.inflight_wait_timeout(),
        })
    }

    /// Create a layer from the contents of `source`.
    ///
    /// Packs the directory and computes its packed digest. If a layer with
    /// that digest exists its id is returned without touching disk;
    /// concurrent calls for the same content share a single unpack.
    ///
    /// The returned layer carries an unclaimed creation reference that the
    /// first image assembled over it adopts.
    pub async fn create_layer(
        &self,
        source: &Path,
        parent: Option<&LayerId>,
        labels: BTreeMap<String, String>,
    ) -> Result<LayerId> {
        self.create_layer_with(source, parent, labels, Claim::Creation)
            .await
    }

    pub(crate) async fn create_layer_with(
        &self,
        source: &Path,
        parent: Option<&LayerId>,
        labels: BTreeMap<String, String>,
        claim: Claim,
    ) -> Result<LayerId> {
        if let Some(parent) = parent {
            self.ensure_parent(parent)?;
        }

        let staging = self.staging_dir()?;
        let blob = staging.path().join(BLOB_FILE);
        let codec = Arc::clone(&self.codec);
        let src = source.to_path_buf();
        let (digest, packed_size) =
            blocking(move || pack_into(codec.as_ref(), &src, &blob)).await?;

        tracing::debug!(
            digest = %digest,
            source = %source.display(),
            packed_size,
            "Packed layer source"
        );

        self.ingest(Ingest {
            staging,
            digest,
            packed_size,
            parent: parent.cloned(),
            labels,
            expected_diff_id: None,
            created_at: None,
            claim,
        })
        .await
    }

    /// Register a packed archive received from a registry.
    ///
    /// The file is moved into the store's staging area and its digest
    /// recomputed; a mismatch with `expected` fails with `IntegrityMismatch`
    /// and nothing is registered.
    pub async fn import_blob(
        &self,
        blob: &Path,
        expected: &Digest,
        parent: Option<&LayerId>,
        labels: BTreeMap<String, String>,
    ) -> Result<LayerId> {
        self.import_blob_with(blob, expected, parent, labels, Claim::Creation)
            .await
    }

    pub(crate) async fn import_blob_with(
        &self,
        blob: &Path,
        expected: &Digest,
        parent: Option<&LayerId>,
        labels: BTreeMap<String, String>,
        claim: Claim,
    ) -> Result<LayerId> {
        if let Some(parent) = parent {
            self.ensure_parent(parent)?;
        }

        let staging = self.staging_dir()?;
        let target = staging.path().join(BLOB_FILE);
        let src = blob.to_path_buf();
        let (digest, packed_size) = blocking(move || {
            move_file(&src, &target)?;
            let digest = digest_file(&target)?;
            let size = std::fs::metadata(&target)?.len();
            Ok((digest, size))
        })
        .await?;

        if digest != *expected {
            return Err(StoreError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }

        self.ingest(Ingest {
            staging,
            digest,
            packed_size,
            parent: parent.cloned(),
            labels,
            expected_diff_id: None,
            created_at: None,
            claim,
        })
        .await
    }

    /// Write a transfer bundle (metadata plus packed archive) to `destination`.
    pub async fn export_layer(&self, id: &LayerId, destination: &Path) -> Result<()> {
        let record = self.get(id)?;
        let meta = BundleMeta {
            digest: record.digest.clone(),
            diff_id: record.diff_id.clone(),
            parent: record.parent.clone(),
            size_bytes: record.size_bytes,
            created_at: record.created_at,
            labels: record.labels.clone(),
        };
        let blob = self.layer_dir(id).join(BLOB_FILE);
        let dest = destination.to_path_buf();

        blocking(move || {
            let result = write_bundle(&meta, &blob, &dest);
            if result.is_err() {
                let _ = std::fs::remove_file(&dest);
            }
            result
        })
        .await?;

        tracing::info!(id = %id, destination = %destination.display(), "Exported layer");
        Ok(())
    }

    /// Import a bundle produced by [`LayerStore::export_layer`].
    ///
    /// Both the packed digest and the unpacked tree digest are recomputed
    /// and compared against the bundle metadata; this is the trust boundary
    /// for layers arriving from elsewhere.
    pub async fn import_layer(&self, source: &Path) -> Result<LayerId> {
        let staging = self.staging_dir()?;
        let target = staging.path().join(BLOB_FILE);
        let bundle = source.to_path_buf();
        let (meta, digest, packed_size) =
            blocking(move || read_bundle(&bundle, &target)).await?;

        if digest != meta.digest {
            tracing::warn!(
                declared = %meta.digest,
                actual = %digest,
                source = %source.display(),
                "Rejected layer bundle with mismatched digest"
            );
            return Err(StoreError::IntegrityMismatch {
                expected: meta.digest.to_string(),
                actual: digest.to_string(),
            });
        }

        if let Some(parent) = &meta.parent {
            self.ensure_parent(parent)?;
        }

        self.ingest(Ingest {
            staging,
            digest,
            packed_size,
            parent: meta.parent,
            labels: meta.labels,
            expected_diff_id: Some(meta.diff_id),
            created_at: Some(meta.created_at),
            claim: Claim::Creation,
        })
        .await
    }

    /// Walk parent links from `id` to the base layer; returns base first.
    pub fn get_layer_chain(&self, id: &LayerId) -> Result<Vec<LayerId>> {
        let index = self.index.lock();
        let mut current = index
            .layers
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("layer {}", id)))?;
        let mut chain = vec![id.clone()];

        while let Some(parent) = &current.parent {
            if chain.len() > index.layers.len() {
                return Err(StoreError::BrokenChain {
                    layer: current.id.to_string(),
                    missing: parent.to_string(),
                });
            }
            current = index.layers.get(parent).ok_or_else(|| StoreError::BrokenChain {
                layer: current.id.to_string(),
                missing: parent.to_string(),
            })?;
            chain.push(parent.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Take one reference on a layer. Returns the new count.
    pub fn retain(&self, id: &LayerId) -> Result<u32> {
        self.retain_all(std::slice::from_ref(id))?;
        self.reference_count(id)
    }

    /// Drop one reference on a layer. Returns the new count.
    ///
    /// Reaching zero makes the layer eligible for collection; it is not
    /// deleted here.
    pub fn release(&self, id: &LayerId) -> Result<u32> {
        if !self.contains(id) {
            return Err(StoreError::NotFound(format!("layer {}", id)));
        }
        self.release_all(std::slice::from_ref(id))?;
        self.reference_count(id)
    }

    /// Take a reference on every layer in `ids`, all or nothing.
    pub fn retain_all(&self, ids: &[LayerId]) -> Result<()> {
        self.retain_tracked(ids).map(|_| ())
    }

    /// Like [`LayerStore::retain_all`], returning for each id whether the
    /// creation reference was adopted, so the caller can revert exactly.
    pub(crate) fn retain_tracked(&self, ids: &[LayerId]) -> Result<Vec<bool>> {
        self.transact(|index| {
            if let Some(missing) = ids.iter().find(|id| !index.layers.contains_key(*id)) {
                return Err(StoreError::NotFound(format!("layer {}", missing)));
            }
            let mut adopted = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = index.layers.get_mut(id) {
                    adopted.push(record.retain());
                }
            }
            Ok(adopted)
        })
    }

    /// Undo a [`LayerStore::retain_tracked`] call.
    pub(crate) fn revert_retain(&self, ids: &[LayerId], adopted: &[bool]) -> Result<()> {
        self.transact(|index| {
            for (id, adopted) in ids.iter().zip(adopted).rev() {
                if let Some(record) = index.layers.get_mut(id) {
                    record.revert_retain(*adopted);
                }
            }
            Ok(())
        })
    }

    /// Take a counted reference that never adopts the creation reference.
    pub(crate) fn pin(&self, id: &LayerId) -> Result<()> {
        self.transact(|index| {
            let record = index
                .layers
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("layer {}", id)))?;
            record.claim(Claim::Pin);
            Ok(())
        })
    }

    /// Drop a reference on every layer in `ids`.
    ///
    /// Returns the layers whose count reached zero.
    pub fn release_all(&self, ids: &[LayerId]) -> Result<Vec<LayerId>> {
        self.release_tracked(ids).map(|(zeroed, _)| zeroed)
    }

    /// Like [`LayerStore::release_all`], also returning for each id the
    /// prior `claimed` flag if a reference was dropped, for
    /// [`LayerStore::revert_release`].
    pub(crate) fn release_tracked(
        &self,
        ids: &[LayerId],
    ) -> Result<(Vec<LayerId>, Vec<Option<bool>>)> {
        self.transact(|index| {
            let mut zeroed = Vec::new();
            let mut undo = Vec::with_capacity(ids.len());
            for id in ids {
                match index.layers.get_mut(id) {
                    Some(record) => {
                        let was_claimed = record.claimed;
                        if !record.release() {
                            tracing::warn!(id = %id, "Released layer with no outstanding references");
                            undo.push(None);
                        } else {
                            if record.references == 0 {
                                zeroed.push(id.clone());
                            }
                            undo.push(Some(was_claimed));
                        }
                    }
                    None => {
                        tracing::warn!(id = %id, "Released unknown layer");
                        undo.push(None);
                    }
                }
            }
            Ok((zeroed, undo))
        })
    }

    /// Undo a [`LayerStore::release_tracked`] call.
    pub(crate) fn revert_release(&self, ids: &[LayerId], undo: &[Option<bool>]) -> Result<()> {
        self.transact(|index| {
            for (id, step) in ids.iter().zip(undo).rev() {
                if let (Some(record), Some(was_claimed)) = (index.layers.get_mut(id), step) {
                    record.revert_release(*was_claimed);
                }
            }
            Ok(())
        })
    }

    /// Delete a layer's content and index entry.
    ///
    /// Fails with `HasDependents` while any reference or child layer remains.
    ///
    /// The layer directory is moved into the staging area while the index
    /// lock is held, so a concurrent creation of the same content never
    /// finds it; the moved tree is deleted after the lock is released.
    pub fn remove_layer(&self, id: &LayerId) -> Result<()> {
        let grave = self.staging_dir()?;
        let tombstone = grave.path().join(id.as_str());
        let dir = self.layer_dir(id);

        {
            let mut index = self.index.lock();
            let mut next = index.clone();
            let record = next
                .layers
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(format!("layer {}", id)))?;
            if !record.is_unreferenced() {
                return Err(StoreError::HasDependents {
                    layer: id.to_string(),
                    references: record.references,
                    children: record.children,
                });
            }
            if let Some(parent) = record.parent.as_ref().and_then(|p| next.layers.get_mut(p)) {
                parent.children = parent.children.saturating_sub(1);
            }

            let moved = dir.exists();
            if moved {
                std::fs::rename(&dir, &tombstone).map_err(|e| {
                    StoreError::StorageIo(format!(
                        "Failed to move layer directory {} out of the store: {}",
                        dir.display(),
                        e
                    ))
                })?;
            }
            if let Err(e) = save_json(&self.index_path, &next) {
                if moved {
                    if let Err(restore) = std::fs::rename(&tombstone, &dir) {
                        tracing::error!(
                            id = %id,
                            error = %restore,
                            "Failed to restore layer directory after index write failure"
                        );
                    }
                }
                return Err(e);
            }
            *index = next;
        }

        if let Err(e) = grave.close() {
            tracing::warn!(id = %id, error = %e, "Failed to delete removed layer content");
        }

        tracing::info!(id = %id, "Removed layer");
        Ok(())
    }

    /// Remove every layer with no references and no children, repeating
    /// until nothing more becomes eligible. Returns the removed ids.
    pub fn collect_garbage(&self) -> Result<Vec<LayerId>> {
        let mut removed = Vec::new();

        loop {
            let candidates: Vec<LayerId> = {
                let index = self.index.lock();
                index
                    .layers
                    .values()
                    .filter(|r| r.is_unreferenced())
                    .map(|r| r.id.clone())
                    .collect()
            };

            let mut progressed = false;
            for id in candidates {
                match self.remove_layer(&id) {
                    Ok(()) => {
                        removed.push(id);
                        progressed = true;
                    }
                    Err(StoreError::HasDependents { .. }) | Err(StoreError::NotFound(_)) => {
                        tracing::debug!(id = %id, "Layer no longer eligible for collection");
                    }
                    Err(e) => return Err(e),
                }
            }

            if !progressed {
                break;
            }
        }

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Collected unreferenced layers");
        }
        Ok(removed)
    }

    /// Look up a layer record.
    pub fn get(&self, id: &LayerId) -> Result<LayerRecord> {
        self.index
            .lock()
            .layers
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("layer {}", id)))
    }

    /// All layer records, ordered by id.
    pub fn list(&self) -> Vec<LayerRecord> {
        self.index.lock().layers.values().cloned().collect()
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.index.lock().layers.contains_key(id)
    }

    /// Id of the layer whose packed digest is `digest`, if stored.
    pub fn find_by_digest(&self, digest: &Digest) -> Option<LayerId> {
        let id = LayerId::from_digest(digest);
        self.contains(&id).then_some(id)
    }

    /// Whether a layer with packed digest `digest` is stored.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.find_by_digest(digest).is_some()
    }

    pub fn reference_count(&self, id: &LayerId) -> Result<u32> {
        Ok(self.get(id)?.references)
    }

    /// Storage location of the unpacked content, for mounting.
    pub fn layer_path(&self, id: &LayerId) -> Result<PathBuf> {
        Ok(self.get(id)?.storage_location)
    }

    /// Path of the packed archive.
    pub fn blob_path(&self, id: &LayerId) -> Result<PathBuf> {
        self.get(id)?;
        Ok(self.layer_dir(id).join(BLOB_FILE))
    }

    /// Create a fresh staging directory inside the store.
    ///
    /// Staging lives on the same filesystem as the layers so commits are a
    /// rename; the directory is removed when the handle drops.
    pub fn staging_dir(&self) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&self.tmp_dir)
            .map_err(|e| {
                StoreError::StorageIo(format!(
                    "Failed to create staging directory in {}: {}",
                    self.tmp_dir.display(),
                    e
                ))
            })
    }

    fn layer_dir(&self, id: &LayerId) -> PathBuf {
        self.layers_dir.join(id.as_str())
    }

    fn ensure_parent(&self, parent: &LayerId) -> Result<()> {
        if self.contains(parent) {
            Ok(())
        } else {
            Err(StoreError::ParentNotFound(parent.to_string()))
        }
    }

    /// Apply `f` to a copy of the index, persist it, then publish it.
    ///
    /// Nothing changes in memory or on disk if `f` or the write fails.
    fn transact<R>(&self, f: impl FnOnce(&mut LayerIndex) -> Result<R>) -> Result<R> {
        let mut index = self.index.lock();
        let mut next = index.clone();
        let out = f(&mut next)?;
        save_json(&self.index_path, &next)?;
        *index = next;
        Ok(out)
    }

    /// Hand an already stored layer to a caller under `claim`, or `None`
    /// if it is not stored.
    fn claim_existing(
        &self,
        id: &LayerId,
        parent: Option<&LayerId>,
        claim: Claim,
    ) -> Result<Option<LayerId>> {
        let mut index = self.index.lock();
        let Some(record) = index.layers.get(id) else {
            return Ok(None);
        };
        if parent.is_some() && record.parent.as_ref() != parent {
            tracing::warn!(
                id = %id,
                stored_parent = ?record.parent,
                requested_parent = ?parent,
                "Deduplicated layer was declared with a different parent"
            );
        }
        tracing::debug!(id = %id, "Layer content already stored");
        self.claim_locked(&mut index, id, claim)?;
        Ok(Some(id.clone()))
    }

    /// Apply `claim` to a stored record; the caller holds the index lock.
    fn claim_locked(&self, index: &mut LayerIndex, id: &LayerId, claim: Claim) -> Result<()> {
        let mut next = index.clone();
        let changed = next
            .layers
            .get_mut(id)
            .map(|record| record.claim(claim))
            .unwrap_or(false);
        if changed {
            save_json(&self.index_path, &next)?;
            *index = next;
        }
        Ok(())
    }

    async fn ingest(&self, request: Ingest) -> Result<LayerId> {
        let id = LayerId::from_digest(&request.digest);
        let claim = request.claim;

        loop {
            if let Some(existing) = self.claim_existing(&id, request.parent.as_ref(), claim)? {
                return Ok(existing);
            }

            match self.inflight.join(&request.digest) {
                Slot::Follower(rx) => {
                    tracing::debug!(digest = %request.digest, "Waiting on in-flight layer creation");
                    match wait_for_leader(rx, self.wait_timeout, &request.digest).await? {
                        // Claimed at the top of the loop; gone again if collected meanwhile.
                        Some(Ok(_)) | None => continue,
                        Some(Err(e)) => return Err(e),
                    }
                }
                Slot::Leader(guard) => {
                    // The previous leader commits before releasing its slot.
                    match self.claim_existing(&id, request.parent.as_ref(), claim) {
                        Ok(Some(existing)) => {
                            guard.complete(Ok(existing.clone()));
                            return Ok(existing);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            guard.complete(Err(e.clone()));
                            return Err(e);
                        }
                    }
                    let outcome = self.materialize(request, id).await;
                    guard.complete(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    async fn materialize(&self, request: Ingest, id: LayerId) -> Result<LayerId> {
        let blob = request.staging.path().join(BLOB_FILE);
        let diff_dir = request.staging.path().join(DIFF_DIR);
        let codec = Arc::clone(&self.codec);

        let (diff_id, size_bytes) = blocking(move || {
            let file = File::open(&blob).map_err(|e| {
                StoreError::StorageIo(format!("Failed to open {}: {}", blob.display(), e))
            })?;
            codec.unpack(&mut BufReader::new(file), &diff_dir)?;
            let diff_id = digest_tree(&diff_dir)?;
            let size = dir_size(&diff_dir)?;
            Ok((diff_id, size))
        })
        .await?;

        if let Some(expected) = &request.expected_diff_id {
            if *expected != diff_id {
                return Err(StoreError::IntegrityMismatch {
                    expected: expected.to_string(),
                    actual: diff_id.to_string(),
                });
            }
        }

        let (references, claimed) = request.claim.initial();
        let record = LayerRecord {
            id: id.clone(),
            digest: request.digest,
            diff_id,
            parent: request.parent,
            size_bytes,
            packed_size: request.packed_size,
            created_at: request.created_at.unwrap_or_else(Utc::now),
            labels: request.labels,
            storage_location: self.layer_dir(&id).join(DIFF_DIR),
            references,
            claimed,
            children: 0,
        };

        self.commit(request.staging, record, request.claim)
    }

    fn commit(&self, staging: TempDir, record: LayerRecord, claim: Claim) -> Result<LayerId> {
        let id = record.id.clone();
        let layer_dir = self.layer_dir(&id);

        let mut index = self.index.lock();
        if index.layers.contains_key(&id) {
            self.claim_locked(&mut index, &id, claim)?;
            return Ok(id);
        }
        if let Some(parent) = &record.parent {
            if !index.layers.contains_key(parent) {
                return Err(StoreError::ParentNotFound(parent.to_string()));
            }
        }

        if layer_dir.exists() {
            tracing::warn!(path = %layer_dir.display(), "Replacing unindexed layer directory");
            std::fs::remove_dir_all(&layer_dir)?;
        }
        std::fs::rename(staging.path(), &layer_dir).map_err(|e| {
            StoreError::StorageIo(format!(
                "Failed to move staged layer into {}: {}",
                layer_dir.display(),
                e
            ))
        })?;

        let mut next = index.clone();
        if let Some(parent) = record.parent.as_ref().and_then(|p| next.layers.get_mut(p)) {
            parent.children += 1;
        }
        let digest = record.digest.clone();
        let diff_id = record.diff_id.clone();
        let size_bytes = record.size_bytes;
        next.layers.insert(id.clone(), record);

        if let Err(e) = save_json(&self.index_path, &next) {
            let _ = std::fs::remove_dir_all(&layer_dir);
            return Err(e);
        }
        *index = next;

        tracing::info!(
            id = %id,
            digest = %digest,
            diff_id = %diff_id,
            size_bytes,
            "Created layer"
        );
        Ok(id)
    }
}

fn pack_into(codec: &dyn ArchiveCodec, source: &Path, blob: &Path) -> Result<(Digest, u64)> {
    let file = File::create(blob).map_err(|e| {
        StoreError::StorageIo(format!("Failed to create {}: {}", blob.display(), e))
    })?;
    let mut writer = DigestWriter::new(BufWriter::new(file));
    codec.pack(source, &mut writer)?;
    let (buffered, digest, size) = writer.finish();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok((digest, size))
}

fn write_bundle(meta: &BundleMeta, blob: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest).map_err(|e| {
        StoreError::StorageIo(format!("Failed to create {}: {}", dest.display(), e))
    })?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let meta_json = serde_json::to_vec_pretty(meta)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(meta_json.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, BUNDLE_META_FILE, &meta_json[..])?;
    builder.append_path_with_name(blob, BLOB_FILE)?;

    let buffered = builder.into_inner()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn read_bundle(bundle: &Path, blob: &Path) -> Result<(BundleMeta, Digest, u64)> {
    let file = File::open(bundle).map_err(|e| {
        StoreError::StorageIo(format!("Failed to open bundle {}: {}", bundle.display(), e))
    })?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    let mut meta: Option<BundleMeta> = None;
    let mut packed: Option<(Digest, u64)> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        match name.as_str() {
            BUNDLE_META_FILE => {
                meta = Some(serde_json::from_reader(&mut entry)?);
            }
            BLOB_FILE => {
                let out = File::create(blob)?;
                let mut writer = DigestWriter::new(BufWriter::new(out));
                std::io::copy(&mut entry, &mut writer)?;
                let (buffered, digest, size) = writer.finish();
                buffered.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                packed = Some((digest, size));
            }
            other => tracing::debug!(entry = %other, "Ignoring unknown bundle entry"),
        }
    }

    let meta = meta.ok_or_else(|| {
        StoreError::Serialization(format!("{} is missing {}", bundle.display(), BUNDLE_META_FILE))
    })?;
    let (digest, size) = packed.ok_or_else(|| {
        StoreError::Serialization(format!("{} is missing {}", bundle.display(), BLOB_FILE))
    })?;
    Ok((meta, digest, size))
}

fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst).map_err(|e| {
        StoreError::StorageIo(format!(
            "Failed to copy {} to {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })?;
    let _ = std::fs::remove_file(src);
    Ok(())
}

fn purge_staging(tmp_dir: &Path) -> Result<()> {
    if tmp_dir.exists() {
        let stale = std::fs::read_dir(tmp_dir)?.count();
        if stale > 0 {
            tracing::warn!(count = stale, path = %tmp_dir.display(), "Removing stale staging entries");
        }
        std::fs::remove_dir_all(tmp_dir)?;
    }
    std::fs::create_dir_all(tmp_dir).map_err(|e| {
        StoreError::StorageIo(format!(
            "Failed to create staging directory {}: {}",
            tmp_dir.display(),
            e
        ))
    })
}

fn remove_orphan_dirs(layers_dir: &Path, index: &LayerIndex) -> Result<()> {
    for entry in std::fs::read_dir(layers_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !index.layers.contains_key(&LayerId::from(name.as_str())) {
            tracing::warn!(path = %entry.path().display(), "Removing unindexed layer directory");
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Total size of the regular files below `path`.
fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Codec wrapper counting unpack calls, slowed down so concurrent
    /// callers overlap.
    #[derive(Default)]
    struct CountingCodec {
        unpacks: AtomicUsize,
    }

    impl ArchiveCodec for CountingCodec {
        fn pack(&self, dir: &Path, out: &mut dyn Write) -> Result<()> {
            TarGzCodec.pack(dir, out)
        }

        fn unpack(&self, input: &mut dyn Read, target: &Path) -> Result<()> {
            self.unpacks.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            TarGzCodec.unpack(input, target)
        }
    }

    fn create_source(dir: &Path, files: &[(&str, &str)]) {
        std::fs::create_dir_all(dir).unwrap();
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
        }
    }

    fn open_store(root: &Path) -> LayerStore {
        LayerStore::open(&StoreConfig::with_root(root)).unwrap()
    }

    fn layer_dirs(root: &Path) -> usize {
        std::fs::read_dir(root.join(LAYERS_DIR)).unwrap().count()
    }

    fn staging_entries(root: &Path) -> usize {
        std::fs::read_dir(root.join(TMP_DIR)).unwrap().count()
    }

    #[tokio::test]
    async fn test_create_layer_records_metadata() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("etc/motd", "hello"), ("bin/tool", "#!/bin/sh")]);
        let store = open_store(&tmp.path().join("store"));

        let mut labels = BTreeMap::new();
        labels.insert("stage".to_string(), "base".to_string());
        let id = store.create_layer(&src, None, labels.clone()).await.unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.id.as_str(), record.digest.hex());
        assert_eq!(record.diff_id, digest_tree(&src).unwrap());
        assert_eq!(record.parent, None);
        assert_eq!(record.labels, labels);
        assert_eq!(record.references, 1);
        assert!(!record.claimed);
        assert_eq!(record.size_bytes, 14);
        assert!(record.packed_size > 0);
        assert_eq!(
            std::fs::read_to_string(record.storage_location.join("etc/motd")).unwrap(),
            "hello"
        );
        assert!(store.blob_path(&id).unwrap().is_file());
        assert_eq!(store.find_by_digest(&record.digest), Some(id));
    }

    #[tokio::test]
    async fn test_create_layer_dedups_identical_content() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        create_source(&a, &[("f", "same"), ("d/g", "also")]);
        create_source(&b, &[("d/g", "also"), ("f", "same")]);

        let codec = Arc::new(CountingCodec::default());
        let root = tmp.path().join("store");
        let store = LayerStore::with_codec(&StoreConfig::with_root(&root), codec.clone()).unwrap();

        let first = store.create_layer(&a, None, BTreeMap::new()).await.unwrap();
        let second = store.create_layer(&b, None, BTreeMap::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(codec.unpacks.load(Ordering::SeqCst), 1);
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.reference_count(&first).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_unpacks_once() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("data", "shared content")]);

        let codec = Arc::new(CountingCodec::default());
        let root = tmp.path().join("store");
        let store = Arc::new(
            LayerStore::with_codec(&StoreConfig::with_root(&root), codec.clone()).unwrap(),
        );

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let src = src.clone();
                tokio::spawn(async move { store.create_layer(&src, None, BTreeMap::new()).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(codec.unpacks.load(Ordering::SeqCst), 1);
        assert_eq!(layer_dirs(&root), 1);
        assert_eq!(store.inflight.len(), 0);
        assert_eq!(staging_entries(&root), 0);
    }

    #[tokio::test]
    async fn test_create_layer_missing_parent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "x")]);
        let root = tmp.path().join("store");
        let store = open_store(&root);

        let err = store
            .create_layer(&src, Some(&LayerId::from("deadbeef")), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ParentNotFound(_)));
        assert_eq!(layer_dirs(&root), 0);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let store = open_store(&root);

        let result = store
            .create_layer(&tmp.path().join("missing"), None, BTreeMap::new())
            .await;
        assert!(result.is_err());
        assert!(store.list().is_empty());
        assert_eq!(layer_dirs(&root), 0);
        assert_eq!(staging_entries(&root), 0);
    }

    #[tokio::test]
    async fn test_layer_chain_base_first() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2, d3) = (tmp.path().join("d1"), tmp.path().join("d2"), tmp.path().join("d3"));
        create_source(&d1, &[("base", "1")]);
        create_source(&d2, &[("mid", "2")]);
        create_source(&d3, &[("top", "3")]);
        let store = open_store(&tmp.path().join("store"));

        let l1 = store.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
        let l2 = store.create_layer(&d2, Some(&l1), BTreeMap::new()).await.unwrap();
        let l3 = store.create_layer(&d3, Some(&l2), BTreeMap::new()).await.unwrap();

        assert_eq!(store.get_layer_chain(&l3).unwrap(), vec![l1.clone(), l2.clone(), l3]);
        assert_eq!(store.get_layer_chain(&l1).unwrap(), vec![l1.clone()]);
        assert_eq!(store.get(&l1).unwrap().children, 1);
    }

    #[tokio::test]
    async fn test_layer_chain_detects_missing_ancestor() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2) = (tmp.path().join("d1"), tmp.path().join("d2"));
        create_source(&d1, &[("base", "1")]);
        create_source(&d2, &[("top", "2")]);
        let store = open_store(&tmp.path().join("store"));

        let l1 = store.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
        let l2 = store.create_layer(&d2, Some(&l1), BTreeMap::new()).await.unwrap();

        // Simulate index corruption.
        store.index.lock().layers.remove(&l1);

        let err = store.get_layer_chain(&l2).unwrap_err();
        assert!(matches!(err, StoreError::BrokenChain { .. }));
        assert!(matches!(
            store.get_layer_chain(&LayerId::from("nope")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_layer_guards_dependents() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2) = (tmp.path().join("d1"), tmp.path().join("d2"));
        create_source(&d1, &[("base", "1")]);
        create_source(&d2, &[("top", "2")]);
        let root = tmp.path().join("store");
        let store = open_store(&root);

        let l1 = store.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
        let l2 = store.create_layer(&d2, Some(&l1), BTreeMap::new()).await.unwrap();

        // Creation reference still held.
        assert!(matches!(
            store.remove_layer(&l2),
            Err(StoreError::HasDependents { references: 1, children: 0, .. })
        ));

        assert_eq!(store.release(&l1).unwrap(), 0);
        assert!(matches!(
            store.remove_layer(&l1),
            Err(StoreError::HasDependents { references: 0, children: 1, .. })
        ));

        assert_eq!(store.release(&l2).unwrap(), 0);
        store.remove_layer(&l2).unwrap();
        store.remove_layer(&l1).unwrap();

        assert!(store.list().is_empty());
        assert_eq!(layer_dirs(&root), 0);
        assert!(matches!(store.remove_layer(&l1), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retain_release_counts() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "x")]);
        let store = open_store(&tmp.path().join("store"));
        let id = store.create_layer(&src, None, BTreeMap::new()).await.unwrap();

        assert_eq!(store.retain(&id).unwrap(), 1);
        assert_eq!(store.retain(&id).unwrap(), 2);
        assert_eq!(store.release(&id).unwrap(), 1);
        assert_eq!(store.release(&id).unwrap(), 0);
        // Release at zero is a no-op; nothing is deleted eagerly.
        assert_eq!(store.release(&id).unwrap(), 0);
        assert!(store.contains(&id));
        assert!(matches!(
            store.retain(&LayerId::from("missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retain_all_is_all_or_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "x")]);
        let store = open_store(&tmp.path().join("store"));
        let id = store.create_layer(&src, None, BTreeMap::new()).await.unwrap();
        store.retain(&id).unwrap();

        let err = store
            .retain_all(&[id.clone(), LayerId::from("missing")])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.reference_count(&id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collect_garbage_walks_chain() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2, d3) = (tmp.path().join("d1"), tmp.path().join("d2"), tmp.path().join("d3"));
        create_source(&d1, &[("base", "1")]);
        create_source(&d2, &[("top", "2")]);
        create_source(&d3, &[("other", "3")]);
        let store = open_store(&tmp.path().join("store"));

        let l1 = store.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
        let l2 = store.create_layer(&d2, Some(&l1), BTreeMap::new()).await.unwrap();
        let kept = store.create_layer(&d3, None, BTreeMap::new()).await.unwrap();

        store.release_all(&[l1.clone(), l2.clone()]).unwrap();
        let mut removed = store.collect_garbage().unwrap();
        removed.sort();
        let mut expected = vec![l1, l2];
        expected.sort();

        assert_eq!(removed, expected);
        assert_eq!(store.list().len(), 1);
        assert!(store.contains(&kept));
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("usr/lib/x.so", "elf"), ("etc/conf", "k=v")]);
        let exporter = open_store(&tmp.path().join("a"));
        let importer = open_store(&tmp.path().join("b"));

        let mut labels = BTreeMap::new();
        labels.insert("origin".to_string(), "test".to_string());
        let id = exporter.create_layer(&src, None, labels).await.unwrap();
        let bundle = tmp.path().join("layer.bundle");
        exporter.export_layer(&id, &bundle).await.unwrap();

        let imported = importer.import_layer(&bundle).await.unwrap();
        assert_eq!(imported, id);

        let original = exporter.get(&id).unwrap();
        let copy = importer.get(&imported).unwrap();
        assert_eq!(copy.digest, original.digest);
        assert_eq!(copy.diff_id, original.diff_id);
        assert_eq!(copy.labels, original.labels);
        assert_eq!(copy.created_at, original.created_at);
        assert_eq!(copy.size_bytes, original.size_bytes);

        // Importing again is a dedup hit.
        assert_eq!(importer.import_layer(&bundle).await.unwrap(), id);
        assert_eq!(importer.list().len(), 1);
    }

    fn forge_bundle(dest: &Path, meta: &BundleMeta, blob: &Path) {
        write_bundle(meta, blob, dest).unwrap();
    }

    #[tokio::test]
    async fn test_import_rejects_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "real content")]);
        let exporter = open_store(&tmp.path().join("a"));
        let root = tmp.path().join("b");
        let importer = open_store(&root);

        let id = exporter.create_layer(&src, None, BTreeMap::new()).await.unwrap();
        let record = exporter.get(&id).unwrap();
        let meta = BundleMeta {
            digest: crate::digest::digest_slice(b"something else"),
            diff_id: record.diff_id.clone(),
            parent: None,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
            labels: BTreeMap::new(),
        };
        let bundle = tmp.path().join("forged.bundle");
        forge_bundle(&bundle, &meta, &exporter.blob_path(&id).unwrap());

        let err = importer.import_layer(&bundle).await.unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
        assert!(importer.list().is_empty());
        assert_eq!(layer_dirs(&root), 0);
        assert_eq!(staging_entries(&root), 0);
    }

    #[tokio::test]
    async fn test_import_rejects_diff_id_mismatch() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "real content")]);
        let exporter = open_store(&tmp.path().join("a"));
        let root = tmp.path().join("b");
        let importer = open_store(&root);

        let id = exporter.create_layer(&src, None, BTreeMap::new()).await.unwrap();
        let record = exporter.get(&id).unwrap();
        let meta = BundleMeta {
            digest: record.digest.clone(),
            diff_id: crate::digest::digest_slice(b"wrong tree"),
            parent: None,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
            labels: BTreeMap::new(),
        };
        let bundle = tmp.path().join("forged.bundle");
        forge_bundle(&bundle, &meta, &exporter.blob_path(&id).unwrap());

        let err = importer.import_layer(&bundle).await.unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
        assert!(importer.list().is_empty());
        assert_eq!(layer_dirs(&root), 0);
    }

    #[tokio::test]
    async fn test_import_requires_parent() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2) = (tmp.path().join("d1"), tmp.path().join("d2"));
        create_source(&d1, &[("base", "1")]);
        create_source(&d2, &[("top", "2")]);
        let exporter = open_store(&tmp.path().join("a"));
        let importer = open_store(&tmp.path().join("b"));

        let l1 = exporter.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
        let l2 = exporter.create_layer(&d2, Some(&l1), BTreeMap::new()).await.unwrap();
        let (b1, b2) = (tmp.path().join("l1.bundle"), tmp.path().join("l2.bundle"));
        exporter.export_layer(&l1, &b1).await.unwrap();
        exporter.export_layer(&l2, &b2).await.unwrap();

        assert!(matches!(
            importer.import_layer(&b2).await,
            Err(StoreError::ParentNotFound(_))
        ));
        importer.import_layer(&b1).await.unwrap();
        importer.import_layer(&b2).await.unwrap();
        assert_eq!(importer.get_layer_chain(&l2).unwrap(), vec![l1, l2]);
    }

    #[tokio::test]
    async fn test_import_blob_verifies_digest() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "blob")]);
        let root = tmp.path().join("store");
        let store = open_store(&root);

        let blob = tmp.path().join("download.tar.gz");
        let mut out = File::create(&blob).unwrap();
        TarGzCodec.pack(&src, &mut out).unwrap();
        drop(out);
        let digest = digest_file(&blob).unwrap();

        let wrong = crate::digest::digest_slice(b"other");
        let err = store
            .import_blob(&blob, &wrong, None, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
        assert!(store.list().is_empty());

        let blob2 = tmp.path().join("download2.tar.gz");
        let mut out = File::create(&blob2).unwrap();
        TarGzCodec.pack(&src, &mut out).unwrap();
        drop(out);
        let id = store
            .import_blob(&blob2, &digest, None, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.get(&id).unwrap().digest, digest);
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2) = (tmp.path().join("d1"), tmp.path().join("d2"));
        create_source(&d1, &[("base", "1")]);
        create_source(&d2, &[("top", "2")]);
        let root = tmp.path().join("store");

        let (l1, l2) = {
            let store = open_store(&root);
            let l1 = store.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
            let l2 = store.create_layer(&d2, Some(&l1), BTreeMap::new()).await.unwrap();
            store.retain(&l2).unwrap();
            (l1, l2)
        };

        let store = open_store(&root);
        assert_eq!(store.get_layer_chain(&l2).unwrap(), vec![l1.clone(), l2.clone()]);
        assert_eq!(store.get(&l1).unwrap().children, 1);
        assert!(store.get(&l2).unwrap().claimed);
    }

    #[tokio::test]
    async fn test_reopen_repairs_layout() {
        let tmp = TempDir::new().unwrap();
        let (d1, d2) = (tmp.path().join("d1"), tmp.path().join("d2"));
        create_source(&d1, &[("a", "1")]);
        create_source(&d2, &[("b", "2")]);
        let root = tmp.path().join("store");

        let (gone, kept) = {
            let store = open_store(&root);
            let gone = store.create_layer(&d1, None, BTreeMap::new()).await.unwrap();
            let kept = store.create_layer(&d2, None, BTreeMap::new()).await.unwrap();
            (gone, kept)
        };

        std::fs::remove_dir_all(root.join(LAYERS_DIR).join(gone.as_str())).unwrap();
        std::fs::create_dir_all(root.join(LAYERS_DIR).join("orphan")).unwrap();
        std::fs::create_dir_all(root.join(TMP_DIR).join("stage-crashed")).unwrap();

        let store = open_store(&root);
        assert!(!store.contains(&gone));
        assert!(store.contains(&kept));
        assert!(!root.join(LAYERS_DIR).join("orphan").exists());
        assert_eq!(staging_entries(&root), 0);
    }

    #[test]
    fn test_dir_size() {
        let tmp = TempDir::new().unwrap();
        create_source(tmp.path(), &[("a.txt", "hello"), ("sub/b.txt", "world")]);
        assert_eq!(dir_size(tmp.path()).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_remove_layer_leaves_no_content_behind() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "x")]);
        let root = tmp.path().join("store");
        let store = open_store(&root);

        let id = store.create_layer(&src, None, BTreeMap::new()).await.unwrap();
        store.release(&id).unwrap();
        store.remove_layer(&id).unwrap();
        assert_eq!(layer_dirs(&root), 0);
        assert_eq!(staging_entries(&root), 0);

        let again = store.create_layer(&src, None, BTreeMap::new()).await.unwrap();
        assert_eq!(again, id);
        assert!(store.layer_path(&id).unwrap().join("f").is_file());
        assert_eq!(store.reference_count(&id).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_racing_recreate_keeps_indexed_content() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "x")]);
        let root = tmp.path().join("store");
        let store = Arc::new(open_store(&root));

        for _ in 0..10 {
            let id = store.create_layer(&src, None, BTreeMap::new()).await.unwrap();
            assert_eq!(store.release(&id).unwrap(), 0);

            let remover = {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::task::spawn_blocking(move || store.remove_layer(&id))
            };
            let creator = {
                let store = Arc::clone(&store);
                let src = src.clone();
                tokio::spawn(async move { store.create_layer(&src, None, BTreeMap::new()).await })
            };

            match remover.await.unwrap() {
                Ok(()) | Err(StoreError::HasDependents { .. }) => {}
                Err(e) => panic!("unexpected removal failure: {e}"),
            }
            let created = creator.await.unwrap().unwrap();

            assert!(store.contains(&created));
            assert!(store.layer_path(&created).unwrap().join("f").is_file());
            assert_eq!(store.reference_count(&created).unwrap(), 1);
        }
        assert_eq!(layer_dirs(&root), 1);
        assert_eq!(staging_entries(&root), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_layer_rejects_special_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        create_source(&src, &[("f", "x")]);
        let _listener = std::os::unix::net::UnixListener::bind(src.join("agent.sock")).unwrap();
        let root = tmp.path().join("store");
        let store = open_store(&root);

        match store.create_layer(&src, None, BTreeMap::new()).await {
            Err(StoreError::StorageIo(msg)) => assert!(msg.contains("Unsupported file type"), "{msg}"),
            other => panic!("expected StorageIo, got {other:?}"),
        }
        assert!(store.list().is_empty());
        assert_eq!(layer_dirs(&root), 0);
        assert_eq!(staging_entries(&root), 0);
    }
}

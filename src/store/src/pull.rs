//! Pull and push orchestration between a registry and the local store.
//!
//! A pull resolves the manifest, downloads missing blobs concurrently into a
//! staging directory, verifies each against its descriptor, and only then
//! registers layers in chain order and assembles the image. Dropping a pull
//! midway leaves no partially registered layer behind.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use a3s_store_core::error::{Result, StoreError};
use a3s_store_core::StoreConfig;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::digest::{digest_file, digest_slice, Digest};
use crate::gateway::{RegistryGateway, RemoteManifest};
use crate::image::{Descriptor, ImageCatalog, ImageConfig, ImageId, ImageReference};
use crate::layer::{LayerId, LayerLease};
use crate::task::blocking;

/// Pulls images from a registry into the local store.
pub struct ImagePuller {
    catalog: Arc<ImageCatalog>,
    gateway: Arc<dyn RegistryGateway>,
    max_concurrent_downloads: usize,
    pull_timeout: Duration,
}

impl ImagePuller {
    pub fn new(
        catalog: Arc<ImageCatalog>,
        gateway: Arc<dyn RegistryGateway>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            catalog,
            gateway,
            max_concurrent_downloads: config.max_concurrent_downloads.max(1),
            pull_timeout: config.pull_timeout(),
        }
    }

    /// Pull `reference`, tag it locally and record its `repo@digest`.
    pub async fn pull(&self, reference: &str) -> Result<ImageId> {
        let parsed = ImageReference::parse(reference)?;

        match tokio::time::timeout(self.pull_timeout, self.pull_reference(&parsed)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "pull of {} exceeded {}s",
                parsed,
                self.pull_timeout.as_secs()
            ))),
        }
    }

    async fn pull_reference(&self, reference: &ImageReference) -> Result<ImageId> {
        tracing::info!(reference = %reference, "Pulling image");

        let remote = self.gateway.fetch_manifest(reference).await?;
        let layers = self.catalog.layers();
        let download = layers.staging_dir()?;

        let config_path = download.path().join("config.json");
        self.fetch_verified(reference, &remote.config, &config_path)
            .await?;
        let config_blob = tokio::fs::read(&config_path).await?;
        let config = ImageConfig::from_oci_json(&config_blob)?;

        let missing: Vec<(usize, &Descriptor)> = remote
            .layers
            .iter()
            .enumerate()
            .filter(|(_, d)| !layers.exists(&d.digest))
            .collect();
        tracing::debug!(
            total = remote.layers.len(),
            missing = missing.len(),
            "Resolved layers to download"
        );

        let fetched: HashMap<usize, PathBuf> = stream::iter(missing)
            .map(|(position, descriptor)| {
                let path = download.path().join(format!("layer-{}", position));
                async move {
                    self.fetch_verified(reference, descriptor, &path).await?;
                    Ok::<_, StoreError>((position, path))
                }
            })
            .buffer_unordered(self.max_concurrent_downloads)
            .try_collect()
            .await?;

        let mut lease = LayerLease::new(layers);
        let chain = self
            .import_chain(reference, &remote, fetched, download.path(), &mut lease)
            .await?;

        let id = self.catalog.assemble_image(&chain, &config)?;
        drop(lease);

        if reference.tag.is_some() {
            let tagged = ImageReference {
                digest: None,
                ..reference.clone()
            };
            self.catalog.tag(&id, &tagged.to_string())?;
        }
        self.catalog
            .add_repo_digest(&id, &reference.with_digest(remote.digest.clone()).to_string())?;

        tracing::info!(
            reference = %reference,
            id = %id.short(),
            digest = %remote.digest,
            layers = chain.len(),
            "Pulled image"
        );
        Ok(id)
    }

    /// Register layers base first, each on top of its predecessor.
    async fn import_chain(
        &self,
        reference: &ImageReference,
        remote: &RemoteManifest,
        mut fetched: HashMap<usize, PathBuf>,
        download: &Path,
        lease: &mut LayerLease<'_>,
    ) -> Result<Vec<LayerId>> {
        let layers = self.catalog.layers();
        let mut chain: Vec<LayerId> = Vec::with_capacity(remote.layers.len());

        for (position, descriptor) in remote.layers.iter().enumerate() {
            let path = match fetched.remove(&position) {
                Some(path) => path,
                None => {
                    let held = match layers.find_by_digest(&descriptor.digest) {
                        Some(id) => match lease.hold(&id) {
                            Ok(()) => Some(id),
                            Err(StoreError::NotFound(_)) => None,
                            Err(e) => return Err(e),
                        },
                        None => None,
                    };
                    if let Some(id) = held {
                        tracing::debug!(id = %id.short(), "Layer already present");
                        chain.push(id);
                        continue;
                    }
                    // Collected since the manifest was resolved.
                    let path = download.join(format!("layer-{}", position));
                    self.fetch_verified(reference, descriptor, &path).await?;
                    path
                }
            };

            let id = lease
                .import_blob(&path, &descriptor.digest, chain.last(), BTreeMap::new())
                .await?;
            chain.push(id);
        }

        Ok(chain)
    }

    /// Download a blob and check it against its descriptor.
    async fn fetch_verified(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        path: &Path,
    ) -> Result<()> {
        self.gateway.fetch_blob(reference, descriptor, path).await?;

        let target = path.to_path_buf();
        let (digest, size) = blocking(move || {
            let digest = digest_file(&target)?;
            let size = std::fs::metadata(&target)?.len();
            Ok((digest, size))
        })
        .await?;

        if size != descriptor.size {
            return Err(StoreError::IntegrityMismatch {
                expected: format!("{} ({} bytes)", descriptor.digest, descriptor.size),
                actual: format!("{} ({} bytes)", digest, size),
            });
        }
        if digest != descriptor.digest {
            return Err(StoreError::IntegrityMismatch {
                expected: descriptor.digest.to_string(),
                actual: digest.to_string(),
            });
        }

        tracing::debug!(digest = %digest, size, "Verified blob");
        Ok(())
    }
}

/// Pushes local images to a registry.
pub struct ImagePusher {
    catalog: Arc<ImageCatalog>,
    gateway: Arc<dyn RegistryGateway>,
}

impl ImagePusher {
    pub fn new(catalog: Arc<ImageCatalog>, gateway: Arc<dyn RegistryGateway>) -> Self {
        Self { catalog, gateway }
    }

    /// Push the image named by `image` to `reference`: layer blobs, then the
    /// config blob, then the manifest. Returns the pushed manifest digest.
    pub async fn push(&self, image: &str, reference: &str) -> Result<Digest> {
        let target = ImageReference::parse(reference)?;
        let id = self.catalog.resolve(image)?;
        let record = self.catalog.inspect(&id)?;
        let layers = self.catalog.layers();

        tracing::info!(id = %id.short(), reference = %target, "Pushing image");

        for (layer, descriptor) in record.layer_chain.iter().zip(&record.manifest.layers) {
            let path = layers.blob_path(layer)?;
            self.gateway.push_blob(&target, descriptor, &path).await?;
            tracing::debug!(digest = %descriptor.digest, "Pushed layer blob");
        }

        let diff_ids: Vec<Digest> = self
            .catalog
            .history(&id)?
            .into_iter()
            .map(|layer| layer.diff_id)
            .collect();
        let config_blob = record.config.to_oci_json(&diff_ids)?;
        let config_digest = digest_slice(&config_blob);
        if config_digest != record.manifest.config.digest {
            return Err(StoreError::IntegrityMismatch {
                expected: record.manifest.config.digest.to_string(),
                actual: config_digest.to_string(),
            });
        }

        let staging = layers.staging_dir()?;
        let config_path = staging.path().join("config.json");
        tokio::fs::write(&config_path, &config_blob).await?;
        self.gateway
            .push_blob(&target, &record.manifest.config, &config_path)
            .await?;

        let digest = self.gateway.push_manifest(&target, &record.manifest).await?;
        self.catalog
            .add_repo_digest(&id, &target.with_digest(digest.clone()).to_string())?;

        tracing::info!(
            id = %id.short(),
            reference = %target,
            digest = %digest,
            "Pushed image"
        );
        Ok(digest)
    }
}

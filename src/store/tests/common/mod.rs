//! Shared fixtures for the store integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use a3s_store::{
    Descriptor, Digest, ImageReference, Manifest, RegistryGateway, RemoteManifest, Store,
};
use a3s_store_core::{Result, StoreConfig, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

/// A store rooted under `tmp`, with its own sub-directory per `name`.
pub fn open_store(tmp: &TempDir, name: &str) -> (Store, StoreConfig) {
    let config = StoreConfig::with_root(tmp.path().join(name));
    let store = Store::open(&config).unwrap();
    (store, config)
}

/// Create a directory holding one file per `(path, contents)` pair.
pub fn snapshot(tmp: &TempDir, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = tmp.path().join("snapshots").join(name);
    for (path, contents) in files {
        let file = dir.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, contents).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Registry kept in memory: pushed blobs and manifests can be pulled back.
#[derive(Default)]
pub struct MemoryRegistry {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    manifests: Mutex<HashMap<String, RemoteManifest>>,
    pub blob_fetches: AtomicUsize,
}

impl MemoryRegistry {
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(digest)
    }
}

#[async_trait]
impl RegistryGateway for MemoryRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RemoteManifest> {
        self.manifests
            .lock()
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| StoreError::TransferFailed {
                registry: reference.registry.clone(),
                message: format!("manifest unknown: {}", reference),
            })
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        destination: &Path,
    ) -> Result<()> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .blobs
            .lock()
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| StoreError::TransferFailed {
                registry: reference.registry.clone(),
                message: format!("blob unknown: {}", descriptor.digest),
            })?;
        tokio::fs::write(destination, data).await?;
        Ok(())
    }

    async fn push_blob(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
        source: &Path,
    ) -> Result<()> {
        let data = tokio::fs::read(source).await?;
        self.blobs.lock().insert(descriptor.digest.clone(), data);
        Ok(())
    }

    async fn push_manifest(&self, reference: &ImageReference, manifest: &Manifest) -> Result<Digest> {
        let digest = manifest.digest()?;
        let remote = RemoteManifest {
            digest: digest.clone(),
            config: manifest.config.clone(),
            layers: manifest.layers.clone(),
        };
        let mut manifests = self.manifests.lock();
        manifests.insert(reference.to_string(), remote.clone());
        manifests.insert(reference.with_digest(digest.clone()).to_string(), remote);
        Ok(digest)
    }
}

//! Registry gateway abstraction.
//!
//! The store consumes registries only through [`RegistryGateway`]; transport,
//! authentication and retries belong to the implementation.

use std::path::Path;

use a3s_store_core::error::Result;
use async_trait::async_trait;

use crate::digest::Digest;
use crate::image::{Descriptor, ImageReference, Manifest};

/// A manifest as served by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteManifest {
    /// Digest of the manifest document itself
    pub digest: Digest,
    pub config: Descriptor,
    /// Layer descriptors, base first
    pub layers: Vec<Descriptor>,
}

/// Blob and manifest transfer against a registry.
///
/// Failures are reported as `TransferFailed`; callers decide whether to
/// retry.
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Resolve `reference` to a single-platform manifest.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RemoteManifest>;

    /// Download the blob named by `descriptor` into `destination`.
    ///
    /// Integrity is checked by the caller against the descriptor.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        destination: &Path,
    ) -> Result<()>;

    /// Upload the blob stored at `source`.
    async fn push_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        source: &Path,
    ) -> Result<()>;

    /// Publish `manifest` under `reference`, returning the manifest digest
    /// the registry stores.
    async fn push_manifest(&self, reference: &ImageReference, manifest: &Manifest)
        -> Result<Digest>;
}

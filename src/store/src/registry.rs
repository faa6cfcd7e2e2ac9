//! [`RegistryGateway`] over the `oci-distribution` client.

use std::collections::HashMap;
use std::path::Path;

use a3s_store_core::error::{Result, StoreError};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::digest::{digest_slice, Digest};
use crate::gateway::{RegistryGateway, RemoteManifest};
use crate::image::{Descriptor, ImageReference, Manifest};

/// Credentials for a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to
    /// anonymous access unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry gateway speaking the OCI distribution protocol.
///
/// Pushed blobs are held until [`RegistryGateway::push_manifest`], which
/// uploads them together with the manifest in one client session.
pub struct OciRegistryGateway {
    client: Client,
    auth: RegistryAuth,
    pending: Mutex<HashMap<String, Vec<(Descriptor, Vec<u8>)>>>,
}

impl OciRegistryGateway {
    /// Gateway using credentials from the environment.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::from_env())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self::build(auth, ClientProtocol::Https)
    }

    /// Gateway speaking plain HTTP, for local development registries.
    pub fn insecure(auth: RegistryAuth) -> Self {
        Self::build(auth, ClientProtocol::Http)
    }

    fn build(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for OciRegistryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryGateway for OciRegistryGateway {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RemoteManifest> {
        let oci_ref = to_oci_reference(reference)?;

        let (manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| transfer_failed(reference, "Failed to pull manifest", e))?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            layers = manifest.layers.len(),
            "Fetched manifest"
        );

        Ok(RemoteManifest {
            digest: digest.parse()?,
            config: from_oci_descriptor(&manifest.config)?,
            layers: manifest
                .layers
                .iter()
                .map(from_oci_descriptor)
                .collect::<Result<_>>()?,
        })
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        destination: &Path,
    ) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        let oci_descriptor = to_oci_descriptor(descriptor);

        let mut file = tokio::fs::File::create(destination).await.map_err(|e| {
            StoreError::StorageIo(format!("Failed to create {}: {}", destination.display(), e))
        })?;
        self.client
            .pull_blob(&oci_ref, &oci_descriptor, &mut file)
            .await
            .map_err(|e| {
                transfer_failed(
                    reference,
                    &format!("Failed to pull blob {}", descriptor.digest),
                    e,
                )
            })?;
        file.flush().await?;
        file.sync_all().await?;

        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Fetched blob");
        Ok(())
    }

    async fn push_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        source: &Path,
    ) -> Result<()> {
        let data = tokio::fs::read(source).await.map_err(|e| {
            StoreError::StorageIo(format!("Failed to read {}: {}", source.display(), e))
        })?;
        self.pending
            .lock()
            .entry(reference.to_string())
            .or_default()
            .push((descriptor.clone(), data));
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &Manifest,
    ) -> Result<Digest> {
        let oci_ref = to_oci_reference(reference)?;
        let blobs = self
            .pending
            .lock()
            .remove(&reference.to_string())
            .unwrap_or_default();

        let take = |descriptor: &Descriptor| -> Result<Vec<u8>> {
            blobs
                .iter()
                .find(|(d, _)| d.digest == descriptor.digest)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| StoreError::TransferFailed {
                    registry: reference.registry.clone(),
                    message: format!("blob {} was not pushed before the manifest", descriptor.digest),
                })
        };

        let config = Config::new(take(&manifest.config)?, manifest.config.media_type.clone(), None);
        let layers = manifest
            .layers
            .iter()
            .map(|d| Ok(ImageLayer::new(take(d)?, d.media_type.clone(), None)))
            .collect::<Result<Vec<_>>>()?;

        let oci_manifest: OciImageManifest = serde_json::from_slice(&manifest.to_json()?)?;
        let digest = digest_slice(&serde_json::to_vec(&oci_manifest)?);

        let response = self
            .client
            .push(
                &oci_ref,
                &layers,
                config,
                &self.auth.to_oci_auth(),
                Some(oci_manifest),
            )
            .await
            .map_err(|e| transfer_failed(reference, "Failed to push image", e))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            digest = %digest,
            "Pushed manifest"
        );
        Ok(digest)
    }
}

fn transfer_failed(
    reference: &ImageReference,
    context: &str,
    err: impl std::fmt::Display,
) -> StoreError {
    StoreError::TransferFailed {
        registry: reference.registry.clone(),
        message: format!("{}: {}", context, err),
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let rendered = reference.to_string();
    rendered.parse::<Reference>().map_err(|e| {
        StoreError::InvalidReference(format!("{}: {}", rendered, e))
    })
}

fn from_oci_descriptor(descriptor: &OciDescriptor) -> Result<Descriptor> {
    let size = u64::try_from(descriptor.size).map_err(|_| {
        StoreError::Serialization(format!(
            "negative size {} for {}",
            descriptor.size, descriptor.digest
        ))
    })?;
    Ok(Descriptor::new(
        &descriptor.media_type,
        descriptor.digest.parse()?,
        size,
    ))
}

fn to_oci_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: descriptor.media_type.clone(),
        digest: descriptor.digest.to_string(),
        size: i64::try_from(descriptor.size).unwrap_or(i64::MAX),
        ..Default::default()
    }
}

/// Pick the linux manifest matching the host CPU from a multi-platform index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

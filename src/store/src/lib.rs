//! A3S Store - Content-addressed layer storage and image catalog.
//!
//! Layers are immutable filesystem snapshots identified by the digest of
//! their packed archive and linked to a parent. Images are ordered layer
//! chains plus a runtime config, addressed by manifest digest and named by
//! tags. Registry transfer goes through [`RegistryGateway`]; archive
//! encoding goes through [`ArchiveCodec`].

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod builder;
pub mod digest;
pub mod gateway;
pub mod image;
pub mod layer;
pub(crate) mod persist;
pub mod pull;
pub mod registry;
pub(crate) mod task;

use std::sync::Arc;

use a3s_store_core::error::Result;
use a3s_store_core::StoreConfig;

// Re-export common types
pub use archive::{ArchiveCodec, TarGzCodec};
pub use builder::{BuildPlan, BuildStep, ImageBuilder};
pub use digest::{digest_bytes, digest_file, digest_slice, digest_tree, Digest, DigestWriter};
pub use gateway::{RegistryGateway, RemoteManifest};
pub use image::{Descriptor, ImageCatalog, ImageConfig, ImageId, ImageRecord, ImageReference};
pub use image::{Manifest, PruneReport};
pub use layer::{LayerId, LayerRecord, LayerStore};
pub use pull::{ImagePuller, ImagePusher};
pub use registry::{OciRegistryGateway, RegistryAuth};

/// A3S Store version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Layer store and image catalog opened over the same root.
#[derive(Clone)]
pub struct Store {
    pub layers: Arc<LayerStore>,
    pub catalog: Arc<ImageCatalog>,
}

impl Store {
    /// Open (or initialize) the store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let layers = Arc::new(LayerStore::open(config)?);
        let catalog = Arc::new(ImageCatalog::open(config, layers.clone())?);
        tracing::debug!(
            root = %config.root.display(),
            layers = layers.list().len(),
            images = catalog.list(true).len(),
            "Store opened"
        );
        Ok(Self { layers, catalog })
    }

    pub fn builder(&self) -> ImageBuilder {
        ImageBuilder::new(self.catalog.clone())
    }

    pub fn puller(&self, gateway: Arc<dyn RegistryGateway>, config: &StoreConfig) -> ImagePuller {
        ImagePuller::new(self.catalog.clone(), gateway, config)
    }

    pub fn pusher(&self, gateway: Arc<dyn RegistryGateway>) -> ImagePusher {
        ImagePusher::new(self.catalog.clone(), gateway)
    }
}

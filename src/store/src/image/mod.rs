//! Image catalog: manifests, runtime configs, references and tags.

mod catalog;
mod manifest;
mod record;
mod reference;

pub use catalog::{ImageCatalog, PruneReport};
pub use manifest::{Descriptor, Manifest, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};
pub use record::{ImageConfig, ImageId, ImageRecord};
pub use reference::{ImageReference, DEFAULT_REGISTRY, DEFAULT_TAG};

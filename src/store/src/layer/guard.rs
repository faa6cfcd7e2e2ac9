//! Temporary layer references held for the duration of a multi-step
//! operation such as a pull or a build.

use std::collections::BTreeMap;
use std::path::Path;

use a3s_store_core::error::Result;

use super::record::{Claim, LayerId};
use super::store::LayerStore;
use crate::digest::Digest;

/// Counted references taken on layers while an operation stitches them
/// into an image.
///
/// Every reference the lease holds is its own pin, never a layer's
/// creation reference, so dropping the lease leaves each layer exactly as
/// referenced as before the operation plus whatever image was assembled.
/// Layers the lease itself created become collectable if the operation
/// failed or was cancelled.
pub(crate) struct LayerLease<'a> {
    store: &'a LayerStore,
    ids: Vec<LayerId>,
}

impl<'a> LayerLease<'a> {
    pub(crate) fn new(store: &'a LayerStore) -> Self {
        Self {
            store,
            ids: Vec::new(),
        }
    }

    /// Pin a layer that is already stored.
    pub(crate) fn hold(&mut self, id: &LayerId) -> Result<()> {
        self.store.pin(id)?;
        self.ids.push(id.clone());
        Ok(())
    }

    /// Create a layer from `source`, pinned by this lease.
    pub(crate) async fn create(
        &mut self,
        source: &Path,
        parent: Option<&LayerId>,
        labels: BTreeMap<String, String>,
    ) -> Result<LayerId> {
        let id = self
            .store
            .create_layer_with(source, parent, labels, Claim::Pin)
            .await?;
        self.ids.push(id.clone());
        Ok(id)
    }

    /// Register a downloaded archive, pinned by this lease.
    pub(crate) async fn import_blob(
        &mut self,
        blob: &Path,
        expected: &Digest,
        parent: Option<&LayerId>,
        labels: BTreeMap<String, String>,
    ) -> Result<LayerId> {
        let id = self
            .store
            .import_blob_with(blob, expected, parent, labels, Claim::Pin)
            .await?;
        self.ids.push(id.clone());
        Ok(id)
    }
}

impl Drop for LayerLease<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        match self.store.release_all(&self.ids) {
            Ok(zeroed) if !zeroed.is_empty() => {
                tracing::debug!(count = zeroed.len(), "Lease left layers unreferenced");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Failed to release layer lease"),
        }
    }
}

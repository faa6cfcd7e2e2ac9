//! Layer metadata records and the persisted layer index.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Layer identifier: the hex part of the packed-content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Derive the id of the layer whose packed representation has `digest`.
    pub fn from_digest(digest: &Digest) -> Self {
        Self(digest.hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for display.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.strip_prefix("sha256:").unwrap_or(s).to_string())
    }
}

/// Metadata for one stored layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    /// Digest of the packed (archive) representation
    pub digest: Digest,
    /// Digest of the unpacked tree
    pub diff_id: Digest,
    /// Layer beneath this one
    pub parent: Option<LayerId>,
    /// Size of the unpacked content in bytes
    pub size_bytes: u64,
    /// Size of the packed archive in bytes
    #[serde(default)]
    pub packed_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Directory holding the unpacked content
    pub storage_location: PathBuf,
    /// Number of outstanding references (images, operation pins and any
    /// unclaimed creation reference)
    #[serde(default)]
    pub references: u32,
    /// Whether the creation reference has been handed over to a holder
    #[serde(default)]
    pub claimed: bool,
    /// Number of layers whose parent is this layer
    #[serde(default)]
    pub children: u32,
}

/// How the caller of a layer-producing operation holds the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The caller owns an unclaimed creation reference, which the first
    /// image assembled over the layer adopts.
    Creation,
    /// The caller holds a plain counted reference and must release it.
    Pin,
}

impl Claim {
    /// Reference state of a layer committed under this claim.
    pub(crate) fn initial(self) -> (u32, bool) {
        (1, self == Claim::Pin)
    }
}

impl LayerRecord {
    /// Take a reference. The first retain adopts the creation reference
    /// instead of adding a new one; returns `true` when it did.
    pub(crate) fn retain(&mut self) -> bool {
        if self.claimed {
            self.references += 1;
            false
        } else {
            self.claimed = true;
            true
        }
    }

    /// Undo a [`LayerRecord::retain`] that returned `adopted`.
    pub(crate) fn revert_retain(&mut self, adopted: bool) {
        if adopted {
            self.claimed = false;
        } else {
            self.references = self.references.saturating_sub(1);
        }
    }

    /// Record another caller receiving this layer. Returns `true` if the
    /// counts changed.
    ///
    /// A pin always counts. A creation claim only adds a reference when no
    /// unclaimed creation reference is outstanding, so repeated creations
    /// of the same content share one.
    pub(crate) fn claim(&mut self, claim: Claim) -> bool {
        match claim {
            Claim::Pin => {
                self.references += 1;
                true
            }
            Claim::Creation if self.claimed => {
                self.references += 1;
                self.claimed = false;
                true
            }
            Claim::Creation => false,
        }
    }

    /// Drop a reference. Returns `false` if the count was already zero.
    ///
    /// An outstanding creation reference survives until the count reaches
    /// zero.
    pub(crate) fn release(&mut self) -> bool {
        if self.references == 0 {
            self.claimed = true;
            return false;
        }
        self.references -= 1;
        if self.references == 0 {
            self.claimed = true;
        }
        true
    }

    /// Undo a successful [`LayerRecord::release`] given the prior `claimed`.
    pub(crate) fn revert_release(&mut self, was_claimed: bool) {
        self.references += 1;
        self.claimed = was_claimed;
    }

    /// Eligible for garbage collection.
    pub fn is_unreferenced(&self) -> bool {
        self.references == 0 && self.children == 0
    }
}

/// Persistent layer index stored as `layers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LayerIndex {
    pub(crate) layers: BTreeMap<LayerId, LayerRecord>,
}

impl LayerIndex {
    /// Recompute every record's child count from the parent links.
    pub(crate) fn recount_children(&mut self) {
        let mut counts: BTreeMap<LayerId, u32> = BTreeMap::new();
        for record in self.layers.values() {
            if let Some(parent) = &record.parent {
                *counts.entry(parent.clone()).or_default() += 1;
            }
        }
        for (id, record) in self.layers.iter_mut() {
            record.children = counts.get(id).copied().unwrap_or(0);
        }
    }
}

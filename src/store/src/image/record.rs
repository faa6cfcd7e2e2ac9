//! Image records, runtime configuration and the persisted catalog index.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use a3s_store_core::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::manifest::Manifest;
use crate::digest::Digest;
use crate::layer::LayerId;

/// Image identifier: the hex part of the manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
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

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.strip_prefix("sha256:").unwrap_or(s).to_string())
    }
}

/// Runtime defaults for containers started from an image.
///
/// Collections are ordered so the JSON encoding, and therefore the image
/// id, does not depend on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub volumes: BTreeSet<String>,
    pub exposed_ports: BTreeSet<String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            architecture: host_architecture().to_string(),
            os: std::env::consts::OS.to_string(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            volumes: BTreeSet::new(),
            exposed_ports: BTreeSet::new(),
            user: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ImageConfig {
    /// Convert a registry config blob.
    pub fn from_oci(oci: &ImageConfiguration) -> Self {
        let mut config = Self {
            architecture: oci.architecture().to_string(),
            os: oci.os().to_string(),
            ..Self::default()
        };

        let Some(c) = oci.config() else {
            return config;
        };

        config.entrypoint = c.entrypoint().clone().unwrap_or_default();
        config.cmd = c.cmd().clone().unwrap_or_default();
        config.env = c
            .env()
            .iter()
            .flatten()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config.working_dir = c.working_dir().clone().filter(|d| !d.is_empty());
        config.user = c.user().clone().filter(|u| !u.is_empty());
        config.volumes = c.volumes().iter().flatten().cloned().collect();
        config.exposed_ports = c.exposed_ports().iter().flatten().cloned().collect();
        config.labels = c
            .labels()
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config
    }

    /// Parse a registry config blob.
    pub fn from_oci_json(data: &[u8]) -> Result<Self> {
        let oci: ImageConfiguration = serde_json::from_slice(data).map_err(|e| {
            StoreError::Serialization(format!("Failed to parse image config: {}", e))
        })?;
        Ok(Self::from_oci(&oci))
    }

    /// Encode as a registry config blob over the given layer tree digests.
    ///
    /// The encoding carries no timestamps, so equal inputs produce equal
    /// bytes.
    pub fn to_oci_json(&self, diff_ids: &[Digest]) -> Result<Vec<u8>> {
        let mut runtime = Map::new();
        if let Some(user) = &self.user {
            runtime.insert("User".into(), json!(user));
        }
        if !self.exposed_ports.is_empty() {
            runtime.insert("ExposedPorts".into(), empty_object_set(&self.exposed_ports));
        }
        if !self.env.is_empty() {
            let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            runtime.insert("Env".into(), json!(env));
        }
        if !self.entrypoint.is_empty() {
            runtime.insert("Entrypoint".into(), json!(self.entrypoint));
        }
        if !self.cmd.is_empty() {
            runtime.insert("Cmd".into(), json!(self.cmd));
        }
        if !self.volumes.is_empty() {
            runtime.insert("Volumes".into(), empty_object_set(&self.volumes));
        }
        if let Some(dir) = &self.working_dir {
            runtime.insert("WorkingDir".into(), json!(dir));
        }
        if !self.labels.is_empty() {
            runtime.insert("Labels".into(), json!(self.labels));
        }

        let diff_ids: Vec<String> = diff_ids.iter().map(Digest::to_string).collect();
        let blob = json!({
            "architecture": self.architecture,
            "os": self.os,
            "config": Value::Object(runtime),
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        });
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Overlay `other` on top of this config, as a build step does on top
    /// of its base image.
    pub fn merged_with(&self, other: &ImageConfig) -> ImageConfig {
        let mut merged = self.clone();
        if !other.architecture.is_empty() {
            merged.architecture = other.architecture.clone();
        }
        if !other.os.is_empty() {
            merged.os = other.os.clone();
        }
        if !other.entrypoint.is_empty() {
            merged.entrypoint = other.entrypoint.clone();
        }
        if !other.cmd.is_empty() {
            merged.cmd = other.cmd.clone();
        }
        if other.working_dir.is_some() {
            merged.working_dir = other.working_dir.clone();
        }
        if other.user.is_some() {
            merged.user = other.user.clone();
        }
        merged.env.extend(other.env.clone());
        merged.labels.extend(other.labels.clone());
        merged.volumes.extend(other.volumes.iter().cloned());
        merged.exposed_ports.extend(other.exposed_ports.iter().cloned());
        merged
    }
}

fn empty_object_set(keys: &BTreeSet<String>) -> Value {
    Value::Object(keys.iter().map(|k| (k.clone(), json!({}))).collect())
}

/// OCI architecture name of the host.
fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Metadata for one image in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub manifest: Manifest,
    /// Layers, base first
    pub layer_chain: Vec<LayerId>,
    pub config: ImageConfig,
    /// Normalized `repo:tag` references pointing at this image
    #[serde(default)]
    pub repo_tags: BTreeSet<String>,
    /// Normalized `repo@digest` references pointing at this image
    #[serde(default)]
    pub repo_digests: BTreeSet<String>,
    /// Unpacked size of the chain plus the config blob
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// An image no tag table entry points at.
    pub fn is_dangling(&self) -> bool {
        self.repo_tags.is_empty() && self.repo_digests.is_empty()
    }

    /// Every tag table entry naming this image, tags first.
    pub fn references(&self) -> Vec<String> {
        self.repo_tags
            .iter()
            .chain(self.repo_digests.iter())
            .cloned()
            .collect()
    }

    /// First tag for display, if any.
    pub fn primary_tag(&self) -> Option<&str> {
        self.repo_tags.iter().next().map(String::as_str)
    }
}

/// Persistent catalog stored as `images.json`: image records plus the tag
/// table, written together so they never disagree on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CatalogIndex {
    pub(crate) images: BTreeMap<ImageId, ImageRecord>,
    /// Normalized reference → image id
    pub(crate) tags: BTreeMap<String, ImageId>,
}

impl CatalogIndex {
    /// Point `reference` at `id`, detaching it from whichever image held it.
    pub(crate) fn set_tag(&mut self, reference: String, id: &ImageId, is_digest: bool) {
        if let Some(previous) = self.tags.insert(reference.clone(), id.clone()) {
            if let Some(record) = self.images.get_mut(&previous) {
                record.repo_tags.remove(&reference);
                record.repo_digests.remove(&reference);
            }
        }
        if let Some(record) = self.images.get_mut(id) {
            if is_digest {
                record.repo_digests.insert(reference);
            } else {
                record.repo_tags.insert(reference);
            }
        }
    }

    /// Remove `reference` from the tag table. Returns the image it named.
    pub(crate) fn remove_tag(&mut self, reference: &str) -> Option<ImageId> {
        let id = self.tags.remove(reference)?;
        if let Some(record) = self.images.get_mut(&id) {
            record.repo_tags.remove(reference);
            record.repo_digests.remove(reference);
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_slice;
    use crate::image::manifest::{Descriptor, CONFIG_MEDIA_TYPE};

    fn record(name: &str) -> ImageRecord {
        let digest = digest_slice(name.as_bytes());
        ImageRecord {
            id: ImageId::from_digest(&digest),
            manifest: Manifest::new(Descriptor::for_blob(CONFIG_MEDIA_TYPE, b"{}"), vec![]),
            layer_chain: vec![],
            config: ImageConfig::default(),
            repo_tags: BTreeSet::new(),
            repo_digests: BTreeSet::new(),
            size_bytes: 0,
            created_at: Utc::now(),
        }
    }

    fn sample_config() -> ImageConfig {
        let mut config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            entrypoint: vec!["/bin/app".to_string()],
            cmd: vec!["--serve".to_string()],
            working_dir: Some("/srv".to_string()),
            user: Some("1000".to_string()),
            ..ImageConfig::default()
        };
        config.env.insert("PATH".to_string(), "/usr/bin".to_string());
        config.env.insert("MODE".to_string(), "a=b".to_string());
        config.exposed_ports.insert("8080/tcp".to_string());
        config.volumes.insert("/data".to_string());
        config.labels.insert("team".to_string(), "store".to_string());
        config
    }

    #[test]
    fn test_oci_json_roundtrip() {
        let config = sample_config();
        let diff_ids = vec![digest_slice(b"tree")];
        let blob = config.to_oci_json(&diff_ids).unwrap();

        let parsed = ImageConfig::from_oci_json(&blob).unwrap();
        assert_eq!(parsed, config);

        let value: Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(value["rootfs"]["diff_ids"][0], diff_ids[0].to_string());
        assert_eq!(value["config"]["ExposedPorts"]["8080/tcp"], json!({}));
    }

    #[test]
    fn test_oci_json_is_canonical() {
        let mut a = ImageConfig::default();
        a.env.insert("A".to_string(), "1".to_string());
        a.env.insert("B".to_string(), "2".to_string());
        let mut b = ImageConfig::default();
        b.env.insert("B".to_string(), "2".to_string());
        b.env.insert("A".to_string(), "1".to_string());
        assert_eq!(a.to_oci_json(&[]).unwrap(), b.to_oci_json(&[]).unwrap());
    }

    #[test]
    fn test_from_oci_json_rejects_garbage() {
        assert!(matches!(
            ImageConfig::from_oci_json(b"[1,2"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_merged_with_overlays() {
        let base = sample_config();
        let mut overlay = ImageConfig {
            architecture: String::new(),
            os: String::new(),
            cmd: vec!["--debug".to_string()],
            ..ImageConfig::default()
        };
        overlay.env.insert("MODE".to_string(), "dev".to_string());
        overlay.exposed_ports.insert("9090/tcp".to_string());

        let merged = base.merged_with(&overlay);
        assert_eq!(merged.entrypoint, base.entrypoint);
        assert_eq!(merged.cmd, vec!["--debug".to_string()]);
        assert_eq!(merged.env["MODE"], "dev");
        assert_eq!(merged.env["PATH"], "/usr/bin");
        assert_eq!(merged.exposed_ports.len(), 2);
        assert_eq!(merged.architecture, "amd64");
        assert_eq!(merged.working_dir.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_set_tag_moves_reference() {
        let mut index = CatalogIndex::default();
        let a = record("a");
        let b = record("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        index.images.insert(a_id.clone(), a);
        index.images.insert(b_id.clone(), b);

        index.set_tag("docker.io/library/app:v1".to_string(), &a_id, false);
        index.set_tag("docker.io/library/app:v1".to_string(), &b_id, false);

        assert!(index.images[&a_id].is_dangling());
        assert_eq!(
            index.images[&b_id].primary_tag(),
            Some("docker.io/library/app:v1")
        );
        assert_eq!(index.tags["docker.io/library/app:v1"], b_id);

        assert_eq!(index.remove_tag("docker.io/library/app:v1"), Some(b_id.clone()));
        assert!(index.images[&b_id].is_dangling());
        assert_eq!(index.remove_tag("docker.io/library/app:v1"), None);
    }

    #[test]
    fn test_digest_reference_keeps_image_named() {
        let mut index = CatalogIndex::default();
        let a = record("a");
        let a_id = a.id.clone();
        index.images.insert(a_id.clone(), a);

        let pinned = format!("docker.io/library/app@{}", digest_slice(b"m"));
        index.set_tag(pinned.clone(), &a_id, true);
        assert!(!index.images[&a_id].is_dangling());
        assert_eq!(index.images[&a_id].references(), vec![pinned.clone()]);
        assert_eq!(index.images[&a_id].primary_tag(), None);

        index.remove_tag(&pinned);
        assert!(index.images[&a_id].is_dangling());
    }

    #[test]
    fn test_image_id_parsing() {
        let digest = digest_slice(b"manifest");
        let id = ImageId::from_digest(&digest);
        assert_eq!(ImageId::from(digest.to_string().as_str()), id);
        assert_eq!(id.short().len(), 12);
    }
}

//! Human image references (`repo:tag`, `repo@digest`).
//!
//! References are normalized before they enter the tag table so that
//! `nginx`, `nginx:latest` and `docker.io/library/nginx:latest` all name the
//! same entry.

use std::fmt;

use a3s_store_core::error::{Result, StoreError};

use crate::digest::Digest;

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// Parsed and normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, possibly with port (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/nginx")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `nginx` → `docker.io/library/nginx:latest`
    /// - `org/app:v1` → `docker.io/org/app:v1`
    /// - `localhost:5000/app` → `localhost:5000/app:latest`
    /// - `ghcr.io/org/app@sha256:…` → digest reference, no default tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StoreError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = digest.parse::<Digest>().map_err(|e| {
                    StoreError::InvalidReference(format!("{}: {}", reference, e))
                })?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; one before it is a
        // registry port.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(&name_tag[split + 1..]))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry(reference, name)?;
        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Same repository, pinned to `digest` instead of a tag.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidReference(format!(
            "invalid tag '{}' in '{}'",
            tag, reference
        )))
    }
}

fn split_registry(reference: &str, name: &str) -> Result<(String, String)> {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        _ => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    let valid = !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                })
        });
    if !valid {
        return Err(StoreError::InvalidReference(format!(
            "invalid repository '{}' in '{}'",
            repository, reference
        )));
    }

    Ok((registry, repository))
}

//! Archive codec for the packed layer representation.
//!
//! The store only talks to [`ArchiveCodec`]; [`TarGzCodec`] is the default
//! gzip-compressed tar implementation. Packing is deterministic: entries are
//! emitted in canonical path order with normalized headers, so identical
//! trees always pack to identical bytes (and therefore identical digests).

use std::io::{Read, Write};
use std::path::Path;

use a3s_store_core::error::{Result, StoreError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::digest::canonical_entries;

/// Packs a directory into a byte stream and back.
///
/// Implementations are blocking; the store calls them from
/// `spawn_blocking` tasks.
pub trait ArchiveCodec: Send + Sync {
    /// Pack the contents of `dir` into `out`.
    fn pack(&self, dir: &Path, out: &mut dyn Write) -> Result<()>;

    /// Unpack an archive read from `input` into `target`.
    fn unpack(&self, input: &mut dyn Read, target: &Path) -> Result<()>;
}

/// Deterministic tar.gz codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzCodec;

impl ArchiveCodec for TarGzCodec {
    fn pack(&self, dir: &Path, out: &mut dyn Write) -> Result<()> {
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        for entry in canonical_entries(dir)? {
            let appended = if entry.is_dir() {
                builder.append_dir(&entry.relative, &entry.path)
            } else {
                builder.append_path_with_name(&entry.path, &entry.relative)
            };
            appended.map_err(|e| {
                StoreError::StorageIo(format!(
                    "Failed to add {} to archive: {}",
                    entry.relative.display(),
                    e
                ))
            })?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| StoreError::StorageIo(format!("Failed to finalize archive: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| StoreError::StorageIo(format!("Failed to finish compression: {}", e)))?;

        Ok(())
    }

    fn unpack(&self, input: &mut dyn Read, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target).map_err(|e| {
            StoreError::StorageIo(format!(
                "Failed to create target directory {}: {}",
                target.display(),
                e
            ))
        })?;

        let decoder = GzDecoder::new(input);
        let mut archive = tar::Archive::new(decoder);
        archive.set_overwrite(true);
        archive.unpack(target).map_err(|e| {
            StoreError::StorageIo(format!(
                "Failed to extract archive to {}: {}",
                target.display(),
                e
            ))
        })?;

        tracing::debug!(target = %target.display(), "Unpacked layer archive");
        Ok(())
    }
}

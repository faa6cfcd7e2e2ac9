//! Content digest engine.
//!
//! Computes SHA256 digests over byte streams and directory trees. Tree
//! digests enumerate entries in byte-lexicographic order of their relative
//! path, so identical content yields the same digest regardless of the order
//! in which the filesystem returns directory entries.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use a3s_store_core::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Digest algorithm used for every object in the store.
pub const ALGORITHM: &str = "sha256";

const HEX_LEN: usize = 64;
const READ_BUF_SIZE: usize = 64 * 1024;

/// A SHA256 content digest, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Build a digest from a bare 64-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != HEX_LEN || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(StoreError::InvalidDigest(format!(
                "expected {} lowercase hex characters, got '{}'",
                HEX_LEN, hex
            )));
        }
        Ok(Self {
            hex: hex.to_string(),
        })
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// The hex part of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            StoreError::InvalidDigest(format!("missing algorithm prefix in '{}'", s))
        })?;
        if algorithm != ALGORITHM {
            return Err(StoreError::InvalidDigest(format!(
                "unsupported algorithm '{}' in '{}'",
                algorithm, s
            )));
        }
        Self::from_hex(hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Digest an in-memory byte slice.
pub fn digest_slice(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_hasher(hasher)
}

/// Digest everything readable from `reader`.
pub fn digest_bytes<R: Read>(mut reader: R) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest::from_hasher(hasher))
}

/// Digest a file on disk.
pub fn digest_file(path: &Path) -> Result<Digest> {
    let file = std::fs::File::open(path).map_err(|e| {
        StoreError::StorageIo(format!("Failed to open {}: {}", path.display(), e))
    })?;
    digest_bytes(io::BufReader::new(file))
}

/// Writer adapter that hashes every byte forwarded to the inner writer.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the adapter, returning the inner writer, the digest and the
    /// number of bytes written.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
    Symlink,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::Dir => b'd',
            EntryKind::File => b'f',
            EntryKind::Symlink => b'l',
        }
    }
}

/// A single entry of a directory tree, keyed by the raw bytes of its
/// `/`-separated relative path.
#[derive(Debug, Clone)]
pub(crate) struct TreeEntry {
    pub(crate) relative: PathBuf,
    pub(crate) path: PathBuf,
    key: Vec<u8>,
    kind: EntryKind,
}

impl TreeEntry {
    pub(crate) fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// List every entry below `root` in canonical order.
///
/// Symlinks are recorded, never followed. FIFOs, sockets and device nodes
/// cannot be stored and fail the listing.
pub(crate) fn canonical_entries(root: &Path) -> Result<Vec<TreeEntry>> {
    let meta = std::fs::symlink_metadata(root).map_err(|e| {
        StoreError::StorageIo(format!("Failed to stat {}: {}", root.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(StoreError::StorageIo(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    collect_entries(root, root, &mut entries)?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

fn collect_entries(root: &Path, current: &Path, entries: &mut Vec<TreeEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StoreError::StorageIo(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|e| {
            StoreError::StorageIo(format!("Failed to read directory entry: {}", e))
        })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| {
            StoreError::StorageIo(format!("Failed to stat {}: {}", path.display(), e))
        })?;

        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                StoreError::StorageIo(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            return Err(StoreError::StorageIo(format!(
                "Unsupported file type at {}: only directories, regular files and symlinks can be stored",
                path.display()
            )));
        };

        entries.push(TreeEntry {
            key: path_bytes(&relative),
            relative,
            path: path.clone(),
            kind,
        });

        if kind == EntryKind::Dir {
            collect_entries(root, &path, entries)?;
        }
    }

    Ok(())
}

/// Raw bytes of a path with `/` separators; names need not be UTF-8.
#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().replace('\\', "/").into_bytes()
}

/// Digest a directory tree.
///
/// Each entry contributes its kind, its relative path and, for regular files,
/// the length-prefixed content (for symlinks, the link target). Permissions,
/// ownership and timestamps do not participate.
pub fn digest_tree(root: &Path) -> Result<Digest> {
    let mut hasher = Sha256::new();

    for entry in canonical_entries(root)? {
        hasher.update([entry.kind.tag()]);
        hasher.update(&entry.key);
        hasher.update([0u8]);

        match entry.kind {
            EntryKind::Dir => {}
            EntryKind::File => {
                let mut file = std::fs::File::open(&entry.path).map_err(|e| {
                    StoreError::StorageIo(format!(
                        "Failed to open {}: {}",
                        entry.path.display(),
                        e
                    ))
                })?;
                let len = file.metadata()?.len();
                hasher.update(len.to_be_bytes());
                io::copy(&mut file, &mut hasher)?;
            }
            EntryKind::Symlink => {
                let target = std::fs::read_link(&entry.path)?;
                hasher.update(path_bytes(&target));
                hasher.update([0u8]);
            }
        }
    }

    Ok(Digest::from_hasher(hasher))
}

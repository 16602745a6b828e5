//! File-per-key storage under a data directory.
//!
//! Keys are mapped to flat file names: ASCII letters, digits, `-`, `_` and
//! `.` are kept, every other byte becomes `%XX`. A name that would grow past
//! what filesystems accept is replaced by `#` and the SHA-256 of the key,
//! and the file then starts with the key itself so it can still be listed.
//! Writes go to a temporary file first and are renamed into place, so a
//! crash never leaves a torn value behind.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{StorageBackend, StorageInfo, StorageProvider, check_quota, entry_size};
use crate::BoxFuture;
use crate::error::{Result, SyncError};

/// Prefix of in-progress writes. `~` is always escaped in key names, so no
/// key ever maps to a file starting with it.
const TEMP_PREFIX: char = '~';

/// Prefix of hashed names. `#` is always escaped in key names too.
const HASHED_PREFIX: char = '#';

/// Longest encoded name used as is. NAME_MAX is 255 on common filesystems.
const MAX_PLAIN_NAME: usize = 200;

/// Where a key lives on disk.
struct Slot {
    path: PathBuf,
    /// Key header written before the value of hashed files
    header: Option<Vec<u8>>,
}

impl Slot {
    fn overhead(&self) -> u64 {
        self.header.as_ref().map_or(0, |h| h.len() as u64)
    }
}

/// Storage provider keeping one file per key.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    quota: u64,
    /// Bytes in use. Also serializes writers so the quota check and the
    /// write happen together.
    used: Mutex<u64>,
}

impl FileStorage {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, quota: u64) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut used = 0u64;
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                // Leftover from an interrupted write
                let _ = tokio::fs::remove_file(entry.path()).await;
                continue;
            }
            if let Some((key, len)) = stored_entry(&entry.path(), &name).await? {
                used += entry_size(&key, len as usize);
            }
        }

        log::debug!("[FileStorage] Opened {:?} ({} bytes used)", root, used);
        Ok(Self {
            root,
            quota,
            used: Mutex::new(used),
        })
    }

    /// Directory holding the files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot(&self, key: &str) -> Slot {
        let name = encode_key(key);
        if name.len() <= MAX_PLAIN_NAME {
            return Slot {
                path: self.root.join(name),
                header: None,
            };
        }
        let digest = Sha256::digest(key.as_bytes());
        Slot {
            path: self.root.join(format!("{}{:x}", HASHED_PREFIX, digest)),
            header: Some(key_header(key)),
        }
    }

    async fn current_len(path: &Path) -> Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl StorageProvider for FileStorage {
    fn backend(&self) -> StorageBackend {
        StorageBackend::File
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let slot = self.slot(key);
            let mut bytes = match tokio::fs::read(&slot.path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            match &slot.header {
                None => Ok(Some(bytes)),
                Some(header) if bytes.starts_with(header) => {
                    Ok(Some(bytes.split_off(header.len())))
                }
                // Another key with the same digest
                Some(_) => Ok(None),
            }
        })
    }

    fn write<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let slot = self.slot(key);
            let path = &slot.path;
            let mut used = self.used.lock().await;

            let old = Self::current_len(path)
                .await?
                .map(|len| entry_size(key, len.saturating_sub(slot.overhead()) as usize))
                .unwrap_or(0);
            let new = entry_size(key, value.len());
            check_quota(*used, old, new, self.quota)?;

            let tmp = self
                .root
                .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
            let mut file = tokio::fs::File::create(&tmp).await?;
            if let Some(header) = &slot.header {
                file.write_all(header).await?;
            }
            file.write_all(value).await?;
            file.sync_all().await?;
            drop(file);

            if let Err(e) = tokio::fs::rename(&tmp, path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(SyncError::Durability(format!(
                    "failed to commit {}: {}",
                    key, e
                )));
            }

            *used = used.saturating_sub(old) + new;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let slot = self.slot(key);
            let mut used = self.used.lock().await;
            let Some(len) = Self::current_len(&slot.path).await? else {
                return Ok(false);
            };
            tokio::fs::remove_file(&slot.path).await?;
            let len = len.saturating_sub(slot.overhead());
            *used = used.saturating_sub(entry_size(key, len as usize));
            Ok(true)
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut dir = tokio::fs::read_dir(&self.root).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some((key, _)) = stored_entry(&entry.path(), &name).await?
                    && key.starts_with(prefix)
                {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut used = self.used.lock().await;
            let mut dir = tokio::fs::read_dir(&self.root).await?;
            while let Some(entry) = dir.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    tokio::fs::remove_file(entry.path()).await?;
                }
            }
            *used = 0;
            Ok(())
        })
    }

    fn get_info(&self) -> BoxFuture<'_, Result<StorageInfo>> {
        Box::pin(async move {
            let used = *self.used.lock().await;
            Ok(StorageInfo::new(StorageBackend::File, used, self.quota))
        })
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Key length (little-endian `u32`) followed by the key.
fn key_header(key: &str) -> Vec<u8> {
    let mut header = Vec::with_capacity(4 + key.len());
    header.extend_from_slice(&(key.len() as u32).to_le_bytes());
    header.extend_from_slice(key.as_bytes());
    header
}

fn parse_header(bytes: &[u8]) -> Option<(String, usize)> {
    let len = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    let key = std::str::from_utf8(bytes.get(4..4 + len)?).ok()?;
    Some((key.to_string(), 4 + len))
}

/// Key stored in the file `name` and the length of its value.
async fn stored_entry(path: &Path, name: &str) -> Result<Option<(String, u64)>> {
    if name.starts_with(HASHED_PREFIX) {
        let bytes = tokio::fs::read(path).await?;
        return Ok(parse_header(&bytes)
            .map(|(key, overhead)| (key, (bytes.len() - overhead) as u64)));
    }
    match decode_key(name) {
        Some(key) => Ok(Some((key, tokio::fs::metadata(path).await?.len()))),
        None => Ok(None),
    }
}

fn decode_key(name: &str) -> Option<String> {
    if name.starts_with(TEMP_PREFIX) || name.starts_with(HASHED_PREFIX) {
        return None;
    }
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

//! Persisted store file.
//!
//! Layout:
//! ```text
//! b"cache" | u32 version | zstd( u32 count | { key | u64 token | u32 len | value }* )
//! ```
//! Writes go to a temporary file that is renamed over the old one, so a
//! crash mid-save leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::key::{CacheKey, KEY_SIZE};
use crate::cache::store::{StoreEntry, StoreError, StoreSnapshot};
use crate::cache::value::CacheValue;

/// Leading bytes of every store file.
pub const STORE_SIGNATURE: &[u8; 5] = b"cache";

/// Current store file version.
pub const STORE_FILE_VERSION: u32 = 1;

const STORE_FILE_NAME: &str = "cache.dat";

/// Reads and writes the store snapshot under the storage root.
#[derive(Debug, Clone)]
pub struct StoreFile {
    path: PathBuf,
    zstd_level: i32,
}

impl StoreFile {
    pub fn new(root: &Path, zstd_level: i32) -> Self {
        Self {
            path: root.join(STORE_FILE_NAME),
            zstd_level,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty snapshot.
    pub async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        if !fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "No store file, starting empty");
            return Ok(StoreSnapshot::default());
        }
        let data = fs::read(&self.path).await?;
        let snapshot = tokio::task::spawn_blocking(move || decode_snapshot(&data)).await??;
        debug!(
            path = %self.path.display(),
            entries = snapshot.entries.len(),
            "Loaded store file"
        );
        Ok(snapshot)
    }

    /// Read the snapshot, degrading to empty on any error.
    pub async fn load_or_empty(&self) -> StoreSnapshot {
        match self.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    "Store file unusable, starting with an empty store: {e}"
                );
                StoreSnapshot::default()
            }
        }
    }

    /// Encode and write a snapshot. Returns the number of bytes written.
    pub async fn save(&self, snapshot: StoreSnapshot) -> Result<u64, StoreError> {
        let level = self.zstd_level;
        let data = tokio::task::spawn_blocking(move || encode_snapshot(&snapshot, level)).await??;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("dat.tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), size = data.len(), "Wrote store file");
        Ok(data.len() as u64)
    }
}

/// Encode a snapshot into the on-disk format.
pub fn encode_snapshot(snapshot: &StoreSnapshot, zstd_level: i32) -> Result<Vec<u8>, StoreError> {
    let mut body = BytesMut::new();
    body.put_u32_le(snapshot.entries.len() as u32);
    for (key, entry) in &snapshot.entries {
        let value = entry.value.serialize()?;
        body.put_slice(key.as_bytes());
        body.put_u64_le(entry.access_token);
        body.put_u32_le(value.len() as u32);
        body.put_slice(&value);
    }

    let compressed = zstd::encode_all(&body[..], zstd_level)?;
    let mut out = Vec::with_capacity(STORE_SIGNATURE.len() + 4 + compressed.len());
    out.extend_from_slice(STORE_SIGNATURE);
    out.extend_from_slice(&STORE_FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode the on-disk format, checking signature and version first.
pub fn decode_snapshot(data: &[u8]) -> Result<StoreSnapshot, StoreError> {
    let header_len = STORE_SIGNATURE.len() + 4;
    if data.len() < header_len || &data[..STORE_SIGNATURE.len()] != STORE_SIGNATURE {
        return Err(StoreError::BadSignature);
    }
    let mut version = &data[STORE_SIGNATURE.len()..header_len];
    let version = version.get_u32_le();
    if version != STORE_FILE_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }

    let body = zstd::decode_all(&data[header_len..])
        .map_err(|e| StoreError::Corrupt(format!("body decompression failed: {e}")))?;
    let mut buf = &body[..];

    if buf.remaining() < 4 {
        return Err(StoreError::Corrupt("missing entry count".to_string()));
    }
    let count = buf.get_u32_le();
    let mut entries = Vec::with_capacity(count.min(1 << 16) as usize);
    for i in 0..count {
        if buf.remaining() < KEY_SIZE + 8 + 4 {
            return Err(StoreError::Corrupt(format!("entry {i} header truncated")));
        }
        let key = CacheKey::from_slice(&buf[..KEY_SIZE])
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        buf.advance(KEY_SIZE);
        let access_token = buf.get_u64_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(StoreError::Corrupt(format!("entry {i} value truncated")));
        }
        let value = CacheValue::deserialize(&buf[..len])?;
        buf.advance(len);
        entries.push((
            key,
            StoreEntry::new(value, access_token),
        ));
    }
    if buf.has_remaining() {
        return Err(StoreError::Corrupt(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }

    Ok(StoreSnapshot { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::evictor::EvictionPolicy;
    use crate::cache::key::DIGEST_SIZE;
    use crate::cache::store::Store;
    use tempfile::TempDir;

    fn populated_store() -> Store {
        let mut store = Store::with_limits(10_000, 0, EvictionPolicy::default());
        for id in 0..3u8 {
            let mut value = CacheValue::new();
            value.add("out.bin", vec![id; 64 * (id as usize + 1)]);
            value.description_mut().append_adding_node("node-a");
            store
                .insert(CacheKey::new([id; DIGEST_SIZE], [0; DIGEST_SIZE]), value)
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let file = StoreFile::new(tmp.path(), 3);
        let store = populated_store();

        let written = file.save(store.snapshot()).await.unwrap();
        assert!(written > 0);
        assert!(file.path().exists());

        let mut restored = Store::with_limits(10_000, 0, EvictionPolicy::default());
        restored.restore(file.load().await.unwrap());
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.used_bytes(), store.used_bytes());
        for key in store.keys() {
            assert_eq!(
                restored.get(key).unwrap().value,
                store.get(key).unwrap().value
            );
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let file = StoreFile::new(&tmp.path().join("nowhere"), 3);
        assert!(file.load().await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_bad_signature_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        let file = StoreFile::new(tmp.path(), 3);
        tokio::fs::write(file.path(), b"garbage file").await.unwrap();

        assert!(matches!(file.load().await, Err(StoreError::BadSignature)));
        assert!(file.load_or_empty().await.entries.is_empty());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut data = encode_snapshot(&populated_store().snapshot(), 1).unwrap();
        data[STORE_SIGNATURE.len()] = 9;
        assert!(matches!(
            decode_snapshot(&data),
            Err(StoreError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_corrupt_body_rejected() {
        let mut data = encode_snapshot(&populated_store().snapshot(), 1).unwrap();
        let len = data.len();
        data.truncate(len - 4);
        assert!(decode_snapshot(&data).is_err());
    }
}

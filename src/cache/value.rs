//! Cached artifact values.
//!
//! A value is a set of named blobs (typically the files a build step
//! produced) plus provenance. Values are serialized into a flat byte buffer
//! for chunked transfer and for the persisted store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::fs;

/// Serialization format version of a value buffer.
const VALUE_FORMAT_VERSION: u8 = 1;

/// Separator between node identities in the provenance chains.
const CHAIN_SEPARATOR: char = '/';

#[derive(Error, Debug)]
pub enum ValueError {
    #[error("Value buffer truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Unsupported value format version {0}")]
    UnsupportedFormat(u8),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Duplicate blob name: {0}")]
    DuplicateName(String),

    #[error("Invalid blob name: {0:?}")]
    InvalidName(String),

    #[error("Declared size {declared} does not match content size {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("{field} is {len} bytes, too long to serialize")]
    TooLong { field: &'static str, len: usize },

    #[error("Value contents are not fetched")]
    NotFetched,

    #[error("Value must hold exactly one blob to export as a file, it holds {0}")]
    NotSingleBlob(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a value came from and which nodes it passed through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    /// Machine that produced the artifact.
    pub machine_name: String,

    /// Free-form creation timestamp supplied by the producer.
    pub creation_date: String,

    /// Free-form producer comment.
    pub comment: String,

    /// Nodes the value passed through while being added, in order.
    pub adding_chain: String,

    /// Nodes the value passed through while being retrieved, in order.
    pub receiving_chain: String,
}

impl Description {
    pub fn append_adding_node(&mut self, node: &str) {
        append_chain(&mut self.adding_chain, node);
    }

    pub fn append_receiving_node(&mut self, node: &str) {
        append_chain(&mut self.receiving_chain, node);
    }
}

fn append_chain(chain: &mut String, node: &str) {
    if !chain.is_empty() {
        chain.push(CHAIN_SEPARATOR);
    }
    chain.push_str(node);
}

/// A cached artifact: named blobs, aggregate size and provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    blobs: BTreeMap<String, Bytes>,
    size: u64,
    fetched: bool,
    description: Description,
}

impl Default for CacheValue {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheValue {
    /// Create an empty, fetched value.
    pub fn new() -> Self {
        Self {
            blobs: BTreeMap::new(),
            size: 0,
            fetched: true,
            description: Description::default(),
        }
    }

    /// Add or replace a named blob.
    pub fn add(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        let data = data.into();
        self.size += data.len() as u64;
        if let Some(old) = self.blobs.insert(name.into(), data) {
            self.size -= old.len() as u64;
        }
    }

    /// Add a file from disk, named by its file name.
    pub async fn add_file(&mut self, path: &Path) -> Result<(), ValueError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ValueError::InvalidName(path.display().to_string()))?
            .to_string();
        let data = fs::read(path).await?;
        self.add(name, data);
        Ok(())
    }

    /// Blob contents by name.
    pub fn blob(&self, name: &str) -> Option<&Bytes> {
        self.blobs.get(name)
    }

    pub fn blobs(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.blobs.iter().map(|(name, data)| (name.as_str(), data))
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Aggregate size of all blobs in bytes. Known even when freed.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    /// Drop blob contents from memory, keeping names and size.
    pub fn free(&mut self) {
        for data in self.blobs.values_mut() {
            *data = Bytes::new();
        }
        self.fetched = false;
    }

    /// Non-empty, and when fetched the declared size matches the contents.
    pub fn is_valid(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        !self.fetched || self.content_size() == self.size
    }

    pub fn description(&self) -> &Description {
        &self.description
    }

    pub fn description_mut(&mut self) -> &mut Description {
        &mut self.description
    }

    pub fn set_description(&mut self, description: Description) {
        self.description = description;
    }

    fn content_size(&self) -> u64 {
        self.blobs.values().map(|d| d.len() as u64).sum()
    }

    /// Serialize into a flat buffer suitable for chunking.
    ///
    /// Layout (little-endian):
    /// ```text
    /// u8 version | u32 blob count | { u16 name len | name | u32 len | data }*
    /// | u64 size | 5 × { u32 len | utf8 } description
    /// ```
    pub fn serialize(&self) -> Result<Bytes, ValueError> {
        if !self.fetched {
            return Err(ValueError::NotFetched);
        }

        let mut buf = BytesMut::with_capacity(self.serialized_size_hint());
        buf.put_u8(VALUE_FORMAT_VERSION);
        buf.put_u32_le(length_prefix(self.blobs.len(), "blob count")?);
        for (name, data) in &self.blobs {
            buf.put_u16_le(length_prefix(name.len(), "blob name")?);
            buf.put_slice(name.as_bytes());
            buf.put_u32_le(length_prefix(data.len(), "blob data")?);
            buf.put_slice(data);
        }
        buf.put_u64_le(self.size);
        for text in [
            &self.description.machine_name,
            &self.description.creation_date,
            &self.description.comment,
            &self.description.adding_chain,
            &self.description.receiving_chain,
        ] {
            buf.put_u32_le(length_prefix(text.len(), "description field")?);
            buf.put_slice(text.as_bytes());
        }
        Ok(buf.freeze())
    }

    fn serialized_size_hint(&self) -> usize {
        let blobs: usize = self.blobs.keys().map(|n| n.len() + 6).sum();
        let description = self.description.machine_name.len()
            + self.description.creation_date.len()
            + self.description.comment.len()
            + self.description.adding_chain.len()
            + self.description.receiving_chain.len()
            + 20;
        1 + 4 + blobs + self.size as usize + 8 + description
    }

    /// Rebuild a value from a buffer produced by [`CacheValue::serialize`].
    pub fn deserialize(mut buf: &[u8]) -> Result<Self, ValueError> {
        let version = read_u8(&mut buf, "version")?;
        if version != VALUE_FORMAT_VERSION {
            return Err(ValueError::UnsupportedFormat(version));
        }

        let count = read_u32(&mut buf, "blob count")?;
        let mut blobs = BTreeMap::new();
        for _ in 0..count {
            let name_len = read_u16(&mut buf, "blob name length")? as usize;
            let name = read_string(&mut buf, name_len, "blob name")?;
            let data_len = read_u32(&mut buf, "blob length")? as usize;
            if buf.remaining() < data_len {
                return Err(ValueError::Truncated("blob data"));
            }
            let data = Bytes::copy_from_slice(&buf[..data_len]);
            buf.advance(data_len);
            if blobs.insert(name.clone(), data).is_some() {
                return Err(ValueError::DuplicateName(name));
            }
        }

        if buf.remaining() < 8 {
            return Err(ValueError::Truncated("size"));
        }
        let size = buf.get_u64_le();

        let mut fields = Vec::with_capacity(5);
        for _ in 0..5 {
            let len = read_u32(&mut buf, "description")? as usize;
            fields.push(read_string(&mut buf, len, "description")?);
        }
        if buf.has_remaining() {
            return Err(ValueError::TrailingBytes(buf.remaining()));
        }
        let mut fields = fields.into_iter();
        let description = Description {
            machine_name: fields.next().unwrap_or_default(),
            creation_date: fields.next().unwrap_or_default(),
            comment: fields.next().unwrap_or_default(),
            adding_chain: fields.next().unwrap_or_default(),
            receiving_chain: fields.next().unwrap_or_default(),
        };

        let value = Self {
            blobs,
            size,
            fetched: true,
            description,
        };
        let actual = value.content_size();
        if actual != size {
            return Err(ValueError::SizeMismatch {
                declared: size,
                actual,
            });
        }
        Ok(value)
    }

    /// Write every blob into `folder`, creating it if needed.
    pub async fn export_to_folder(&self, folder: &Path) -> Result<Vec<PathBuf>, ValueError> {
        if !self.fetched {
            return Err(ValueError::NotFetched);
        }
        fs::create_dir_all(folder).await?;

        let mut written = Vec::with_capacity(self.blobs.len());
        for (name, data) in &self.blobs {
            let path = folder.join(checked_name(name)?);
            fs::write(&path, data).await?;
            written.push(path);
        }
        Ok(written)
    }

    /// Write the single blob of this value to `path`.
    pub async fn export_to_file(&self, path: &Path) -> Result<(), ValueError> {
        if !self.fetched {
            return Err(ValueError::NotFetched);
        }
        if self.blobs.len() != 1 {
            return Err(ValueError::NotSingleBlob(self.blobs.len()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Some(data) = self.blobs.values().next() {
            fs::write(path, data).await?;
        }
        Ok(())
    }
}

fn length_prefix<T: TryFrom<usize>>(len: usize, field: &'static str) -> Result<T, ValueError> {
    T::try_from(len).map_err(|_| ValueError::TooLong { field, len })
}

/// Blob names become file names on export; refuse anything path-like.
fn checked_name(name: &str) -> Result<&str, ValueError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ValueError::InvalidName(name.to_string()));
    }
    Ok(name)
}

fn read_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, ValueError> {
    if buf.remaining() < 1 {
        return Err(ValueError::Truncated(what));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut &[u8], what: &'static str) -> Result<u16, ValueError> {
    if buf.remaining() < 2 {
        return Err(ValueError::Truncated(what));
    }
    Ok(buf.get_u16_le())
}

fn read_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, ValueError> {
    if buf.remaining() < 4 {
        return Err(ValueError::Truncated(what));
    }
    Ok(buf.get_u32_le())
}

fn read_string(buf: &mut &[u8], len: usize, what: &'static str) -> Result<String, ValueError> {
    if buf.remaining() < len {
        return Err(ValueError::Truncated(what));
    }
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| ValueError::InvalidUtf8(what))?
        .to_string();
    buf.advance(len);
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_value() -> CacheValue {
        let mut value = CacheValue::new();
        value.add("texture.pvr", vec![7u8; 300]);
        value.add("texture.meta", b"format=etc2".to_vec());
        value.description_mut().machine_name = "builder-01".to_string();
        value.description_mut().comment = "sprites".to_string();
        value
    }

    #[test]
    fn test_size_tracks_blobs() {
        let mut value = CacheValue::new();
        value.add("a", vec![0u8; 10]);
        value.add("b", vec![0u8; 5]);
        assert_eq!(value.size(), 15);

        // Replacing a blob adjusts the aggregate.
        value.add("a", vec![0u8; 2]);
        assert_eq!(value.size(), 7);
        assert_eq!(value.blob_count(), 2);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let value = sample_value();
        let bytes = value.serialize().unwrap();
        let back = CacheValue::deserialize(&bytes).unwrap();
        assert_eq!(back, value);
        assert!(back.is_valid());
    }

    #[test]
    fn test_deserialize_rejects_truncated_and_trailing() {
        let bytes = sample_value().serialize().unwrap();
        assert!(matches!(
            CacheValue::deserialize(&bytes[..bytes.len() - 3]),
            Err(ValueError::Truncated(_))
        ));

        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(matches!(
            CacheValue::deserialize(&longer),
            Err(ValueError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_deserialize_rejects_size_mismatch() {
        let mut bytes = sample_value().serialize().unwrap().to_vec();
        // The declared size sits right after the last blob.
        let size_offset = 1 + 4 + (2 + 12 + 4 + 11) + (2 + 11 + 4 + 300);
        bytes[size_offset] ^= 0xff;
        assert!(matches!(
            CacheValue::deserialize(&bytes),
            Err(ValueError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_freed_value_keeps_size() {
        let mut value = sample_value();
        let size = value.size();
        value.free();
        assert!(!value.is_fetched());
        assert_eq!(value.size(), size);
        assert!(value.is_valid());
        assert!(matches!(value.serialize(), Err(ValueError::NotFetched)));
    }

    #[test]
    fn test_empty_value_is_invalid() {
        assert!(!CacheValue::new().is_valid());
    }

    #[test]
    fn test_provenance_chains() {
        let mut description = Description::default();
        description.append_adding_node("client");
        description.append_adding_node("cache-a");
        assert_eq!(description.adding_chain, "client/cache-a");

        description.append_receiving_node("cache-b");
        assert_eq!(description.receiving_chain, "cache-b");
    }

    #[tokio::test]
    async fn test_export_and_import_files() {
        let tmp = TempDir::new().unwrap();
        let value = sample_value();
        let written = value.export_to_folder(tmp.path()).await.unwrap();
        assert_eq!(written.len(), 2);

        let mut imported = CacheValue::new();
        for path in &written {
            imported.add_file(path).await.unwrap();
        }
        assert_eq!(imported.size(), value.size());
        assert_eq!(imported.blob("texture.meta"), value.blob("texture.meta"));
    }

    #[tokio::test]
    async fn test_export_rejects_path_like_names() {
        let tmp = TempDir::new().unwrap();
        let mut value = CacheValue::new();
        value.add("../escape", vec![1u8]);
        assert!(matches!(
            value.export_to_folder(tmp.path()).await,
            Err(ValueError::InvalidName(_))
        ));
    }

    #[test]
    fn test_serialize_rejects_oversized_name() {
        let mut value = CacheValue::new();
        value.add("n".repeat(70_000), vec![1u8; 4]);
        assert!(matches!(
            value.serialize(),
            Err(ValueError::TooLong { field: "blob name", len: 70_000 })
        ));

        // The largest name the prefix can hold still serializes.
        let mut value = CacheValue::new();
        value.add("n".repeat(usize::from(u16::MAX)), vec![1u8; 4]);
        let bytes = value.serialize().unwrap();
        assert_eq!(CacheValue::deserialize(&bytes).unwrap().blob_count(), 1);
    }

    #[tokio::test]
    async fn test_export_single_blob_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("texture.pvr");
        let mut value = CacheValue::new();
        value.add("texture.pvr", vec![7u8; 300]);

        value.export_to_file(&path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 300]);

        assert!(matches!(
            sample_value().export_to_file(&path).await,
            Err(ValueError::NotSingleBlob(2))
        ));
        value.free();
        assert!(matches!(
            value.export_to_file(&path).await,
            Err(ValueError::NotFetched)
        ));
    }
}

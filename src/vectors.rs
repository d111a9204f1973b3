//! Binary persistence for the similarity index.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - exhibit_id: u16 length + utf8 bytes
//! - domain: u16 length + utf8 bytes
//! - year: u16 (little-endian)
//! - archived_at: i64 (little-endian, unix seconds)
//! - embedding: [f32; dimensions] (little-endian)

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::index::{IndexEntry, SimilarityIndex};

const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Cap on stored string fields, matching the u16 length prefix.
const MAX_FIELD_LEN: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// SHA256 of the model name, stored in the header so an index built with
/// one model is never served by another.
pub fn model_id(model_name: &str) -> [u8; 32] {
    let digest = Sha256::digest(model_name.as_bytes());
    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    id
}

pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the similarity index from storage, validating version, model
    /// and dimensions against the running configuration.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<SimilarityIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = self.read_header(&mut reader)?;
        self.validate_header(&header, expected_model_id, expected_dimensions)?;

        let mut index = SimilarityIndex::new(header.dimensions as usize);
        for _ in 0..header.entry_count {
            let (id, entry) = self.read_entry(&mut reader, header.dimensions as usize)?;
            // skip entries the index rejects (e.g. zero norm)
            let _ = index.upsert(&id, entry);
        }

        Ok(index)
    }

    /// Save the similarity index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        index: &SimilarityIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &SimilarityIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: index.dimensions() as u16,
            entry_count: index.len() as u64,
        };
        self.write_header(&mut writer, &header)?;

        for (id, entry) in index.iter() {
            self.write_entry(&mut writer, id, entry)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(&self, reader: &mut BufReader<File>) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);

        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[35..43]);
        let entry_count = u64::from_le_bytes(count_bytes);

        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&header_bytes[43..47]);
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        // checksum covers the header fields before the checksum itself
        let computed_checksum = crc32fast::hash(&header_bytes[0..43]);
        if stored_checksum != computed_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(Header {
            version,
            model_id,
            dimensions,
            entry_count,
        })
    }

    fn validate_header(
        &self,
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }
        Ok(())
    }

    fn write_header(
        &self,
        writer: &mut BufWriter<File>,
        header: &Header,
    ) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_string(&self, reader: &mut BufReader<File>) -> Result<String, VectorStorageError> {
        let mut len_bytes = [0u8; 2];
        reader.read_exact(&mut len_bytes)?;
        let len = u16::from_le_bytes(len_bytes) as usize;

        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|_| VectorStorageError::InvalidFormat("non-utf8 string field".to_string()))
    }

    fn write_string(
        &self,
        writer: &mut BufWriter<File>,
        value: &str,
    ) -> Result<(), VectorStorageError> {
        if value.len() > MAX_FIELD_LEN {
            return Err(VectorStorageError::InvalidFormat(format!(
                "string field too long: {} bytes",
                value.len()
            )));
        }
        writer.write_all(&(value.len() as u16).to_le_bytes())?;
        writer.write_all(value.as_bytes())?;
        Ok(())
    }

    fn read_entry(
        &self,
        reader: &mut BufReader<File>,
        dimensions: usize,
    ) -> Result<(String, IndexEntry), VectorStorageError> {
        let id = self.read_string(reader)?;
        let domain = self.read_string(reader)?;

        let mut year_bytes = [0u8; 2];
        reader.read_exact(&mut year_bytes)?;
        let year = u16::from_le_bytes(year_bytes);

        let mut ts_bytes = [0u8; 8];
        reader.read_exact(&mut ts_bytes)?;
        let archived_at = i64::from_le_bytes(ts_bytes);

        let mut vector = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            vector.push(f32::from_le_bytes(float_bytes));
        }

        Ok((
            id,
            IndexEntry {
                vector,
                domain,
                year,
                archived_at,
            },
        ))
    }

    fn write_entry(
        &self,
        writer: &mut BufWriter<File>,
        id: &str,
        entry: &IndexEntry,
    ) -> Result<(), VectorStorageError> {
        self.write_string(writer, id)?;
        self.write_string(writer, &entry.domain)?;
        writer.write_all(&entry.year.to_le_bytes())?;
        writer.write_all(&entry.archived_at.to_le_bytes())?;

        for &value in &entry.vector {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> PathBuf {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "archivio-vectors-test-{}-{}.bin",
            std::process::id(),
            counter
        ))
    }

    fn entry(vector: Vec<f32>, domain: &str, year: u16, archived_at: i64) -> IndexEntry {
        IndexEntry {
            vector,
            domain: domain.to_string(),
            year,
            archived_at,
        }
    }

    #[test]
    fn test_model_id_is_stable() {
        assert_eq!(model_id("m"), model_id("m"));
        assert_ne!(model_id("m"), model_id("other"));
    }

    #[test]
    fn test_save_and_load_empty() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let mid = model_id("test-model");

        let index = SimilarityIndex::new(384);
        storage.save(&index, &mid).unwrap();
        assert!(storage.exists());
        assert_eq!(storage.path(), path.as_path());

        let loaded = storage.load(&mid, 384).unwrap();
        assert_eq!(loaded.len(), 0);
        assert_eq!(loaded.dimensions(), 384);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let mid = model_id("test-model");

        let mut index = SimilarityIndex::new(3);
        index
            .upsert("ex-1", entry(vec![1.0, 0.0, 0.0], "a.example", 2001, 10))
            .unwrap();
        index
            .upsert("ex-2", entry(vec![0.0, 1.0, 0.0], "b.example", 2005, 20))
            .unwrap();

        storage.save(&index, &mid).unwrap();

        let loaded = storage.load(&mid, 3).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains("ex-1"));
        assert!(loaded.contains("ex-2"));

        let (_, e) = loaded.iter().find(|(id, _)| *id == "ex-2").unwrap();
        assert_eq!(e.domain, "b.example");
        assert_eq!(e.year, 2005);
        assert_eq!(e.archived_at, 20);
        assert_eq!(e.vector, vec![0.0, 1.0, 0.0]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_model_mismatch() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());

        let index = SimilarityIndex::new(3);
        storage.save(&index, &model_id("model-a")).unwrap();

        let result = storage.load(&model_id("model-b"), 3);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_dimension_mismatch() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let mid = model_id("test-model");

        let index = SimilarityIndex::new(3);
        storage.save(&index, &mid).unwrap();

        let result = storage.load(&mid, 384);
        assert!(matches!(
            result,
            Err(VectorStorageError::DimensionMismatch { .. })
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let mid = model_id("test-model");

        let mut index = SimilarityIndex::new(3);
        index
            .upsert("ex-1", entry(vec![1.0, 0.0, 0.0], "a.example", 2001, 10))
            .unwrap();
        storage.save(&index, &mid).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&mid, 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let index = SimilarityIndex::new(3);
        let result = storage.save(&index, &model_id("m"));

        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_delete() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());

        let index = SimilarityIndex::new(3);
        storage.save(&index, &model_id("m")).unwrap();
        assert!(storage.exists());

        storage.delete().unwrap();
        assert!(!storage.exists());
    }
}

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use super::MetadataRecord;
use crate::metric_consts::METADATA_EXTRACTION_FAILED;

/// HDF5 superblock signature
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open container: {0}")]
    Open(#[from] std::io::Error),
    #[error("file is not an HDF5 container")]
    NotAContainer,
    #[error("HDF5 support is not compiled into this build")]
    Unsupported,
    #[error("failed to read attribute {name}: {message}")]
    Attribute { name: String, message: String },
    #[error("container error: {0}")]
    Container(String),
}

/// A top-level attribute value as stored in the container.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Array(Vec<AttributeValue>),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bytes(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            AttributeValue::Text(text) => write!(f, "{text}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::UInt(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Reads the root-level attributes of a structured container file.
pub trait ContainerReader: Send + Sync {
    fn root_attributes(&self, path: &Path) -> Result<Vec<(String, AttributeValue)>, ExtractError>;
}

/// Reader used when the crate is built without HDF5 support. It recognises
/// HDF5 files by their signature but cannot decode them.
pub struct SignatureProbe;

// The superblock may sit at 0, 512, 1024, 2048, ... when a user block is present
fn has_hdf5_signature(path: &Path) -> Result<bool, std::io::Error> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut offset = 0u64;
    let mut buf = [0u8; 8];

    while offset + 8 <= len {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        if buf == HDF5_SIGNATURE {
            return Ok(true);
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }
    Ok(false)
}

impl ContainerReader for SignatureProbe {
    fn root_attributes(&self, path: &Path) -> Result<Vec<(String, AttributeValue)>, ExtractError> {
        if has_hdf5_signature(path)? {
            Err(ExtractError::Unsupported)
        } else {
            Err(ExtractError::NotAContainer)
        }
    }
}

#[cfg(feature = "hdf5")]
pub fn default_reader() -> Arc<dyn ContainerReader> {
    Arc::new(super::hdf5_reader::Hdf5Reader)
}

#[cfg(not(feature = "hdf5"))]
pub fn default_reader() -> Arc<dyn ContainerReader> {
    Arc::new(SignatureProbe)
}

/// Turns a container file into a [`MetadataRecord`]. Never fails: anything
/// that goes wrong while reading yields the all-empty record.
#[derive(Clone)]
pub struct MetadataExtractor {
    reader: Arc<dyn ContainerReader>,
}

impl MetadataExtractor {
    pub fn new(reader: Arc<dyn ContainerReader>) -> Self {
        Self { reader }
    }

    pub fn extract(&self, path: &Path) -> MetadataRecord {
        match self.reader.root_attributes(path) {
            Ok(attributes) => MetadataRecord::from_pairs(
                attributes
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.to_string())),
            ),
            Err(e) => {
                metrics::counter!(METADATA_EXTRACTION_FAILED).increment(1);
                warn!(path = %path.display(), error = %e, "could not read container metadata, using empty record");
                MetadataRecord::default()
            }
        }
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new(default_reader())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataField;
    use std::io::Write;

    struct FixedReader(Vec<(String, AttributeValue)>);

    impl ContainerReader for FixedReader {
        fn root_attributes(
            &self,
            _path: &Path,
        ) -> Result<Vec<(String, AttributeValue)>, ExtractError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenReader;

    impl ContainerReader for BrokenReader {
        fn root_attributes(
            &self,
            _path: &Path,
        ) -> Result<Vec<(String, AttributeValue)>, ExtractError> {
            Err(ExtractError::Container("truncated object header".to_string()))
        }
    }

    #[test]
    fn test_decodes_bytes_and_stringifies_other_types() {
        let reader = FixedReader(vec![
            (
                "dataset_name".to_string(),
                AttributeValue::Bytes(b"helloworld".to_vec()),
            ),
            ("sub-ID".to_string(), AttributeValue::Text("sub-01".to_string())),
            ("pipeline".to_string(), AttributeValue::Int(23)),
            ("owner_name".to_string(), AttributeValue::Float(1.5)),
            ("github_url".to_string(), AttributeValue::Bool(true)),
        ]);
        let record = MetadataExtractor::new(Arc::new(reader)).extract(Path::new("x.h5"));

        assert_eq!(record.dataset_name, "helloworld");
        assert_eq!(record.subject_id, "sub-01");
        assert_eq!(record.preprocessing_pipeline, "23");
        assert_eq!(record.owner_name, "1.5");
        assert_eq!(record.github_url, "true");
        assert_eq!(record.publication_url, "");
    }

    #[test]
    fn test_no_attributes_gives_full_empty_record() {
        let record = MetadataExtractor::new(Arc::new(FixedReader(vec![])))
            .extract(Path::new("x.h5"));
        assert!(record.is_empty());
        assert_eq!(record.iter().count(), MetadataField::ALL.len());
    }

    #[test]
    fn test_read_failure_gives_full_empty_record() {
        let record = MetadataExtractor::new(Arc::new(BrokenReader)).extract(Path::new("x.h5"));
        assert_eq!(record, MetadataRecord::default());
    }

    #[test]
    fn test_missing_file_gives_full_empty_record() {
        let record = MetadataExtractor::new(Arc::new(SignatureProbe))
            .extract(Path::new("/definitely/not/here.h5"));
        assert_eq!(record, MetadataRecord::default());
    }

    #[test]
    fn test_signature_probe() {
        let mut hdf5 = tempfile::NamedTempFile::new().unwrap();
        hdf5.write_all(&HDF5_SIGNATURE).unwrap();
        hdf5.write_all(&[0u8; 64]).unwrap();
        assert!(matches!(
            SignatureProbe.root_attributes(hdf5.path()),
            Err(ExtractError::Unsupported)
        ));

        let mut with_user_block = tempfile::NamedTempFile::new().unwrap();
        with_user_block.write_all(&[0u8; 512]).unwrap();
        with_user_block.write_all(&HDF5_SIGNATURE).unwrap();
        assert!(matches!(
            SignatureProbe.root_attributes(with_user_block.path()),
            Err(ExtractError::Unsupported)
        ));

        let mut text = tempfile::NamedTempFile::new().unwrap();
        text.write_all(b"just some text, not a container").unwrap();
        assert!(matches!(
            SignatureProbe.root_attributes(text.path()),
            Err(ExtractError::NotAContainer)
        ));
    }

    #[test]
    fn test_array_display() {
        let value = AttributeValue::Array(vec![AttributeValue::Int(1), AttributeValue::Int(2)]);
        assert_eq!(value.to_string(), "[1, 2]");
    }
}

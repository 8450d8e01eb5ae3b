use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

pub mod extractor;
#[cfg(feature = "hdf5")]
pub mod hdf5_reader;

pub use extractor::{default_reader, AttributeValue, ContainerReader, ExtractError, MetadataExtractor};

/// The closed set of descriptive fields every stored dataset carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    DatasetName,
    SubjectId,
    PreprocessingPipeline,
    OwnerName,
    OwnerEmail,
    BetaPipeline,
    GithubUrl,
    PublicationUrl,
    FileSize,
    Crc32Hash,
}

impl MetadataField {
    pub const ALL: [MetadataField; 10] = [
        MetadataField::DatasetName,
        MetadataField::SubjectId,
        MetadataField::PreprocessingPipeline,
        MetadataField::OwnerName,
        MetadataField::OwnerEmail,
        MetadataField::BetaPipeline,
        MetadataField::GithubUrl,
        MetadataField::PublicationUrl,
        MetadataField::FileSize,
        MetadataField::Crc32Hash,
    ];

    /// Canonical persisted key. Lowercase because S3 lowercases user metadata keys.
    pub fn key(&self) -> &'static str {
        match self {
            MetadataField::DatasetName => "dataset_name",
            MetadataField::SubjectId => "subject_id",
            MetadataField::PreprocessingPipeline => "preprocessing_pipeline",
            MetadataField::OwnerName => "owner_name",
            MetadataField::OwnerEmail => "owner_email",
            MetadataField::BetaPipeline => "beta_pipeline",
            MetadataField::GithubUrl => "github_url",
            MetadataField::PublicationUrl => "publication_url",
            MetadataField::FileSize => "file_size",
            MetadataField::Crc32Hash => "crc32_hash",
        }
    }

    /// Resolve any known spelling of a field name.
    ///
    /// Names are compared case-insensitively with `_` and `-` ignored, so
    /// `subjectID`, `sub-ID`, `subject_id` and the form name `subjectName`
    /// all land on the same field.
    pub fn resolve(name: &str) -> Option<MetadataField> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let field = match normalized.as_str() {
            "datasetname" => MetadataField::DatasetName,
            "subjectid" | "subid" | "subjectname" => MetadataField::SubjectId,
            "preprocessingpipeline" | "pipeline" => MetadataField::PreprocessingPipeline,
            "ownername" => MetadataField::OwnerName,
            "owneremail" => MetadataField::OwnerEmail,
            "betapipeline" | "trialformat" => MetadataField::BetaPipeline,
            "githuburl" => MetadataField::GithubUrl,
            "publicationurl" => MetadataField::PublicationUrl,
            "filesize" => MetadataField::FileSize,
            "crc32hash" => MetadataField::Crc32Hash,
            _ => return None,
        };
        Some(field)
    }
}

/// One value per [`MetadataField`]; an empty string means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    pub dataset_name: String,
    pub subject_id: String,
    pub preprocessing_pipeline: String,
    pub owner_name: String,
    pub owner_email: String,
    pub beta_pipeline: String,
    pub github_url: String,
    pub publication_url: String,
    pub file_size: String,
    pub crc32_hash: String,
}

impl MetadataRecord {
    pub fn get(&self, field: MetadataField) -> &str {
        match field {
            MetadataField::DatasetName => &self.dataset_name,
            MetadataField::SubjectId => &self.subject_id,
            MetadataField::PreprocessingPipeline => &self.preprocessing_pipeline,
            MetadataField::OwnerName => &self.owner_name,
            MetadataField::OwnerEmail => &self.owner_email,
            MetadataField::BetaPipeline => &self.beta_pipeline,
            MetadataField::GithubUrl => &self.github_url,
            MetadataField::PublicationUrl => &self.publication_url,
            MetadataField::FileSize => &self.file_size,
            MetadataField::Crc32Hash => &self.crc32_hash,
        }
    }

    fn slot_mut(&mut self, field: MetadataField) -> &mut String {
        match field {
            MetadataField::DatasetName => &mut self.dataset_name,
            MetadataField::SubjectId => &mut self.subject_id,
            MetadataField::PreprocessingPipeline => &mut self.preprocessing_pipeline,
            MetadataField::OwnerName => &mut self.owner_name,
            MetadataField::OwnerEmail => &mut self.owner_email,
            MetadataField::BetaPipeline => &mut self.beta_pipeline,
            MetadataField::GithubUrl => &mut self.github_url,
            MetadataField::PublicationUrl => &mut self.publication_url,
            MetadataField::FileSize => &mut self.file_size,
            MetadataField::Crc32Hash => &mut self.crc32_hash,
        }
    }

    pub fn set(&mut self, field: MetadataField, value: impl Into<String>) {
        *self.slot_mut(field) = value.into();
    }

    /// Every field in canonical order, set or not
    pub fn iter(&self) -> impl Iterator<Item = (MetadataField, &str)> + '_ {
        MetadataField::ALL.iter().map(move |f| (*f, self.get(*f)))
    }

    /// Build a record from arbitrarily-named pairs, resolving aliases.
    ///
    /// A canonical spelling always beats an alias for the same field; among
    /// aliases the first non-empty value wins. Unknown names are dropped.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut record = MetadataRecord::default();
        let mut from_canonical = [false; MetadataField::ALL.len()];

        for (name, value) in pairs {
            let name = name.as_ref();
            let Some(field) = MetadataField::resolve(name) else {
                debug!(attribute = name, "ignoring attribute outside the metadata schema");
                continue;
            };
            let value = value.into().trim().to_string();
            if value.is_empty() {
                continue;
            }

            let index = field as usize;
            let canonical = name == field.key();
            let slot = record.slot_mut(field);
            if slot.is_empty() || (canonical && !from_canonical[index]) {
                *slot = value;
                from_canonical[index] = canonical;
            }
        }

        record
    }

    /// Build a record from stored object metadata or submitted form fields.
    /// Values in RFC 2047 `=?UTF-8?B?...?=` form are decoded.
    pub fn from_map(metadata: &HashMap<String, String>) -> Self {
        // HashMap order is arbitrary; sort so alias precedence is stable
        let mut pairs: Vec<_> = metadata.iter().collect();
        pairs.sort();
        Self::from_pairs(
            pairs
                .into_iter()
                .map(|(k, v)| (k.as_str(), decode_header_value(v))),
        )
    }

    /// Replace fields with the non-empty values of `other`
    pub fn overlay(&mut self, other: &MetadataRecord) {
        for (field, value) in other.iter() {
            if !value.is_empty() {
                self.set(field, value);
            }
        }
    }

    /// Object metadata to attach on upload; unset fields are not written.
    /// User metadata travels as HTTP headers, so values that are not
    /// printable ASCII are RFC 2047 encoded, the same form S3 returns them in.
    pub fn to_object_metadata(&self) -> HashMap<String, String> {
        self.iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(f, v)| (f.key().to_string(), encode_header_value(v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, v)| v.is_empty())
    }
}

const ENCODED_PREFIX: &str = "=?UTF-8?B?";
const ENCODED_SUFFIX: &str = "?=";

fn encode_header_value(value: &str) -> String {
    if value.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        return value.to_string();
    }
    format!(
        "{ENCODED_PREFIX}{}{ENCODED_SUFFIX}",
        general_purpose::STANDARD.encode(value)
    )
}

fn decode_header_value(value: &str) -> String {
    value
        .get(..ENCODED_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(ENCODED_PREFIX))
        .and_then(|_| value[ENCODED_PREFIX.len()..].strip_suffix(ENCODED_SUFFIX))
        .and_then(|encoded| general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| value.to_string())
}

impl Serialize for MetadataRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(MetadataField::ALL.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.key(), value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_both_schema_variants() {
        assert_eq!(
            MetadataField::resolve("subjectID"),
            Some(MetadataField::SubjectId)
        );
        assert_eq!(MetadataField::resolve("sub-ID"), Some(MetadataField::SubjectId));
        assert_eq!(
            MetadataField::resolve("pipeline"),
            Some(MetadataField::PreprocessingPipeline)
        );
        assert_eq!(
            MetadataField::resolve("trial_format"),
            Some(MetadataField::BetaPipeline)
        );
        assert_eq!(
            MetadataField::resolve("crc32-hash"),
            Some(MetadataField::Crc32Hash)
        );
        assert_eq!(
            MetadataField::resolve("publicationUrl"),
            Some(MetadataField::PublicationUrl)
        );
        assert_eq!(MetadataField::resolve("visual_angle"), None);
    }

    #[test]
    fn test_every_field_resolves_from_its_key() {
        for field in MetadataField::ALL {
            assert_eq!(MetadataField::resolve(field.key()), Some(field));
        }
    }

    #[test]
    fn test_from_pairs_drops_unknown_keys() {
        let record = MetadataRecord::from_pairs([
            ("dataset_name", "helloworld"),
            ("sub-ID", "sub-01"),
            ("visual_angle", "5"),
            ("age", "30"),
        ]);
        assert_eq!(record.dataset_name, "helloworld");
        assert_eq!(record.subject_id, "sub-01");
        assert_eq!(record.iter().count(), MetadataField::ALL.len());
    }

    #[test]
    fn test_canonical_key_beats_alias() {
        let record = MetadataRecord::from_pairs([
            ("pipeline", "fMRIPrep"),
            ("preprocessing_pipeline", "canonical"),
            ("trial_format", "betas"),
            ("beta-pipeline", "other"),
        ]);
        assert_eq!(record.preprocessing_pipeline, "canonical");
        // neither spelling is canonical, first one wins
        assert_eq!(record.beta_pipeline, "betas");
    }

    #[test]
    fn test_empty_values_do_not_shadow() {
        let record = MetadataRecord::from_pairs([("subjectID", ""), ("sub-ID", "sub-02")]);
        assert_eq!(record.subject_id, "sub-02");
    }

    #[test]
    fn test_object_metadata_round_trip_skips_empty() {
        let mut record = MetadataRecord::default();
        record.set(MetadataField::DatasetName, "hw");
        record.set(MetadataField::Crc32Hash, "deadbeef");

        let metadata = record.to_object_metadata();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["crc32_hash"], "deadbeef");

        assert_eq!(MetadataRecord::from_map(&metadata), record);
    }

    #[test]
    fn test_non_ascii_values_are_header_safe() {
        let mut record = MetadataRecord::default();
        record.set(MetadataField::OwnerName, "Jürgen Müller");
        record.set(MetadataField::DatasetName, "hello world");

        let metadata = record.to_object_metadata();
        assert_eq!(metadata["dataset_name"], "hello world");
        assert_eq!(metadata["owner_name"], "=?UTF-8?B?SsO8cmdlbiBNw7xsbGVy?=");
        assert!(metadata
            .values()
            .all(|v| v.chars().all(|c| c == ' ' || c.is_ascii_graphic())));

        assert_eq!(MetadataRecord::from_map(&metadata), record);
    }

    #[test]
    fn test_malformed_encoded_value_is_kept_as_is() {
        let stored = HashMap::from([
            ("owner_name".to_string(), "=?UTF-8?B?not base64!?=".to_string()),
            ("subject_id".to_string(), "=?utf-8?b?c3ViLTAx?=".to_string()),
        ]);
        let record = MetadataRecord::from_map(&stored);
        assert_eq!(record.owner_name, "=?UTF-8?B?not base64!?=");
        assert_eq!(record.subject_id, "sub-01");
    }

    #[test]
    fn test_reads_legacy_hyphenated_object_metadata() {
        let legacy = HashMap::from([
            ("dataset-name".to_string(), "hw".to_string()),
            ("subjectid".to_string(), "sub-01".to_string()),
            ("crc32-hash".to_string(), "0badf00d".to_string()),
        ]);
        let record = MetadataRecord::from_map(&legacy);
        assert_eq!(record.dataset_name, "hw");
        assert_eq!(record.subject_id, "sub-01");
        assert_eq!(record.crc32_hash, "0badf00d");
    }

    #[test]
    fn test_overlay_keeps_existing_when_other_is_empty() {
        let mut base = MetadataRecord::from_pairs([("owner_name", "John Smith")]);
        let form = MetadataRecord::from_pairs([("ownerEmail", "jsmith@email.com")]);
        base.overlay(&form);
        assert_eq!(base.owner_name, "John Smith");
        assert_eq!(base.owner_email, "jsmith@email.com");
    }

    #[test]
    fn test_serializes_every_key_in_order() {
        let record = MetadataRecord::from_pairs([("owner_name", "A")]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.starts_with(r#"{"dataset_name":"","subject_id":"","#));
        assert!(json.ends_with(r#""file_size":"","crc32_hash":""}"#));
        assert!(json.contains(r#""owner_name":"A""#));
    }
}

//! Duplicate detection by content digest.
//!
//! The index is rebuilt from a live catalog listing for every upload attempt
//! and thrown away afterwards. Nothing makes build, check and upload atomic:
//! two concurrent uploads of the same new content can both pass the check.
//! Because keys are content-addressed they then race to the same key and the
//! last writer's metadata wins, so the store still ends up with one object.
//! Treat the index as eventually consistent, good enough to stop people
//! re-uploading a file by accident.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    catalog::{Catalog, CatalogEntry},
    error::IngestError,
};

#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    by_digest: HashMap<String, String>,
}

impl DedupIndex {
    /// Snapshot the store's digests. Listing failures surface as errors so a
    /// broken store is never mistaken for one with no duplicates.
    pub async fn build(catalog: &Catalog) -> Result<Self, IngestError> {
        let entries = catalog.list().await?;
        let index = Self::from_entries(&entries);
        debug!(
            bucket = catalog.bucket(),
            objects = entries.len(),
            digests = index.len(),
            "built dedup index"
        );
        Ok(index)
    }

    pub fn from_entries(entries: &[CatalogEntry]) -> Self {
        let mut by_digest = HashMap::new();
        for entry in entries {
            let digest = entry.metadata.crc32_hash.trim().to_ascii_lowercase();
            if digest.is_empty() {
                continue;
            }
            // Keep the first key seen for a digest
            by_digest.entry(digest).or_insert_with(|| entry.key.clone());
        }
        Self { by_digest }
    }

    /// Key of an object already holding content with this digest.
    ///
    /// Digests stored under a different configured width still match when
    /// one is a prefix of the other, since both are prefixes of the same crc32.
    pub fn find(&self, digest: &str) -> Option<&str> {
        let digest = digest.to_ascii_lowercase();
        if let Some(key) = self.by_digest.get(&digest) {
            return Some(key);
        }

        self.by_digest
            .iter()
            .filter(|(stored, _)| stored.len() != digest.len())
            .filter(|(stored, _)| stored.starts_with(&digest) || digest.starts_with(stored.as_str()))
            .map(|(_, key)| key.as_str())
            .min()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.find(digest).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataRecord;
    use common_s3::{MockS3Client, S3Error, S3Op};
    use std::sync::Arc;

    fn entry(key: &str, digest: &str) -> CatalogEntry {
        CatalogEntry {
            key: key.to_string(),
            metadata: MetadataRecord::from_pairs([("crc32_hash", digest)]),
            last_modified: None,
            size_bytes: 0,
            size: "0 Bytes".to_string(),
        }
    }

    #[test]
    fn test_find_exact_digest() {
        let index = DedupIndex::from_entries(&[
            entry("a_deadbeef.h5", "deadbeef"),
            entry("b_0badf00d.h5", "0BADF00D"),
            entry("c.h5", ""),
        ]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.find("deadbeef"), Some("a_deadbeef.h5"));
        assert_eq!(index.find("0badf00d"), Some("b_0badf00d.h5"));
        assert!(!index.contains("12345678"));
    }

    #[test]
    fn test_first_key_wins_for_repeated_digest() {
        let index = DedupIndex::from_entries(&[
            entry("a_deadbeef.h5", "deadbeef"),
            entry("z_deadbeef.h5", "deadbeef"),
        ]);
        assert_eq!(index.find("deadbeef"), Some("a_deadbeef.h5"));
    }

    #[test]
    fn test_matches_across_digest_widths() {
        let index = DedupIndex::from_entries(&[entry("a_deadbeef.h5", "deadbeef")]);
        assert_eq!(index.find("dead"), Some("a_deadbeef.h5"));
        assert!(!index.contains("beef"));

        let short = DedupIndex::from_entries(&[entry("a_dead.h5", "dead")]);
        assert_eq!(short.find("deadbeef"), Some("a_dead.h5"));
    }

    #[tokio::test]
    async fn test_build_surfaces_list_failure() {
        let client = MockS3Client::new().with_bucket("datasets").fail_on(
            S3Op::ListObjects,
            S3Error::Transport {
                reason: "connection_error".to_string(),
                message: "connection refused".to_string(),
            },
        );
        let catalog = Catalog::new(
            Arc::new(client),
            "datasets".to_string(),
            vec!["h5".to_string()],
        );

        match DedupIndex::build(&catalog).await {
            Err(IngestError::StoreUnreachable { code, .. }) => {
                assert_eq!(code, "connection_error")
            }
            other => panic!("expected StoreUnreachable, got {other:?}"),
        }
    }
}

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::error::IngestError;

/// Hex characters in a full crc32
pub const NATIVE_WIDTH: usize = 8;
pub const MIN_WIDTH: usize = 4;

/// How many hex characters of the crc32 are kept.
///
/// Anything below [`NATIVE_WIDTH`] discards digest bits: at 4 characters
/// only 65536 distinct digests exist and unrelated files collide after a
/// few hundred uploads. The digest only guards against accidental
/// re-uploads, it is not a content identity guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DigestWidth(usize);

impl DigestWidth {
    pub fn new(width: usize) -> Result<Self, IngestError> {
        if (MIN_WIDTH..=NATIVE_WIDTH).contains(&width) {
            Ok(Self(width))
        } else {
            Err(IngestError::Config(format!(
                "content hash length must be between {MIN_WIDTH} and {NATIVE_WIDTH}, got {width}"
            )))
        }
    }

    pub fn get(&self) -> usize {
        self.0
    }

    pub fn is_truncated(&self) -> bool {
        self.0 < NATIVE_WIDTH
    }

    /// Size of the digest space at this width
    pub fn distinct_values(&self) -> u64 {
        1u64 << (4 * self.0)
    }
}

impl Default for DigestWidth {
    fn default() -> Self {
        Self(NATIVE_WIDTH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    crc: u32,
    width: DigestWidth,
}

impl ContentDigest {
    pub fn crc32(&self) -> u32 {
        self.crc
    }

    pub fn width(&self) -> DigestWidth {
        self.width
    }

    /// Lowercase hex, truncated to the configured width
    pub fn as_hex(&self) -> String {
        let mut hex = format!("{:08x}", self.crc);
        hex.truncate(self.width.get());
        hex
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Streaming crc32 over a file's bytes. The block size only bounds memory use,
/// the digest is the same for any block size.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    block_size: usize,
    width: DigestWidth,
}

impl ContentHasher {
    pub fn new(block_size: usize, width: DigestWidth) -> Self {
        Self {
            block_size: block_size.max(1),
            width,
        }
    }

    pub fn width(&self) -> DigestWidth {
        self.width
    }

    pub fn hash_reader<R: Read>(&self, mut reader: R) -> std::io::Result<ContentDigest> {
        let mut hasher = crc32fast::Hasher::new();
        let mut block = vec![0u8; self.block_size];

        loop {
            match reader.read(&mut block) {
                Ok(0) => break,
                Ok(n) => hasher.update(&block[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(self.digest(hasher.finalize()))
    }

    pub fn hash_bytes(&self, bytes: &[u8]) -> ContentDigest {
        self.digest(crc32fast::hash(bytes))
    }

    pub fn hash_file(&self, path: &Path) -> std::io::Result<ContentDigest> {
        self.hash_reader(File::open(path)?)
    }

    /// Hash a file on the blocking pool, so large files don't stall the runtime
    pub async fn hash_path(&self, path: PathBuf) -> Result<ContentDigest, IngestError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash_file(&path))
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))?
            .map_err(IngestError::from)
    }

    fn digest(&self, crc: u32) -> ContentDigest {
        ContentDigest {
            crc,
            width: self.width,
        }
    }
}

//! Content digests for transferred payloads.
//!
//! [`Hasher`] is fed one chunk at a time while a transfer runs and finalized
//! once it completes. `hash_file` streams in 64 KiB blocks and never loads the
//! whole file into memory.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Md5,
}

impl DigestAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Md5 => 16,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unknown digest algorithm: {other}")),
        }
    }
}

/// Incremental hasher: `update` per chunk, `finalize_hex` on completion.
pub enum Hasher {
    Sha256(Sha256),
    Md5(md5::Context),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Md5 => Self::Md5(md5::Context::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Md5(_) => DigestAlgorithm::Md5,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Md5(ctx) => ctx.consume(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Md5(ctx) => ctx.compute().0.to_vec(),
        }
    }

    /// Finish and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

/// Digest of a byte slice. Returns lowercase hex.
pub fn digest(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Digest of an entire file, streamed. Returns lowercase hex.
pub async fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digests() {
        assert_eq!(
            digest(DigestAlgorithm::Sha256, b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest(DigestAlgorithm::Md5, b""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            digest(DigestAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            digest(DigestAlgorithm::Md5, b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_chunked_matches_whole() {
        let payload = b"* 1 FETCH (BODY[] {11}\r\nhello world)\r\n";
        for algorithm in [DigestAlgorithm::Sha256, DigestAlgorithm::Md5] {
            let mut hasher = Hasher::new(algorithm);
            for chunk in payload.chunks(7) {
                hasher.update(chunk);
            }
            let chunked = hasher.finalize();
            assert_eq!(chunked.len(), algorithm.output_len());
            assert_eq!(hex::encode(chunked), digest(algorithm, payload));
        }
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("SHA-256".parse::<DigestAlgorithm>(), Ok(DigestAlgorithm::Sha256));
        assert_eq!("md5".parse::<DigestAlgorithm>(), Ok(DigestAlgorithm::Md5));
        assert!("crc32".parse::<DigestAlgorithm>().is_err());
    }

    #[tokio::test]
    async fn test_hash_file_streams() {
        let path = std::env::temp_dir().join(format!("mailxfer-hash-{}", uuid::Uuid::new_v4()));
        let data = vec![0x5au8; BUF_SIZE * 2 + 17];
        tokio::fs::write(&path, &data).await.unwrap();
        let hashed = hash_file(&path, DigestAlgorithm::Sha256).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(hashed, digest(DigestAlgorithm::Sha256, &data));
    }
}

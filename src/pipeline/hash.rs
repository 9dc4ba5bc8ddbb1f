//! Hash Calculation Module
//!
//! Per-file checksums computed while the file streams into the archive.
//! Supported algorithms: SHA256, BLAKE3, XxHash3.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    #[default]
    None,
    Sha256,
    Blake3,
    Xxh3,
}

enum Hasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
    Xxh3(Box<xxhash_rust::xxh3::Xxh3>),
}

/// Block-wise checksum calculator; feed it with `propagate` in stream order.
pub struct CheckSumBlockwiseCalculator {
    hasher: Hasher,
    bytes_processed: u64,
}

impl CheckSumBlockwiseCalculator {
    pub fn new(checksum: ChecksumType) -> Option<Self> {
        use sha2::Digest;

        let hasher = match checksum {
            ChecksumType::None => return None,
            ChecksumType::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumType::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            ChecksumType::Xxh3 => Hasher::Xxh3(Box::new(xxhash_rust::xxh3::Xxh3::new())),
        };
        Some(Self {
            hasher,
            bytes_processed: 0,
        })
    }

    /// Process data block
    pub fn propagate(&mut self, data: &[u8]) {
        use sha2::Digest;

        match &mut self.hasher {
            Hasher::Sha256(h) => Digest::update(h, data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
            Hasher::Xxh3(h) => h.update(data),
        }
        self.bytes_processed += data.len() as u64;
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Digest as `<algorithm>:<uppercase hex>`.
    pub fn value(&self) -> String {
        use sha2::Digest;

        match &self.hasher {
            Hasher::Sha256(h) => format!("sha256:{}", hex::encode_upper(h.clone().finalize())),
            Hasher::Blake3(h) => format!("blake3:{}", hex::encode_upper(h.finalize().as_bytes())),
            Hasher::Xxh3(h) => format!("xxh3:{:016X}", h.digest()),
        }
    }

    /// Algorithm recorded in a stored checksum string.
    pub fn type_of(stored: &str) -> ChecksumType {
        match stored.split_once(':').map(|(alg, _)| alg) {
            Some("sha256") => ChecksumType::Sha256,
            Some("blake3") => ChecksumType::Blake3,
            Some("xxh3") => ChecksumType::Xxh3,
            _ => ChecksumType::None,
        }
    }
}

/// Reads exactly `expected` bytes from `inner`, hashing them on the way.
///
/// Running out early is an `UnexpectedEof` error: the archive header already
/// promised `expected` bytes, so a short file cannot be papered over.
pub struct HashingReader<R> {
    inner: R,
    expected: u64,
    read: u64,
    checksum: Option<CheckSumBlockwiseCalculator>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, expected: u64, checksum: ChecksumType) -> Self {
        Self {
            inner,
            expected,
            read: 0,
            checksum: CheckSumBlockwiseCalculator::new(checksum),
        }
    }

    pub fn checksum(&self) -> Option<String> {
        self.checksum.as_ref().map(|c| c.value())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.expected - self.read;
        if remaining == 0 {
            return Ok(0);
        }
        let limit = buf.len().min(remaining.min(usize::MAX as u64) as usize);

        let n = self.inner.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while reading: {} of {} bytes", self.read, self.expected),
            ));
        }
        if let Some(c) = self.checksum.as_mut() {
            c.propagate(&buf[..n]);
        }
        self.read += n as u64;
        Ok(n)
    }
}

//! Whole-file digests, computed independently of fragment boundaries.

use std::{
    fmt,
    fs::File,
    io::{
        Read,
        Write,
    },
    path::Path,
    str::FromStr,
};

use anyhow::Context;
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use sha2::{
    Digest,
    Sha256,
};

use crate::error::PipelineError;

pub type Sha256HashValue = [u8; 32];

/// SHA-256 over the complete contents of a file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDigest(Sha256HashValue);

impl FileDigest {
    pub const fn from_bytes(value: Sha256HashValue) -> FileDigest {
        FileDigest(value)
    }

    pub fn as_bytes(&self) -> &Sha256HashValue {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against the digest of the reassembled data.
    pub fn ensure_matches(&self, found: &FileDigest) -> Result<(), PipelineError> {
        if self == found {
            Ok(())
        } else {
            Err(PipelineError::IntegrityMismatch {
                expected: self.to_hex(),
                found: found.to_hex(),
            })
        }
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileDigest({})", self.to_hex())
    }
}

impl FromStr for FileDigest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<FileDigest> {
        let mut value = [0u8; 32];
        hex::decode_to_slice(s, &mut value)
            .context("Invalid SHA256 hash value")?;
        Ok(FileDigest(value))
    }
}

impl Serialize for FileDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FileDigest, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming SHA-256 context.  Implements `Write` so that `io::copy()` can feed it.
pub struct Checksum {
    context: Sha256,
    n_bytes: u64,
}

impl Checksum {
    pub fn new() -> Checksum {
        Checksum { context: Sha256::new(), n_bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.update(data);
        self.n_bytes += data.len() as u64;
    }

    /// number of bytes hashed so far
    pub fn len(&self) -> u64 {
        self.n_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.n_bytes == 0
    }

    pub fn finalize(self) -> FileDigest {
        FileDigest(self.context.finalize().into())
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Checksum {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn digest_bytes(data: &[u8]) -> FileDigest {
    let mut checksum = Checksum::new();
    checksum.update(data);
    checksum.finalize()
}

pub fn digest_reader<R: Read>(reader: &mut R) -> std::io::Result<FileDigest> {
    let mut checksum = Checksum::new();
    std::io::copy(reader, &mut checksum)?;
    Ok(checksum.finalize())
}

pub fn digest_file(path: &Path) -> std::io::Result<FileDigest> {
    digest_reader(&mut File::open(path)?)
}

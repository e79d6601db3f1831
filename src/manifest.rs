//! The record of which content id holds which fragment.  Without it a file can't be restored, so
//! it gets written out before any download is attempted.

use std::{
    fmt,
    fs::File,
    io::{
        BufReader,
        BufWriter,
        Write,
    },
    path::Path,
};

use anyhow::{
    Context,
    Result,
};
use serde::{
    Deserialize,
    Serialize,
};
use tempfile::NamedTempFile;

use crate::{
    checksum::FileDigest,
    error::PipelineError,
    store::ContentId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub content_id: ContentId,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    /// file name of the source, for the operator's benefit
    pub source: String,
    pub source_size: u64,
    pub fragment_size: usize,
    pub fragment_count: usize,
    pub digest: FileDigest,
    pub entries: Vec<ManifestEntry>,
}

impl TransferManifest {
    pub fn new(
        source: impl Into<String>, source_size: u64, fragment_size: usize, fragment_count: usize,
        digest: FileDigest,
    ) -> TransferManifest {
        TransferManifest {
            source: source.into(),
            source_size,
            fragment_size,
            fragment_count,
            digest,
            entries: vec![],
        }
    }

    pub fn push(&mut self, index: usize, content_id: ContentId, size: usize) {
        self.entries.push(ManifestEntry { index, content_id, size });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.ensure_complete().is_ok()
    }

    /// Every fragment 0..fragment_count must be listed exactly once, in order.
    pub fn ensure_complete(&self) -> Result<(), PipelineError> {
        let found = self.entries.iter()
            .enumerate()
            .take_while(|(expected, entry)| entry.index == *expected)
            .count();

        if found == self.fragment_count && self.entries.len() == self.fragment_count {
            Ok(())
        } else {
            Err(PipelineError::ManifestIncomplete { expected: self.fragment_count, found })
        }
    }

    pub fn load(path: &Path) -> Result<TransferManifest> {
        let file = File::open(path)
            .with_context(|| format!("Opening manifest {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing manifest {:?}", path))
    }

    /// Writes the manifest via a temporary file in the same directory, so a crash never leaves a
    /// truncated manifest behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Creating temporary manifest in {:?}", dir))?;

        let mut writer = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        let tmp = writer.into_inner().map_err(|err| err.into_error())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("Writing manifest {:?}", path))?;
        Ok(())
    }
}

impl fmt::Display for TransferManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "source {} ({} bytes, sha256 {})", self.source, self.source_size, self.digest)?;
        for entry in &self.entries {
            writeln!(f, "fragment {:02} root: {}", entry.index, entry.content_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::digest_bytes;

    fn manifest(count: usize) -> TransferManifest {
        TransferManifest::new("big.iso", 1000, 400, count, digest_bytes(b"big"))
    }

    #[test]
    fn test_completeness() {
        let mut m = manifest(3);
        assert!(matches!(m.ensure_complete(), Err(PipelineError::ManifestIncomplete { expected: 3, found: 0 })));

        m.push(0, ContentId::root(&[0; 32]), 400);
        m.push(1, ContentId::root(&[1; 32]), 400);
        assert!(matches!(m.ensure_complete(), Err(PipelineError::ManifestIncomplete { expected: 3, found: 2 })));

        m.push(2, ContentId::root(&[2; 32]), 200);
        assert!(m.is_complete());
    }

    #[test]
    fn test_out_of_order() {
        let mut m = manifest(2);
        m.push(1, ContentId::root(&[1; 32]), 400);
        m.push(0, ContentId::root(&[0; 32]), 400);
        assert!(!m.is_complete());
    }

    #[test]
    fn test_empty_is_complete() {
        assert!(manifest(0).is_complete());
    }

    #[test]
    fn test_save_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.iso.manifest.json");

        let mut m = manifest(1);
        m.push(0, ContentId::root(&[9; 32]), 400);
        m.save(&path)?;
        assert_eq!(TransferManifest::load(&path)?, m);

        // nothing else left behind in the directory
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_listing() {
        let mut m = manifest(1);
        m.push(0, ContentId::new("abc"), 400);
        let listing = m.to_string();
        assert!(listing.contains("fragment 00 root: abc"));
    }
}

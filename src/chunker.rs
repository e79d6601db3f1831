//! Fixed-size splitting of a byte stream into fragments, and the reverse.

use std::{
    fs::File,
    io::{
        BufWriter,
        Read,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::{
    Result,
    bail,
};

use crate::{
    error::PipelineError,
    util::read_fill,
};

/// One contiguous piece of the source.  Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: usize,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A fragment that was spooled to disk by [`Chunker::split_to_dir`].
#[derive(Debug, Clone)]
pub struct FragmentFile {
    pub index: usize,
    pub path: PathBuf,
    pub len: usize,
}

pub fn fragment_file_name(index: usize) -> String {
    format!("fragment_{:03}.dat", index)
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    fragment_size: usize,
}

impl Chunker {
    pub fn new(fragment_size: usize) -> Result<Chunker, PipelineError> {
        if fragment_size == 0 {
            return Err(PipelineError::InvalidFragmentSize);
        }
        Ok(Chunker { fragment_size })
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// ceil(len / fragment_size)
    pub fn fragment_count(&self, len: u64) -> u64 {
        len.div_ceil(self.fragment_size as u64)
    }

    pub fn split<R: Read>(&self, reader: R) -> Fragments<R> {
        Fragments { reader, fragment_size: self.fragment_size, next_index: 0, done: false }
    }

    /// Splits the stream into files named fragment_NNN.dat inside `dir`.  The reader is consumed:
    /// once this returns, the source can be closed.
    pub fn split_to_dir<R: Read>(&self, reader: R, dir: &Path) -> std::io::Result<Vec<FragmentFile>> {
        let mut files = vec![];

        for fragment in self.split(reader) {
            files.push(spool_fragment(&fragment?, dir)?);
        }

        Ok(files)
    }
}

/// Writes one fragment to `dir/fragment_NNN.dat`.
pub fn spool_fragment(fragment: &Fragment, dir: &Path) -> std::io::Result<FragmentFile> {
    let path = dir.join(fragment_file_name(fragment.index));
    let mut out = BufWriter::new(File::create(&path)?);
    out.write_all(&fragment.data)?;
    out.flush()?;
    Ok(FragmentFile { index: fragment.index, path, len: fragment.len() })
}

/// Iterator returned by [`Chunker::split`].  Stops for good after the end of input or the first
/// read error.
pub struct Fragments<R> {
    reader: R,
    fragment_size: usize,
    next_index: usize,
    done: bool,
}

impl<R: Read> Iterator for Fragments<R> {
    type Item = std::io::Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut data = vec![0u8; self.fragment_size];
        match read_fill(&mut self.reader, &mut data) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                if n < self.fragment_size {
                    // short fill means we hit EOF
                    data.truncate(n);
                    self.done = true;
                }
                let index = self.next_index;
                self.next_index += 1;
                Some(Ok(Fragment { index, data }))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for Fragments<R> {}

/// Concatenates fragments back into one stream.  They must arrive in index order.
pub fn merge<W: Write, I: IntoIterator<Item = Fragment>>(fragments: I, output: &mut W) -> Result<u64> {
    let mut written = 0;

    for (expected, fragment) in fragments.into_iter().enumerate() {
        if fragment.index != expected {
            bail!("Expected fragment {} but found fragment {}", expected, fragment.index);
        }
        output.write_all(&fragment.data)?;
        written += fragment.len() as u64;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn lengths(chunker: &Chunker, data: &[u8]) -> Vec<usize> {
        chunker.split(data)
            .map(|f| f.unwrap().len())
            .collect()
    }

    #[test]
    fn test_uneven() {
        let chunker = Chunker::new(400).unwrap();
        assert_eq!(lengths(&chunker, &source(1000)), [400, 400, 200]);
        assert_eq!(chunker.fragment_count(1000), 3);
    }

    #[test]
    fn test_exact_boundary() {
        let chunker = Chunker::new(400).unwrap();
        assert_eq!(lengths(&chunker, &source(400)), [400]);
        assert_eq!(lengths(&chunker, &source(800)), [400, 400]);
        assert_eq!(chunker.fragment_count(800), 2);
    }

    #[test]
    fn test_empty() {
        let chunker = Chunker::new(400).unwrap();
        assert!(lengths(&chunker, &[]).is_empty());
        assert_eq!(chunker.fragment_count(0), 0);
    }

    #[test]
    fn test_zero_size() {
        assert!(matches!(Chunker::new(0), Err(PipelineError::InvalidFragmentSize)));
    }

    #[test]
    fn test_indices() {
        let chunker = Chunker::new(3).unwrap();
        let indices: Vec<_> = chunker.split(&source(10)[..]).map(|f| f.unwrap().index).collect();
        assert_eq!(indices, [0, 1, 2, 3]);
    }

    struct FailAfter {
        remaining: usize,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Err(std::io::Error::other("disk on fire"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xaa);
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_error() {
        let chunker = Chunker::new(10).unwrap();
        let mut fragments = chunker.split(FailAfter { remaining: 25 });

        assert_eq!(fragments.next().unwrap().unwrap().len(), 10);
        assert_eq!(fragments.next().unwrap().unwrap().len(), 10);
        // the partially filled third fragment is not emitted
        assert!(fragments.next().unwrap().is_err());
        assert!(fragments.next().is_none());
    }

    #[test]
    fn test_split_to_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = source(1000);
        let files = Chunker::new(400)?.split_to_dir(data.as_slice(), dir.path())?;

        assert_eq!(files.len(), 3);
        assert_eq!(files[2].path, dir.path().join("fragment_002.dat"));
        let mut joined = vec![];
        for file in &files {
            let contents = std::fs::read(&file.path)?;
            assert_eq!(contents.len(), file.len);
            joined.extend(contents);
        }
        assert_eq!(joined, data);
        Ok(())
    }

    #[test]
    fn test_merge() -> anyhow::Result<()> {
        let data = source(1000);
        let fragments: Vec<_> = Chunker::new(400)?.split(data.as_slice()).collect::<Result<_, _>>()?;

        let mut out = vec![];
        assert_eq!(merge(fragments.clone(), &mut out)?, 1000);
        assert_eq!(out, data);

        let mut reordered = fragments;
        reordered.swap(0, 1);
        assert!(merge(reordered, &mut vec![]).is_err());
        Ok(())
    }
}

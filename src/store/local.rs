use std::{
    fs::File,
    io::{
        ErrorKind,
        Read,
        Write,
    },
    os::fd::OwnedFd,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::{
    Context,
    Result,
    bail,
};
use rustix::{
    fs::{
        Access,
        AtFlags,
        FlockOperation,
        Mode,
        OFlags,
        accessat,
        flock,
        mkdirat,
        open,
    },
    io::Errno,
};
use sha2::{
    Digest,
    Sha256,
};
use tempfile::NamedTempFile;

use crate::checksum::Sha256HashValue;

use super::{
    ContentId,
    ObjectStore,
};

/// A content-addressed object store in a local directory.  Objects live at
/// `objects/xx/yyyy...` where xxyyyy... is the hex SHA-256 of their content.
///
/// The directory is held under a shared flock() for as long as the store is open.
pub struct LocalStore {
    root: OwnedFd,
    path: PathBuf,
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        // closing the fd drops the lock anyway
        let _ = flock(&self.root, FlockOperation::Unlock);
    }
}

fn object_path(hash: &Sha256HashValue) -> PathBuf {
    PathBuf::from(format!("objects/{:02x}/{}", hash[0], hex::encode(&hash[1..])))
}

impl LocalStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<LocalStore> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Creating store directory {:?}", path))?;

        // O_PATH isn't enough because flock()
        let root = open(&path, OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC, Mode::empty())
            .with_context(|| format!("Opening store directory {:?}", path))?;
        flock(&root, FlockOperation::LockShared)?;
        Ok(LocalStore { root, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        if let Some(parent) = dir.as_ref().parent() {
            if parent != Path::new("") {
                self.ensure_dir(parent)?;
            }
        }

        match mkdirat(&self.root, dir.as_ref(), Mode::from_raw_mode(0o777)) {
            Ok(()) | Err(Errno::EXIST) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        match id.to_hash() {
            Ok(hash) => accessat(&self.root, object_path(&hash), Access::READ_OK, AtFlags::empty()).is_ok(),
            Err(_) => false,
        }
    }

    pub fn ensure_object(&self, data: &[u8]) -> Result<ContentId> {
        let hash: Sha256HashValue = Sha256::digest(data).into();
        let id = ContentId::root(&hash);
        let file = object_path(&hash);

        if accessat(&self.root, &file, Access::READ_OK, AtFlags::empty()).is_ok() {
            return Ok(id);
        }

        let dir = file.parent().unwrap_or(Path::new("objects"));
        self.ensure_dir(dir)?;

        let mut tmp = NamedTempFile::new_in(self.path.join(dir))?;
        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;

        if let Err(err) = tmp.persist_noclobber(self.path.join(&file)) {
            // someone else stored the same content first: same bytes, same name
            if err.error.kind() != ErrorKind::AlreadyExists {
                return Err(err.error.into());
            }
        }

        Ok(id)
    }

    pub fn open_object(&self, id: &ContentId) -> Result<Vec<u8>> {
        let hash = id.to_hash()?;
        let path = self.path.join(object_path(&hash));
        let mut data = vec![];
        File::open(&path)
            .with_context(|| format!("Opening object {}", id))?
            .read_to_end(&mut data)?;

        let measured: Sha256HashValue = Sha256::digest(&data).into();
        if measured != hash {
            bail!("Object {} is corrupt (content hashes to {})", id, hex::encode(measured));
        }
        Ok(data)
    }
}

impl ObjectStore for LocalStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId> {
        self.ensure_object(data)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.open_object(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalStore::open_path(dir.path().join("store"))?;

        let id = store.ensure_object(b"hello fragment")?;
        assert!(store.contains(&id));
        assert_eq!(store.open_object(&id)?, b"hello fragment");

        // same bytes, same id, no error
        assert_eq!(store.ensure_object(b"hello fragment")?, id);

        let hash = id.to_hash()?;
        let on_disk = dir.path().join("store").join(object_path(&hash));
        assert!(on_disk.starts_with(dir.path().join("store/objects")));
        assert!(on_disk.is_file());
        Ok(())
    }

    #[test]
    fn test_corrupt_object() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalStore::open_path(dir.path())?;

        let id = store.ensure_object(b"original")?;
        std::fs::write(dir.path().join(object_path(&id.to_hash()?)), b"tampered")?;
        assert!(store.open_object(&id).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_object() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalStore::open_path(dir.path())?;
        let id = ContentId::root(&[7u8; 32]);
        assert!(!store.contains(&id));
        assert!(store.open_object(&id).is_err());
        Ok(())
    }
}

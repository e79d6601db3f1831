//! Drives one transfer: split, upload, record, then download, reassemble and verify.
//!
//! ```text
//! Init -> Splitting -> Uploading -> Uploaded -> Downloading -> Merging -> Verified
//!                                                                     \-> Failed (from anywhere)
//! ```
//!
//! All temporary files belong to the pipeline and are scoped to the call that made them, so they
//! are gone once the call returns, whether it succeeded or failed.  If the future is dropped they
//! go as soon as any file work still running on the blocking pool notices.
//!
//! Reading, hashing and spooling the source run on tokio's blocking pool; the async side only
//! waits on them, so a stalled source can't hold up timers or other tasks.

use std::{
    fs::File,
    future::Future,
    io::{
        BufReader,
        Seek,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use indicatif::{
    ProgressBar,
    ProgressStyle,
};
use tempfile::TempDir;
use tokio::io::{
    AsyncWriteExt,
    BufWriter,
};
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    checksum::{
        Checksum,
        FileDigest,
        digest_reader,
    },
    chunker::{
        Chunker,
        FragmentFile,
        spool_fragment,
    },
    config::Config,
    error::{
        PipelineError,
        TransferError,
    },
    manifest::TransferManifest,
    store::ObjectStore,
    util::restored_path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Splitting,
    Uploading,
    Uploaded,
    Downloading,
    Merging,
    Verified,
    Failed,
}

/// What a successful [`Pipeline::run`] produced.
#[derive(Debug)]
pub struct RunReport {
    pub manifest: TransferManifest,
    pub output: PathBuf,
    pub digest: FileDigest,
}

pub struct Pipeline<S> {
    store: S,
    config: Config,
    chunker: Chunker,
    state: PipelineState,
    manifest: Option<TransferManifest>,
}

impl<S: ObjectStore> Pipeline<S> {
    pub fn new(store: S, config: Config) -> Result<Pipeline<S>, PipelineError> {
        config.validate()?;
        let chunker = Chunker::new(config.fragment_size)?;
        Ok(Pipeline { store, config, chunker, state: PipelineState::Init, manifest: None })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The manifest recorded by the last upload.  After a failed upload this holds the fragments
    /// that did make it.
    pub fn manifest(&self) -> Option<&TransferManifest> {
        self.manifest.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn enter(&mut self, state: PipelineState) {
        info!(from = ?self.state, to = ?state, "pipeline state");
        self.state = state;
    }

    fn fail<T>(&mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(err) = &result {
            warn!(error = %err, "pipeline failed");
            self.enter(PipelineState::Failed);
        }
        result
    }

    /// Split, upload and verify `source`, then restore it to `<source>.restored`.
    pub async fn run(&mut self, source: &Path) -> Result<RunReport, PipelineError> {
        let manifest = self.upload(source).await?;
        let output = restored_path(source);
        let digest = self.restore(&manifest, &output).await?;
        Ok(RunReport { manifest, output, digest })
    }

    /// Uploads every fragment of `source` and returns the completed manifest.  If a manifest path
    /// is configured, the manifest is on disk before this returns.
    pub async fn upload(&mut self, source: &Path) -> Result<TransferManifest, PipelineError> {
        let result = self.try_upload(source).await;
        self.fail(result)
    }

    /// Fetches every fragment listed in `manifest`, reassembles them into `output` and checks the
    /// result against the manifest's digest.  `output` only appears if the check passes.
    pub async fn restore(
        &mut self, manifest: &TransferManifest, output: &Path,
    ) -> Result<FileDigest, PipelineError> {
        let result = self.try_restore(manifest, output).await;
        self.fail(result)
    }

    async fn try_upload(&mut self, source: &Path) -> Result<TransferManifest, PipelineError> {
        self.enter(PipelineState::Splitting);
        let spool = Arc::new(self.spool_dir()?);
        let (fragments, digest) = {
            let chunker = self.chunker;
            let path = source.to_path_buf();
            let spool = spool.clone();
            blocking(move || split_source(chunker, &path, &spool))
                .await
                .map_err(|err| PipelineError::SourceRead { path: source.to_path_buf(), source: err })??
        };
        info!(source = ?source, %digest, "source digest");

        let source_size = fragments.iter().map(|f| f.len as u64).sum();
        let name = source.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        info!(fragments = fragments.len(), bytes = source_size, "source split");
        self.manifest = Some(TransferManifest::new(
            name, source_size, self.chunker.fragment_size(), fragments.len(), digest,
        ));

        self.enter(PipelineState::Uploading);
        self.upload_fragments(&fragments).await?;
        drop(spool);

        let Some(manifest) = self.manifest.clone() else {
            return Err(PipelineError::ManifestIncomplete { expected: fragments.len(), found: 0 });
        };
        manifest.ensure_complete()?;

        if let Some(path) = &self.config.manifest_path {
            manifest.save(path)
                .map_err(|source| PipelineError::Manifest { path: path.clone(), source })?;
            info!(path = ?path, "manifest written");
        }
        self.enter(PipelineState::Uploaded);
        Ok(manifest)
    }

    async fn upload_fragments(&mut self, fragments: &[FragmentFile]) -> Result<(), PipelineError> {
        let bar = self.progress_bar(fragments.len() as u64, "uploading");

        for fragment in fragments {
            let data = tokio::fs::read(&fragment.path).await
                .map_err(|source| PipelineError::SourceRead { path: fragment.path.clone(), source })?;

            debug!(index = fragment.index, bytes = data.len(), "uploading fragment");
            let id = self.transfer(fragment.index, || self.store.put(&data)).await?;
            info!(index = fragment.index, root = %id, "fragment uploaded");

            if let Some(manifest) = self.manifest.as_mut() {
                manifest.push(fragment.index, id, data.len());
            }
            // no reason to keep it around any longer
            let _ = tokio::fs::remove_file(&fragment.path).await;
            bar.inc(1);
        }

        bar.finish_and_clear();
        Ok(())
    }

    async fn try_restore(
        &mut self, manifest: &TransferManifest, output: &Path,
    ) -> Result<FileDigest, PipelineError> {
        let output_error = |source| PipelineError::Output { path: output.to_path_buf(), source };

        manifest.ensure_complete()?;

        self.enter(PipelineState::Downloading);
        let dir = match output.parent() {
            Some(parent) if parent != Path::new("") => parent,
            _ => Path::new("."),
        };
        let partial = tempfile::Builder::new()
            .prefix(".splitxfer-")
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(output_error)?;

        let bar = self.progress_bar(manifest.len() as u64, "downloading");
        {
            let file = partial.as_file().try_clone().map_err(output_error)?;
            let mut writer = BufWriter::new(tokio::fs::File::from_std(file));
            for entry in &manifest.entries {
                debug!(index = entry.index, root = %entry.content_id, "downloading fragment");
                let data = self.transfer(entry.index, || self.store.get(&entry.content_id)).await?;
                if data.len() != entry.size {
                    warn!(index = entry.index, expected = entry.size, found = data.len(), "fragment size differs");
                }
                writer.write_all(&data).await.map_err(output_error)?;
                bar.inc(1);
            }
            writer.flush().await.map_err(output_error)?;
        }
        bar.finish_and_clear();

        self.enter(PipelineState::Merging);
        let found = {
            let mut file = partial.as_file().try_clone().map_err(output_error)?;
            blocking(move || {
                file.sync_all()?;
                file.rewind()?;
                digest_reader(&mut BufReader::new(file))
            }).await.and_then(|result| result).map_err(output_error)?
        };
        info!(expected = %manifest.digest, %found, "restored digest");
        // on mismatch `partial` is dropped here, which deletes it
        manifest.digest.ensure_matches(&found)?;

        partial.persist(output).map_err(|err| output_error(err.error))?;
        self.enter(PipelineState::Verified);
        Ok(found)
    }

    /// Runs `op` under the configured timeout, retrying with exponential backoff if more than one
    /// attempt is allowed.
    async fn transfer<T, F, Fut>(&self, index: usize, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 1;

        loop {
            let err = match tokio::time::timeout(self.config.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => TransferError::Store(err),
                Err(_) => TransferError::Timeout(self.config.timeout),
            };

            if attempt >= self.config.attempts {
                return Err(PipelineError::Transfer { index, source: err });
            }
            warn!(index, attempt, error = %err, "fragment transfer failed, retrying in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
            attempt += 1;
        }
    }

    fn spool_dir(&self) -> Result<TempDir, PipelineError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("splitxfer-");
        let result = match &self.config.workdir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        };
        result.map_err(|source| PipelineError::Output {
            path: self.config.workdir.clone().unwrap_or_else(std::env::temp_dir),
            source,
        })
    }

    fn progress_bar(&self, len: u64, message: &'static str) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template("{msg:>11} [{bar:40}] {pos}/{len} fragments ({elapsed})") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(message);
        bar
    }
}

/// Runs `f` on the blocking pool.  A panic in `f` resumes on the caller.
async fn blocking<T, F>(f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(std::io::Error::other(err)),
    }
}

/// Splits `source` into fragment files under `spool` and hashes it in the same pass, so the
/// digest always describes exactly the bytes that were spooled.
///
/// Stops early once the caller has let go of `spool`, which happens when the upload future is
/// dropped; the directory is removed when this returns.
fn split_source(
    chunker: Chunker, source: &Path, spool: &Arc<TempDir>,
) -> Result<(Vec<FragmentFile>, FileDigest), PipelineError> {
    let read_error = |err| PipelineError::SourceRead { path: source.to_path_buf(), source: err };

    let file = File::open(source).map_err(read_error)?;
    let mut checksum = Checksum::new();
    let mut fragments = vec![];
    for fragment in chunker.split(BufReader::new(file)) {
        if Arc::strong_count(spool) == 1 {
            debug!(source = ?source, "split abandoned");
            return Err(PipelineError::Interrupted);
        }
        let fragment = fragment.map_err(read_error)?;
        checksum.update(&fragment.data);
        let spooled = spool_fragment(&fragment, spool.path())
            .map_err(|err| PipelineError::Output { path: spool.path().to_path_buf(), source: err })?;
        fragments.push(spooled);
    }
    Ok((fragments, checksum.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_states() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("src.bin");
        std::fs::write(&source, vec![5u8; 1000])?;

        let config = Config { fragment_size: 400, workdir: Some(dir.path().to_path_buf()), ..Default::default() };
        let mut pipeline = Pipeline::new(MemoryStore::new(), config)?;
        assert_eq!(pipeline.state(), PipelineState::Init);

        let manifest = pipeline.upload(&source).await?;
        assert_eq!(pipeline.state(), PipelineState::Uploaded);
        // identical fragments are stored once
        assert_eq!(manifest.len(), 3);
        assert_eq!(pipeline.store().len(), 2);

        pipeline.restore(&manifest, &dir.path().join("out.bin")).await?;
        assert_eq!(pipeline.state(), PipelineState::Verified);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pipeline = Pipeline::new(MemoryStore::new(), Config::default())?;
        match pipeline.upload(&dir.path().join("nope")).await {
            Err(PipelineError::SourceRead { .. }) => {}
            o => panic!("Unexpected {o:?}"),
        }
        assert_eq!(pipeline.state(), PipelineState::Failed);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_config() {
        let config = Config { fragment_size: 0, ..Default::default() };
        assert!(Pipeline::new(MemoryStore::new(), config).is_err());
    }
}

use std::{
    fmt,
    io::Write,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use anyhow::{
    Context,
    Result,
    bail,
};
use tempfile::{
    NamedTempFile,
    TempDir,
};
use tokio::process::Command;
use tracing::debug;

use crate::DEFAULT_FRAGMENT_SIZE;

use super::{
    ContentId,
    ObjectStore,
};

/// How to reach the storage network through its command-line client.
#[derive(Clone)]
pub struct ClientOptions {
    pub program: PathBuf,
    pub rpc_url: String,
    pub indexer_url: String,
    /// Private key for upload transactions.
    ///
    /// The client only accepts it as `--key <key>`, so while an upload runs the key is visible in
    /// the process table (`ps`, `/proc/<pid>/cmdline`) to other users on the same host.  Run on a
    /// machine you don't share, or with `/proc` mounted `hidepid=2`.  Downloads never pass it.
    pub key: String,
    pub fragment_size: usize,
    pub expected_replica: u32,
    pub skip_tx: bool,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            program: PathBuf::from("0g-storage-client"),
            rpc_url: "https://rpc.0g.ai".into(),
            indexer_url: "https://indexer.0g.ai".into(),
            key: String::new(),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            expected_replica: 1,
            skip_tx: false,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

// the key must never end up in a log line
impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("program", &self.program)
            .field("rpc_url", &self.rpc_url)
            .field("indexer_url", &self.indexer_url)
            .field("key", &"<redacted>")
            .field("fragment_size", &self.fragment_size)
            .field("expected_replica", &self.expected_replica)
            .field("skip_tx", &self.skip_tx)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Runs the external storage client once per fragment.
///
/// The client is expected to print the root of the uploaded data as the last non-empty line on
/// stdout.  That line is parsed strictly; log chatter before it is ignored, and anything that
/// doesn't look like a root fails the upload instead of being guessed at.
pub struct CommandStore {
    options: ClientOptions,
    scratch: TempDir,
}

impl CommandStore {
    pub fn new(options: ClientOptions) -> Result<CommandStore> {
        if options.key.is_empty() {
            bail!("The storage client needs a private key");
        }
        let scratch = tempfile::Builder::new()
            .prefix("splitxfer-client-")
            .tempdir()
            .context("Creating scratch directory for the storage client")?;
        Ok(CommandStore { options, scratch })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn timeout_arg(&self) -> String {
        format!("{}s", self.options.timeout.as_secs().max(1))
    }

    fn upload_args(&self, file: &std::path::Path) -> Vec<String> {
        vec![
            "upload".into(),
            "--url".into(), self.options.rpc_url.clone(),
            "--key".into(), self.options.key.clone(),
            "--file".into(), file.display().to_string(),
            "--indexer".into(), self.options.indexer_url.clone(),
            "--fragment-size".into(), self.options.fragment_size.to_string(),
            "--expected-replica".into(), self.options.expected_replica.to_string(),
            // a bool flag: a separate "false" would be taken as a positional argument
            format!("--skip-tx={}", self.options.skip_tx),
            "--timeout".into(), self.timeout_arg(),
        ]
    }

    fn download_args(&self, id: &ContentId, output: &std::path::Path) -> Vec<String> {
        vec![
            "download".into(),
            "--url".into(), self.options.rpc_url.clone(),
            "--indexer".into(), self.options.indexer_url.clone(),
            "--root".into(), id.to_string(),
            "--output".into(), output.display().to_string(),
            "--timeout".into(), self.timeout_arg(),
        ]
    }

    async fn execute(&self, args: Vec<String>) -> Result<String> {
        debug!(program = ?self.options.program, subcommand = %args[0], "running storage client");

        let output = Command::new(&self.options.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Running {:?}", self.options.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            bail!("{} {} exited with {}: {}", self.options.program.display(), args[0], output.status, last);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The root is the last non-empty line of the client's stdout.
pub fn parse_upload_output(stdout: &str) -> Result<ContentId> {
    let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
        bail!("Storage client printed no root");
    };
    ContentId::parse_root(line)
        .context("Storage client did not report a root on its last line")
}

impl ObjectStore for CommandStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId> {
        let mut file = NamedTempFile::new_in(self.scratch.path())?;
        file.write_all(data)?;
        file.flush()?;

        let stdout = self.execute(self.upload_args(file.path())).await?;
        parse_upload_output(&stdout)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        // the client wants to create the output itself
        let output = self.scratch.path().join(format!("download-{}.dat", id.as_str().trim_start_matches("0x")));
        let _ = tokio::fs::remove_file(&output).await;

        let result = self.execute(self.download_args(id, &output)).await;
        let data = match result {
            Ok(_) => tokio::fs::read(&output).await
                .with_context(|| format!("Reading downloaded root {}", id)),
            Err(err) => Err(err),
        };
        let _ = tokio::fs::remove_file(&output).await;
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "0x093756e4ea9683329106d4a16982682ed182c14bf076463a9e7f97305cbac743";

    #[test]
    fn test_parse_upload_output() -> Result<()> {
        let stdout = format!("uploading segments\nfile uploaded\n{ROOT}\n\n");
        assert_eq!(parse_upload_output(&stdout)?.as_str(), ROOT);
        Ok(())
    }

    #[test]
    fn test_parse_upload_output_rejects_noise() {
        assert!(parse_upload_output("").is_err());
        // a root followed by more chatter is not accepted either
        assert!(parse_upload_output(&format!("{ROOT}\ndone")).is_err());
        assert!(parse_upload_output(&"f".repeat(66)).is_err());
    }

    #[test]
    fn test_key_redacted() {
        let options = ClientOptions { key: "deadbeef".into(), ..Default::default() };
        let debug = format!("{options:?}");
        assert!(!debug.contains("deadbeef"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_requires_key() {
        assert!(CommandStore::new(ClientOptions::default()).is_err());
    }

    #[test]
    fn test_upload_args() -> Result<()> {
        let store = CommandStore::new(ClientOptions {
            key: "k".into(),
            fragment_size: 1024,
            timeout: Duration::from_secs(90),
            ..Default::default()
        })?;
        let args = store.upload_args(std::path::Path::new("/tmp/frag"));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[0], "upload");
        assert_eq!(args[pos("--file") + 1], "/tmp/frag");
        assert_eq!(args[pos("--fragment-size") + 1], "1024");
        assert_eq!(args[pos("--timeout") + 1], "90s");
        assert!(args.contains(&"--skip-tx=false".to_string()));
        assert!(!args.iter().any(|a| a == "false"));

        let store = CommandStore::new(ClientOptions { key: "k".into(), skip_tx: true, ..Default::default() })?;
        let args = store.upload_args(std::path::Path::new("/tmp/frag"));
        assert!(args.contains(&"--skip-tx=true".to_string()));
        Ok(())
    }

    #[test]
    fn test_key_only_on_upload() -> Result<()> {
        let store = CommandStore::new(ClientOptions { key: "secretkey".into(), ..Default::default() })?;
        let upload = store.upload_args(std::path::Path::new("/tmp/frag"));
        assert_eq!(upload.iter().filter(|a| a.contains("secretkey")).count(), 1);
        let pos = upload.iter().position(|a| a == "--key").unwrap();
        assert_eq!(upload[pos + 1], "secretkey");

        let download = store.download_args(&ContentId::parse_root(ROOT)?, std::path::Path::new("/tmp/out"));
        assert!(!download.iter().any(|a| a.contains("secretkey")));
        Ok(())
    }
}

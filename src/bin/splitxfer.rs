use std::{
    ffi::OsStr,
    path::{
        Path,
        PathBuf,
    },
    process::ExitCode,
    time::Duration,
};

use anyhow::{
    Context,
    Result,
};
use clap::{
    Args,
    Parser,
    Subcommand,
};
use tracing_subscriber::EnvFilter;

use splitxfer::{
    DEFAULT_FRAGMENT_SIZE,
    checksum::digest_file,
    config::Config,
    manifest::TransferManifest,
    pipeline::Pipeline,
    store::{
        ClientOptions,
        CommandStore,
        LocalStore,
        ObjectStore,
    },
    util::restored_path,
};

/// splitxfer
#[derive(Debug, Parser)]
#[clap(name = "splitxfer", version)]
pub struct App {
    /// Use a local directory as the object store instead of the storage network
    #[clap(long, global = true)]
    store: Option<PathBuf>,

    #[clap(flatten)]
    client: ClientArgs,

    /// Fragment size in bytes
    #[clap(long, global = true, default_value_t = DEFAULT_FRAGMENT_SIZE)]
    fragment_size: usize,

    /// Timeout for each fragment transfer, in seconds
    #[clap(long, global = true, default_value_t = 30 * 60)]
    timeout: u64,

    /// Extra attempts per fragment after a failed transfer
    #[clap(long, global = true, default_value_t = 0)]
    retries: u32,

    /// Directory for temporary fragment files
    #[clap(long, global = true)]
    workdir: Option<PathBuf>,

    /// Don't draw progress bars
    #[clap(long, global = true)]
    no_progress: bool,

    /// Log debug output
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Storage client executable
    #[clap(long, global = true, default_value = "0g-storage-client")]
    client: PathBuf,
    /// Chain RPC URL
    #[clap(long, global = true, default_value = "https://rpc.0g.ai")]
    rpc: String,
    /// Storage indexer URL
    #[clap(long, global = true, default_value = "https://indexer.0g.ai")]
    indexer: String,
    /// Private key for upload transactions (without 0x)
    #[clap(long, global = true, env = "SPLITXFER_KEY", hide_env_values = true)]
    key: Option<String>,
    #[clap(long, global = true, default_value_t = 1)]
    expected_replica: u32,
    /// Don't submit a transaction for each upload
    #[clap(long, global = true)]
    skip_tx: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[clap(flatten)]
    Transfer(TransferCommand),
    /// Print the SHA-256 digest of a file
    Digest {
        file: PathBuf,
    },
}

/// The commands that need an object store.
#[derive(Debug, Subcommand)]
enum TransferCommand {
    /// Split, upload, download again and verify a file
    Run {
        file: PathBuf,
        /// Also write the manifest here
        #[clap(long)]
        manifest: Option<PathBuf>,
    },
    /// Split and upload a file, writing its manifest
    Upload {
        file: PathBuf,
        /// defaults to <file>.manifest.json
        #[clap(long)]
        manifest: Option<PathBuf>,
    },
    /// Download the fragments listed in a manifest and verify the result
    Restore {
        manifest: PathBuf,
        /// defaults to <source>.restored next to the manifest
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

fn manifest_path_for(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".manifest.json");
    PathBuf::from(name)
}

/// Where `restore` puts its output by default: `<source>.restored` next to the manifest.  Only
/// the last component of the recorded source name is used, so a manifest can't point the output
/// anywhere else.
fn default_restore_path(manifest: &Path, source: &str) -> PathBuf {
    let name = Path::new(source).file_name()
        .unwrap_or_else(|| OsStr::new("output"));
    restored_path(&manifest.with_file_name(name))
}

impl App {
    fn config(&self, manifest_path: Option<PathBuf>) -> Config {
        Config {
            fragment_size: self.fragment_size,
            timeout: Duration::from_secs(self.timeout),
            attempts: self.retries.saturating_add(1),
            workdir: self.workdir.clone(),
            manifest_path,
            progress: !self.no_progress,
            ..Config::default()
        }
    }

    fn client_options(&self) -> Result<ClientOptions> {
        let key = self.client.key.clone()
            .context("--key (or SPLITXFER_KEY) is required unless --store is given")?;
        Ok(ClientOptions {
            program: self.client.client.clone(),
            rpc_url: self.client.rpc.clone(),
            indexer_url: self.client.indexer.clone(),
            key,
            fragment_size: self.fragment_size,
            expected_replica: self.client.expected_replica,
            skip_tx: self.client.skip_tx,
            timeout: Duration::from_secs(self.timeout),
        })
    }
}

async fn execute<S: ObjectStore>(app: &App, cmd: &TransferCommand, store: S) -> Result<()> {
    match cmd {
        TransferCommand::Run { file, manifest } => {
            let mut pipeline = Pipeline::new(store, app.config(manifest.clone()))?;
            let report = match pipeline.run(file).await {
                Ok(report) => report,
                Err(err) => {
                    if let Some(partial) = pipeline.manifest() {
                        print!("{}", partial);
                    }
                    return Err(err.into());
                }
            };
            print!("{}", report.manifest);
            println!("restored {} (sha256 {})", report.output.display(), report.digest);
            println!("integrity verified");
        },
        TransferCommand::Upload { file, manifest } => {
            let path = manifest.clone().unwrap_or_else(|| manifest_path_for(file));
            let mut pipeline = Pipeline::new(store, app.config(Some(path.clone())))?;
            match pipeline.upload(file).await {
                Ok(manifest) => {
                    print!("{}", manifest);
                    println!("manifest written to {}", path.display());
                }
                Err(err) => {
                    if let Some(partial) = pipeline.manifest() {
                        print!("{}", partial);
                    }
                    return Err(err.into());
                }
            }
        },
        TransferCommand::Restore { manifest, output } => {
            let loaded = TransferManifest::load(manifest)?;
            let output = match output {
                Some(output) => output.clone(),
                None => default_restore_path(manifest, &loaded.source),
            };
            let mut pipeline = Pipeline::new(store, app.config(None))?;
            let digest = pipeline.restore(&loaded, &output).await?;
            println!("restored {} (sha256 {})", output.display(), digest);
            println!("integrity verified");
        },
    }
    Ok(())
}

fn print_digest(file: &Path) -> Result<()> {
    let digest = digest_file(file)
        .with_context(|| format!("Reading {:?}", file))?;
    println!("{}  {}", digest, file.display());
    Ok(())
}

async fn dispatch(app: &App) -> Result<()> {
    match (&app.cmd, &app.store) {
        (Command::Digest { file }, _) => print_digest(file),
        (Command::Transfer(cmd), Some(path)) => execute(app, cmd, LocalStore::open_path(path)?).await,
        (Command::Transfer(cmd), None) => execute(app, cmd, CommandStore::new(app.client_options()?)?).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let app = App::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if app.verbose { "debug" } else { "info" }))
        )
        .with_writer(std::io::stderr)
        .init();

    // dropping the pipeline future on ^C releases its temporary files
    let result = tokio::select! {
        result = dispatch(&app) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

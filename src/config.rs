use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{env, str::FromStr, time::Duration};

use crate::{errors::ArchiveError, services::retry::RetryConfig};

/// Names of the object attributes the archiver reads and writes.
#[derive(Debug, Clone, Serialize)]
pub struct AttributeKeys {
    /// Height of a block object.
    pub block: String,
    /// Index id (`start / index_size`) of an index-file object.
    pub index: String,
    pub index_size: String,
    /// Height of a state-snapshot object.
    pub state: String,
    pub state_root: String,
    pub state_sync_interval: String,
    pub hash: String,
    pub prev_hash: String,
    pub primary: String,
    pub timestamp: String,
}

impl Default for AttributeKeys {
    fn default() -> Self {
        Self {
            block: "Block".into(),
            index: "Index".into(),
            index_size: "IndexSize".into(),
            state: "State".into(),
            state_root: "StateRoot".into(),
            state_sync_interval: "StateSyncInterval".into(),
            hash: "Hash".into(),
            prev_hash: "PrevHash".into(),
            primary: "Primary".into(),
            timestamp: "Timestamp".into(),
        }
    }
}

/// How the upload workflow finds where to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResumePolicy {
    /// Walk index files forward from 0 until one is absent.
    IndexCount,
    /// Probe height batches backward from the chain tip.
    BatchSearch,
}

impl FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index-count" => Ok(Self::IndexCount),
            "batch-search" => Ok(Self::BatchSearch),
            other => Err(format!(
                "unknown resume policy `{other}` (expected index-count or batch-search)"
            )),
        }
    }
}

/// Settings shared by the upload, audit and state-export pipelines.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveConfig {
    pub container: String,
    pub owner: String,
    pub keys: AttributeKeys,
    /// Heights per upload batch; the unit of resumability.
    pub batch_size: u32,
    /// Heights per index file.
    pub index_size: u32,
    /// Height distance between state snapshots.
    pub sync_interval: u32,
    pub upload_workers: usize,
    pub search_workers: usize,
    pub delete_workers: usize,
    pub retry_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub resume_policy: ResumePolicy,
    /// Skip the homomorphic checksum even where the container allows it.
    pub disable_homomorphic: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            container: String::new(),
            owner: String::new(),
            keys: AttributeKeys::default(),
            batch_size: 128,
            index_size: 128_000,
            sync_interval: 40_000,
            upload_workers: 20,
            search_workers: 20,
            delete_workers: 10,
            retry_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(20),
            resume_policy: ResumePolicy::BatchSearch,
            disable_homomorphic: false,
        }
    }
}

impl ArchiveConfig {
    /// Reject configurations no pipeline can run with.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        let invalid = |msg: &str| Err(ArchiveError::Config(msg.to_string()));
        if self.container.is_empty() {
            return invalid("container id must be set");
        }
        if self.batch_size == 0 || self.index_size == 0 || self.sync_interval == 0 {
            return invalid("batch size, index size and sync interval must be positive");
        }
        if self.index_size % self.batch_size != 0 {
            return invalid("index size must be a multiple of batch size");
        }
        if self.upload_workers == 0 || self.search_workers == 0 || self.delete_workers == 0 {
            return invalid("worker counts must be positive");
        }
        if self.retry_attempts == 0 {
            return invalid("retry attempts must be positive");
        }
        if !(self.backoff_multiplier >= 1.0) {
            return invalid("backoff multiplier must be at least 1");
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_backoff: self.initial_backoff,
            multiplier: self.backoff_multiplier,
            max_backoff: self.max_backoff,
        }
    }
}

/// Storage location of the bundled local object store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub storage_dir: String,
    pub database_url: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Archive chain blocks and state into an object store")]
pub struct Cli {
    /// Directory where object payloads are stored (overrides ARCHIVER_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides ARCHIVER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload blocks and build index files, resuming where the store ends.
    Upload(ChainArgs),
    /// Reconcile block objects against index files, removing duplicates.
    Audit {
        #[command(flatten)]
        chain: ChainArgs,
        /// Report would-be deletions without deleting anything.
        #[arg(long)]
        dry_run: bool,
        /// First index id to audit.
        #[arg(long, default_value_t = 0)]
        from_index: u32,
        /// Index id to stop before (default: every complete run on the chain).
        #[arg(long)]
        to_index: Option<u32>,
    },
    /// Export state snapshots for every missing sync interval.
    ///
    /// Needs a ledger that keeps full state. Chain dumps do not, so against
    /// `--chain-dump` this always fails with "ledger does not retain full state".
    UploadState(ChainArgs),
    /// Create a container in the local store.
    CreateContainer {
        #[arg(long)]
        container: String,
        #[arg(long, default_value = "archiver")]
        owner: String,
        /// Network magic recorded on the container.
        #[arg(long)]
        magic: u32,
        #[arg(long)]
        disable_homomorphic: bool,
    },
    /// Serve health and archive status over HTTP.
    Serve {
        /// Host to bind to (overrides ARCHIVER_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to (overrides ARCHIVER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run migrations and exit.
    Migrate,
}

/// Options shared by the pipelines that read the chain.
#[derive(clap::Args, Debug, Clone)]
pub struct ChainArgs {
    /// Chain dump to archive from (overrides ARCHIVER_CHAIN_DUMP)
    #[arg(long)]
    pub chain_dump: Option<String>,
    /// Network magic of the chain (overrides ARCHIVER_MAGIC)
    #[arg(long)]
    pub magic: Option<u32>,
    /// Container id (overrides ARCHIVER_CONTAINER)
    #[arg(long)]
    pub container: Option<String>,
    #[arg(long, default_value = "archiver")]
    pub owner: String,
    #[arg(long, default_value = "Block")]
    pub block_attribute: String,
    #[arg(long, default_value = "Index")]
    pub index_attribute: String,
    #[arg(long, default_value = "State")]
    pub state_attribute: String,
    #[arg(long)]
    pub batch_size: Option<u32>,
    #[arg(long)]
    pub index_size: Option<u32>,
    #[arg(long)]
    pub sync_interval: Option<u32>,
    #[arg(long)]
    pub upload_workers: Option<usize>,
    #[arg(long)]
    pub search_workers: Option<usize>,
    #[arg(long)]
    pub delete_workers: Option<usize>,
    #[arg(long)]
    pub retries: Option<u32>,
    /// Initial retry backoff in milliseconds
    #[arg(long)]
    pub initial_backoff_ms: Option<u64>,
    #[arg(long)]
    pub backoff_multiplier: Option<f64>,
    /// Retry backoff ceiling in milliseconds
    #[arg(long)]
    pub max_backoff_ms: Option<u64>,
    /// index-count or batch-search
    #[arg(long)]
    pub resume_policy: Option<ResumePolicy>,
    #[arg(long)]
    pub disable_homomorphic: bool,
}

/// Parse `ARCHIVER_{name}` if set.
fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let var = format!("ARCHIVER_{}", name);
    match env::var(&var) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

impl StoreConfig {
    pub fn from_env_and_args(cli: &Cli) -> Result<Self> {
        let env_storage: Option<String> = env_value("STORAGE_DIR")?;
        let env_db: Option<String> = env_value("DATABASE_URL")?;
        Ok(Self {
            storage_dir: cli
                .storage_dir
                .clone()
                .or(env_storage)
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: cli
                .database_url
                .clone()
                .or(env_db)
                .unwrap_or_else(|| "sqlite://./data/meta/archive.db".into()),
        })
    }
}

impl ChainArgs {
    /// Chain dump path and network magic.
    pub fn chain_source(&self) -> Result<(String, u32)> {
        let dump = match self.chain_dump.clone() {
            Some(dump) => dump,
            None => env_value("CHAIN_DUMP")?.context("--chain-dump or ARCHIVER_CHAIN_DUMP is required")?,
        };
        let magic = match self.magic {
            Some(magic) => magic,
            None => env_value("MAGIC")?.context("--magic or ARCHIVER_MAGIC is required")?,
        };
        Ok((dump, magic))
    }

    /// Merge flags, environment and defaults into a validated config.
    pub fn archive_config(&self) -> Result<ArchiveConfig> {
        let defaults = ArchiveConfig::default();
        let container = match self.container.clone() {
            Some(container) => container,
            None => env_value("CONTAINER")?.unwrap_or_default(),
        };
        let keys = AttributeKeys {
            block: self.block_attribute.clone(),
            index: self.index_attribute.clone(),
            state: self.state_attribute.clone(),
            ..AttributeKeys::default()
        };

        let cfg = ArchiveConfig {
            container,
            owner: self.owner.clone(),
            keys,
            batch_size: pick(self.batch_size, env_value("BATCH_SIZE")?, defaults.batch_size),
            index_size: pick(self.index_size, env_value("INDEX_SIZE")?, defaults.index_size),
            sync_interval: pick(
                self.sync_interval,
                env_value("SYNC_INTERVAL")?,
                defaults.sync_interval,
            ),
            upload_workers: pick(
                self.upload_workers,
                env_value("UPLOAD_WORKERS")?,
                defaults.upload_workers,
            ),
            search_workers: pick(
                self.search_workers,
                env_value("SEARCH_WORKERS")?,
                defaults.search_workers,
            ),
            delete_workers: pick(
                self.delete_workers,
                env_value("DELETE_WORKERS")?,
                defaults.delete_workers,
            ),
            retry_attempts: pick(self.retries, env_value("RETRIES")?, defaults.retry_attempts),
            initial_backoff: self
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            max_backoff: self
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            resume_policy: pick(
                self.resume_policy,
                env_value("RESUME_POLICY")?,
                defaults.resume_policy,
            ),
            disable_homomorphic: self.disable_homomorphic,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Flag, then environment, then default.
fn pick<T>(flag: Option<T>, env: Option<T>, default: T) -> T {
    flag.or(env).unwrap_or(default)
}

/// Address for `serve`: flags over ARCHIVER_HOST / ARCHIVER_PORT.
pub fn serve_addr(host: Option<String>, port: Option<u16>) -> Result<(String, u16)> {
    let host = match host {
        Some(host) => host,
        None => env_value("HOST")?.unwrap_or_else(|| "0.0.0.0".into()),
    };
    let port = match port {
        Some(port) => port,
        None => env_value("PORT")?.unwrap_or(3000),
    };
    Ok((host, port))
}

//! Command-line surface of the `ferry` binary.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, GIB};
use crate::error::{FerryError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    author,
    version,
    about = "Move large files between two trees through an object store, resumably"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOpts {
    /// Object store: http(s):// endpoint for S3, or a directory
    #[arg(short = 'u', long, global = true)]
    pub store_url: Option<String>,

    #[arg(short, long, global = true)]
    pub bucket: Option<String>,

    #[arg(long, global = true)]
    pub region: Option<String>,

    /// S3 access key id [default: $AWS_ACCESS_KEY_ID]
    #[arg(short = 'a', long, global = true)]
    pub access_key: Option<String>,

    /// S3 secret access key [default: $AWS_SECRET_ACCESS_KEY]
    #[arg(short = 's', long, global = true)]
    pub secret_key: Option<String>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append a journal of stage activity to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Compare the origin and target inventories
    Status,

    /// Record the files at the origin
    #[command(alias = "refresh_origin")]
    RefreshOrigin {
        path: PathBuf,
        /// File name patterns, matched from the start of the name
        #[arg(short = 'f', long = "filter", num_args = 1.., default_value = ".*")]
        filters: Vec<String>,
    },

    /// Record the files delivered at the target
    #[command(alias = "refresh_target")]
    RefreshTarget { path: PathBuf },

    /// Compress and split origin files into a work directory
    Disassemble {
        path: PathBuf,
        /// Part size in GiB, fractions allowed
        #[arg(long = "part-size-gb", alias = "part_size_gb")]
        part_size_gb: Option<f64>,
        #[arg(long, alias = "dry_run")]
        dry_run: bool,
    },

    /// Push disassembled parts to the store
    Upload {
        #[arg(long, alias = "dry_run")]
        dry_run: bool,
        /// Stop cleanly after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Fetch uploaded parts into a work directory
    Download {
        path: PathBuf,
        #[arg(long, alias = "dry_run")]
        dry_run: bool,
    },

    /// Rebuild downloaded files and move them into the target tree
    Reassemble { work_path: PathBuf, dst_path: PathBuf },
}

impl GlobalOpts {
    /// Config file (if any) with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(url) = &self.store_url {
            cfg.store.url = Some(url.clone());
        }
        if let Some(bucket) = &self.bucket {
            cfg.store.bucket = Some(bucket.clone());
        }
        if let Some(region) = &self.region {
            cfg.store.region = region.clone();
        }
        if let Some(key) = &self.access_key {
            cfg.store.access_key_id = Some(key.clone());
        }
        if let Some(secret) = &self.secret_key {
            cfg.store.secret_access_key = Some(secret.clone());
        }
        Ok(cfg)
    }

    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Part size in bytes for `disassemble`, flag over config.
pub fn part_size(flag_gb: Option<f64>, cfg: &Config) -> Result<u64> {
    let Some(gb) = flag_gb else {
        return Ok(cfg.part_size);
    };
    let bytes = gb * GIB as f64;
    if !gb.is_finite() || bytes < 1.0 || bytes >= u64::MAX as f64 {
        return Err(FerryError::Config(format!("part size of {gb} GiB is out of range")));
    }
    Ok(bytes as u64)
}

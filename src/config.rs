//! Engine configuration, loaded from an optional TOML file and overridden by
//! command-line flags.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FerryError, Result};

pub const GIB: u64 = 1 << 30;

/// Where manifests and parts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `http(s)://` selects S3; `file://` or a plain path selects a local directory
    pub url: Option<String>,
    pub bucket: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            bucket: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Argv templates for the external codecs.
///
/// Placeholders: `{input}`, `{output}`, `{output_dir}`, `{part_size}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub compress: Vec<String>,
    pub split: Vec<String>,
    /// Part paths are appended after these arguments
    pub concatenate: Vec<String>,
    pub decompress: Vec<String>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        let argv = |s: &[&str]| s.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        Self {
            // zstd --threads=0 takes every core; keep it polite
            compress: argv(&["nice", "-n", "19", "zstd", "--threads=0", "--stdout", "{input}"]),
            split: argv(&["split", "-b", "{part_size}", "-", "{output_dir}/"]),
            concatenate: argv(&["cat"]),
            decompress: argv(&["zstd", "--quiet", "--force", "--decompress", "-o", "{output}"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per concurrently transferred chunk of one blob
    pub chunk_size: u64,
    /// Worker threads per blob transfer (0 = number of CPUs)
    pub workers: usize,
    pub progress_interval_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024 * 1024,
            workers: 0,
            progress_interval_secs: 120,
        }
    }
}

impl TransferConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub transforms: TransformConfig,
    pub transfer: TransferConfig,
    /// Size of each disassembled part in bytes
    pub part_size: u64,
    /// Upload wall-clock budget in seconds
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            transforms: TransformConfig::default(),
            transfer: TransferConfig::default(),
            part_size: 10 * GIB,
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load a TOML config file; fields that are absent keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let cfg: Config =
            toml::from_str(data).map_err(|e| FerryError::Config(format!("invalid TOML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(FerryError::Config("part_size must be positive".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(FerryError::Config("transfer.chunk_size must be positive".into()));
        }
        for (name, argv) in [
            ("compress", &self.transforms.compress),
            ("split", &self.transforms.split),
            ("concatenate", &self.transforms.concatenate),
            ("decompress", &self.transforms.decompress),
        ] {
            if argv.is_empty() {
                return Err(FerryError::Config(format!("transforms.{name} is empty")));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.part_size, 10 * GIB);
        assert_eq!(cfg.transfer.progress_interval_secs, 120);
        assert_eq!(cfg.transforms.concatenate, vec!["cat".to_string()]);
        assert!(cfg.store.url.is_none());
    }

    #[test]
    fn partial_sections_override() {
        let cfg = Config::from_toml(
            r#"
part_size = 1048576

[store]
url = "https://s3.example.org"
bucket = "ingest"

[transforms]
compress = ["cat", "{input}"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.part_size, 1_048_576);
        assert_eq!(cfg.store.bucket.as_deref(), Some("ingest"));
        assert_eq!(cfg.transforms.compress, vec!["cat", "{input}"]);
        // untouched template keeps its default
        assert_eq!(cfg.transforms.split[0], "split");
    }

    #[test]
    fn rejects_zero_part_size() {
        assert!(matches!(
            Config::from_toml("part_size = 0"),
            Err(FerryError::Config(_))
        ));
    }

    #[test]
    fn rejects_empty_command() {
        assert!(Config::from_toml("[transforms]\ndecompress = []").is_err());
    }

    #[test]
    fn zero_workers_means_cpu_count() {
        let t = TransferConfig::default();
        assert!(t.worker_count() >= 1);
    }
}

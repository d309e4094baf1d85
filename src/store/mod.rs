//! Remote object store access.
//!
//! [`ObjectStore`] is the raw blob interface every backend implements;
//! [`ManifestStore`] layers typed JSON manifests with default-on-missing
//! semantics on top of it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{FerryError, Result};

pub mod local;
pub mod s3;

pub use local::LocalStore;
pub use s3::S3Store;

/// Receives byte counts from a running transfer, possibly from several
/// worker threads at once.
pub trait TransferObserver: Sync {
    fn on_bytes(&self, bytes: u64);

    /// Polled between chunks; returning true makes the transfer fail early.
    fn should_abort(&self) -> bool {
        false
    }
}

/// Observer for transfers nobody watches.
pub struct Unobserved;

impl TransferObserver for Unobserved {
    fn on_bytes(&self, _bytes: u64) {}
}

pub trait ObjectStore: Send + Sync {
    /// `None` when the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Object length in bytes, `None` when the key does not exist.
    fn size(&self, key: &str) -> Result<Option<u64>>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn upload_file(&self, path: &Path, key: &str, observer: &dyn TransferObserver) -> Result<()>;

    fn download_file(&self, key: &str, path: &Path, observer: &dyn TransferObserver)
        -> Result<()>;
}

pub(crate) fn aborted(op: &str, key: &str) -> FerryError {
    FerryError::Store(format!("{op} {key}: transfer aborted"))
}

/// Typed JSON manifests on top of an [`ObjectStore`].
#[derive(Clone)]
pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Missing manifests read as `T::default()`.
    pub fn load<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.store.get(key)? {
            Some(bytes) => decode(key, &bytes),
            None => Ok(T::default()),
        }
    }

    /// Missing manifests are an error.
    pub fn load_required<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        match self.store.get(key)? {
            Some(bytes) => decode(key, &bytes),
            None => Err(FerryError::MissingManifest {
                key: key.to_string(),
            }),
        }
    }

    /// Replace the whole manifest.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value).map_err(FerryError::ManifestEncode)?;
        self.store.put(key, &body)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|source| FerryError::ManifestDecode {
        key: key.to_string(),
        source,
    })
}

/// Build the backend selected by `config.store.url`.
///
/// `http://` and `https://` endpoints are S3; anything else is a local
/// directory (with an optional `file://` prefix), and a bucket name, if
/// given, becomes a subdirectory of it.
pub fn backend_from_config(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let url = config
        .store
        .url
        .as_deref()
        .ok_or_else(|| FerryError::Config("no store URL configured".into()))?;

    if url.starts_with("http://") || url.starts_with("https://") {
        let bucket = config
            .store
            .bucket
            .as_deref()
            .ok_or_else(|| FerryError::Config("an S3 store needs a bucket name".into()))?;
        let access_key = config
            .store
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| FerryError::Config("no S3 access key id".into()))?;
        let secret_key = config
            .store
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| FerryError::Config("no S3 secret access key".into()))?;
        let store = S3Store::new(
            url,
            bucket,
            &config.store.region,
            &access_key,
            &secret_key,
            &config.transfer,
        )?;
        store.ensure_bucket()?;
        return Ok(Arc::new(store));
    }

    let mut root = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
    if let Some(bucket) = &config.store.bucket {
        root.push(bucket);
    }
    Ok(Arc::new(LocalStore::create(&root, &config.transfer)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Inventory, PartLedger};

    fn local() -> (tempfile::TempDir, ManifestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::create(dir.path(), &Default::default()).unwrap();
        (dir, ManifestStore::new(Arc::new(store)))
    }

    #[test]
    fn missing_manifest_defaults_to_empty() {
        let (_dir, m) = local();
        let l: PartLedger = m.load("upload.json").unwrap();
        assert!(l.is_empty());
    }

    #[test]
    fn missing_required_manifest_is_an_error() {
        let (_dir, m) = local();
        let err = m.load_required::<Inventory>("origin.json").unwrap_err();
        assert!(matches!(err, FerryError::MissingManifest { ref key } if key == "origin.json"));
    }

    #[test]
    fn save_then_load() {
        let (_dir, m) = local();
        let mut l = PartLedger::default();
        l.push_part("a", "parts/a/aa");
        m.save("upload.json", &l).unwrap();
        let back: PartLedger = m.load("upload.json").unwrap();
        assert_eq!(back, l);
    }

    #[test]
    fn malformed_manifest_names_its_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::create(dir.path(), &Default::default()).unwrap();
        store.put("target.json", b"[1, 2, 3]").unwrap();
        let m = ManifestStore::new(Arc::new(store));
        match m.load::<Inventory>("target.json") {
            Err(FerryError::ManifestDecode { key, .. }) => assert_eq!(key, "target.json"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn backend_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        assert!(backend_from_config(&cfg).is_err());

        cfg.store.url = Some(format!("file://{}", dir.path().display()));
        cfg.store.bucket = Some("bkt".into());
        let store = backend_from_config(&cfg).unwrap();
        store.put("k", b"v").unwrap();
        assert!(dir.path().join("bkt/k").exists());

        cfg.store.url = Some("https://s3.example.org".into());
        cfg.store.bucket = None;
        assert!(matches!(backend_from_config(&cfg), Err(FerryError::Config(_))));
    }
}

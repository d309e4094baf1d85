//! A directory used as a bucket. Handy for tests and for termini that share
//! a mounted filesystem.

use rayon::prelude::*;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{aborted, ObjectStore, TransferObserver};
use crate::config::TransferConfig;
use crate::error::{FerryError, Result};

pub struct LocalStore {
    root: PathBuf,
    chunk_size: u64,
    workers: usize,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn create(root: &Path, transfer: &TransferConfig) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: fs::canonicalize(root)?,
            chunk_size: transfer.chunk_size.max(1),
            workers: transfer.worker_count(),
        })
    }

    /// Reject keys that could escape the root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(FerryError::InvalidKey("empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(FerryError::InvalidKey(key.to_string()));
        }
        if Path::new(key)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(FerryError::InvalidKey(format!("parent traversal in '{key}'")));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Copy `src` to `dst` in chunks on a worker pool; `dst` appears
    /// atomically once every chunk has landed.
    fn copy_chunked(
        &self,
        op: &str,
        key: &str,
        src: &Path,
        dst: &Path,
        observer: &dyn TransferObserver,
    ) -> Result<()> {
        let dir = dst.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let input = File::open(src)?;
        let len = input.metadata()?.len();
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.as_file().set_len(len)?;

        let chunk = self.chunk_size;
        let ranges: Vec<(u64, u64)> = (0..len)
            .step_by(chunk as usize)
            .map(|off| (off, chunk.min(len - off)))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| FerryError::Store(format!("{op} {key}: worker pool: {e}")))?;

        let output = tmp.as_file();
        pool.install(|| {
            ranges.par_iter().try_for_each(|&(offset, n)| -> Result<()> {
                if observer.should_abort() {
                    return Err(aborted(op, key));
                }
                copy_range(&input, output, offset, n)?;
                observer.on_bytes(n);
                Ok(())
            })
        })?;

        let mut file = tmp;
        file.flush()?;
        file.persist(dst).map_err(|e| FerryError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(unix)]
fn copy_range(input: &File, output: &File, offset: u64, len: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len as usize];
    input.read_exact_at(&mut buf, offset)?;
    output.write_all_at(&buf, offset)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_range(input: &File, output: &File, offset: u64, len: u64) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    // No positional I/O here; each chunk gets its own handles.
    let mut reader = input.try_clone()?;
    let mut writer = output.try_clone()?;
    let mut buf = vec![0u8; len as usize];
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut buf)?;
    writer.seek(SeekFrom::Start(offset))?;
    writer.write_all(&buf)?;
    Ok(())
}

impl ObjectStore for LocalStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        // readers never see a half-written manifest
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| FerryError::Io(e.error))?;
        Ok(())
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| FerryError::Store(format!("LIST {prefix}: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // in-progress temp files from NamedTempFile
            if key.rsplit('/').next().is_some_and(|n| n.starts_with(".tmp")) {
                continue;
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn upload_file(&self, path: &Path, key: &str, observer: &dyn TransferObserver) -> Result<()> {
        let dst = self.resolve(key)?;
        self.copy_chunked("PUT", key, path, &dst, observer)
    }

    fn download_file(
        &self,
        key: &str,
        path: &Path,
        observer: &dyn TransferObserver,
    ) -> Result<()> {
        let src = self.resolve(key)?;
        if !src.is_file() {
            return Err(FerryError::Store(format!("GET {key}: no such key")));
        }
        self.copy_chunked("GET", key, &src, path, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Unobserved;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn store(dir: &Path, chunk_size: u64) -> LocalStore {
        let transfer = TransferConfig {
            chunk_size,
            workers: 4,
            ..TransferConfig::default()
        };
        LocalStore::create(dir, &transfer).unwrap()
    }

    struct Counting {
        bytes: AtomicU64,
        calls: AtomicUsize,
        abort: bool,
    }

    impl Counting {
        fn new(abort: bool) -> Self {
            Self {
                bytes: AtomicU64::new(0),
                calls: AtomicUsize::new(0),
                abort,
            }
        }
    }

    impl TransferObserver for Counting {
        fn on_bytes(&self, bytes: u64) {
            self.bytes.fetch_add(bytes, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn should_abort(&self) -> bool {
            self.abort
        }
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalStore::validate_key("/etc/passwd").is_err());
        assert!(LocalStore::validate_key("parts/../../outside").is_err());
        assert!(LocalStore::validate_key("a\\b").is_err());
        assert!(LocalStore::validate_key("").is_err());
        assert!(LocalStore::validate_key("parts/run/f.dat/aa").is_ok());
    }

    #[test]
    fn get_put_delete() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 4);
        assert_eq!(s.get("a.json").unwrap(), None);
        s.put("a.json", b"{}").unwrap();
        assert_eq!(s.get("a.json").unwrap().as_deref(), Some(&b"{}"[..]));
        assert_eq!(s.size("a.json").unwrap(), Some(2));
        s.delete("a.json").unwrap();
        s.delete("a.json").unwrap();
        assert_eq!(s.get("a.json").unwrap(), None);
        assert_eq!(s.size("a.json").unwrap(), None);
    }

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 4);
        s.put("parts/x/aa", b"1").unwrap();
        s.put("parts/x/ab", b"2").unwrap();
        s.put("upload.json", b"{}").unwrap();
        assert_eq!(s.list("parts").unwrap(), vec!["parts/x/aa", "parts/x/ab"]);
        assert_eq!(s.list("").unwrap().len(), 3);
        assert!(s.list("nothing").unwrap().is_empty());
    }

    #[test]
    fn chunked_upload_reports_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir.path().join("bucket"), 7);
        let src = dir.path().join("blob");
        let data: Vec<u8> = (0..100u8).collect();
        fs::write(&src, &data).unwrap();

        let obs = Counting::new(false);
        s.upload_file(&src, "parts/b/aa", &obs).unwrap();
        assert_eq!(obs.bytes.load(Ordering::SeqCst), 100);
        assert_eq!(obs.calls.load(Ordering::SeqCst), 15);

        let back = dir.path().join("out/blob");
        s.download_file("parts/b/aa", &back, &Unobserved).unwrap();
        assert_eq!(fs::read(back).unwrap(), data);
    }

    #[test]
    fn aborted_transfer_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir.path().join("bucket"), 8);
        let src = dir.path().join("blob");
        fs::write(&src, vec![1u8; 64]).unwrap();
        assert!(s.upload_file(&src, "parts/b/aa", &Counting::new(true)).is_err());
        assert_eq!(s.get("parts/b/aa").unwrap(), None);
        assert!(s.list("parts").unwrap().is_empty());
    }

    #[test]
    fn download_of_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 8);
        assert!(s
            .download_file("parts/none", &dir.path().join("x"), &Unobserved)
            .is_err());
    }
}

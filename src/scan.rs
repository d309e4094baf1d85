//! Terminus enumeration: the regular files directly under a root, filtered by
//! name.

use filetime::FileTime;
use regex::Regex;
use std::fs::{self, Metadata};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::error::{FerryError, Result};
use crate::manifest::{FileRecord, Inventory};

pub const DEFAULT_FILTER: &str = ".*";

/// File name filters. A name is kept when any pattern matches at its start;
/// no patterns at all behaves like [`DEFAULT_FILTER`].
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    patterns: Vec<Regex>,
}

impl NameFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            let p = p.as_ref();
            // Anchor at the start only; a trailing suffix is allowed.
            let re = Regex::new(&format!("^(?:{p})")).map_err(|source| FerryError::Filter {
                pattern: p.to_string(),
                source,
            })?;
            compiled.push(re);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(name))
    }
}

/// Build an inventory of the files directly under `root`. Subdirectories are
/// not descended into. A symlink to a regular file is recorded under the
/// link's name with the path it resolves to.
pub fn scan_directory(root: &Path, filter: &NameFilter) -> Result<Inventory> {
    let root = root.canonicalize()?;
    let scanned_at = epoch_secs(SystemTime::now());
    let mut inventory = Inventory::default();

    for entry in WalkDir::new(&root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(walk_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let (path, metadata) = if entry.path_is_symlink() {
            match fs::metadata(entry.path()) {
                Ok(m) if m.is_file() => (entry.path().canonicalize()?, m),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("skipping {name}: {e}");
                    continue;
                }
            }
        } else if entry.file_type().is_file() {
            (entry.path().to_path_buf(), entry.metadata().map_err(walk_error)?)
        } else {
            continue;
        };
        if !filter.matches(&name) {
            tracing::debug!("skipping {name}: no filter matches");
            continue;
        }
        inventory.insert(name, record(&path.to_string_lossy(), &metadata, scanned_at));
    }
    Ok(inventory)
}

fn walk_error(e: walkdir::Error) -> FerryError {
    let msg = e.to_string();
    FerryError::Io(
        e.into_io_error()
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, msg)),
    )
}

fn record(path: &str, metadata: &Metadata, scanned_at: f64) -> FileRecord {
    FileRecord {
        path: path.to_string(),
        size: metadata.len(),
        mtime: filetime_secs(FileTime::from_last_modification_time(metadata)),
        atime: filetime_secs(FileTime::from_last_access_time(metadata)),
        scanned_at,
    }
}

pub fn filetime_secs(t: FileTime) -> f64 {
    t.unix_seconds() as f64 + f64::from(t.nanoseconds()) / 1e9
}

/// Inverse of [`filetime_secs`].
pub fn secs_to_filetime(secs: f64) -> FileTime {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    FileTime::from_unix_time(whole as i64, nanos)
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn filters_match_at_start_of_name() {
        let f = NameFilter::new(&["data"]).unwrap();
        assert!(f.matches("data.bin"));
        assert!(f.matches("data"));
        assert!(!f.matches("mydata.bin"));

        let f = NameFilter::new(&[r".*\.raw", "keep"]).unwrap();
        assert!(f.matches("a.raw"));
        assert!(f.matches("keep.txt"));
        assert!(!f.matches("a.txt"));
    }

    #[test]
    fn empty_filter_list_accepts_everything() {
        let f = NameFilter::new::<&str>(&[]).unwrap();
        assert!(f.matches("anything"));
        assert!(NameFilter::accept_all().matches(".hidden"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = NameFilter::new(&["("]).unwrap_err();
        assert!(matches!(err, FerryError::Filter { ref pattern, .. } if pattern == "("));
    }

    #[test]
    fn scan_is_flat_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run1.dat"), b"12345").unwrap();
        fs::write(dir.path().join("run2.dat"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/run3.dat"), b"x").unwrap();

        let inv = scan_directory(dir.path(), &NameFilter::new(&["run"]).unwrap()).unwrap();
        let ids: Vec<_> = inv.0.keys().cloned().collect();
        assert_eq!(ids, vec!["run1.dat", "run2.dat"]);

        let rec = inv.get("run1.dat").unwrap();
        assert_eq!(rec.size, 5);
        assert!(Path::new(&rec.path).is_absolute());
        assert!(rec.scanned_at > 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_files_are_recorded_resolved() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let real = root.join("store/big.dat");
        fs::create_dir(root.join("store")).unwrap();
        fs::create_dir(root.join("origin")).unwrap();
        fs::write(&real, b"1234567").unwrap();
        symlink(&real, root.join("origin/big.dat")).unwrap();
        symlink(root.join("store"), root.join("origin/dir_link")).unwrap();
        symlink(root.join("nowhere"), root.join("origin/dangling")).unwrap();

        let inv = scan_directory(&root.join("origin"), &NameFilter::accept_all()).unwrap();
        let ids: Vec<_> = inv.0.keys().cloned().collect();
        assert_eq!(ids, vec!["big.dat"]);
        let rec = inv.get("big.dat").unwrap();
        assert_eq!(rec.size, 7);
        assert_eq!(Path::new(&rec.path), real);
    }

    #[test]
    fn scan_records_file_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        filetime::set_file_times(
            &path,
            FileTime::from_unix_time(1_600_000_000, 0),
            FileTime::from_unix_time(1_500_000_000, 500_000_000),
        )
        .unwrap();

        let inv = scan_directory(dir.path(), &NameFilter::accept_all()).unwrap();
        let rec = inv.get("f").unwrap();
        assert_eq!(rec.atime, 1_600_000_000.0);
        assert_eq!(rec.mtime, 1_500_000_000.5);
    }

    #[test]
    fn seconds_convert_back_to_filetime() {
        let t = secs_to_filetime(1_500_000_000.25);
        assert_eq!(t.unix_seconds(), 1_500_000_000);
        assert_eq!(t.nanoseconds(), 250_000_000);
    }
}

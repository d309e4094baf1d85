//! The stage engine.
//!
//! Each stage reads its upstream manifest, its own ledger and the target
//! inventory, classifies ids with [`Classification`], cleans up delivered
//! ids first and then works through the rest, persisting its ledger after
//! every unit. A stage killed at any point picks up where it left off.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{FerryError, Result};
use crate::journal::{Journal, NoopJournal};
use crate::manifest::{
    Classification, Inventory, LogicalId, PartLedger, StatusReport, ORIGIN_KEY, TARGET_KEY,
};
use crate::scan::{scan_directory, NameFilter};
use crate::store::{ManifestStore, ObjectStore};

mod disassemble;
mod download;
mod reassemble;
mod upload;

pub use reassemble::ReassembleReport;

/// What a stage did, or would do on a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub cleaned: Vec<LogicalId>,
    pub processed: Vec<LogicalId>,
    pub dry_run: bool,
}

impl StageReport {
    fn planned(plan: &Classification) -> Self {
        Self {
            cleaned: plan.delivered.iter().cloned().collect(),
            processed: plan.pending().cloned().collect(),
            dry_run: true,
        }
    }
}

pub struct Engine {
    manifests: ManifestStore,
    store: Arc<dyn ObjectStore>,
    config: Config,
    cancel: CancelToken,
    journal: Arc<dyn Journal>,
}

impl Engine {
    pub fn new(store: Arc<dyn ObjectStore>, config: Config) -> Self {
        Self {
            manifests: ManifestStore::new(store.clone()),
            store,
            config,
            cancel: CancelToken::new(),
            journal: Arc::new(NoopJournal),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Record the files directly under `root` into the inventory at `key`,
    /// replacing whatever was there. Returns the number of files recorded.
    pub fn scan_terminus<S: AsRef<str>>(
        &self,
        root: &Path,
        filters: &[S],
        key: &str,
    ) -> Result<usize> {
        let filter = NameFilter::new(filters)?;
        let inventory = scan_directory(root, &filter)?;
        self.manifests.save(key, &inventory)?;
        tracing::info!(
            "recorded {} files from {} into {key}",
            inventory.len(),
            root.display()
        );
        Ok(inventory.len())
    }

    pub fn scan_origin<S: AsRef<str>>(&self, root: &Path, filters: &[S]) -> Result<usize> {
        self.scan_terminus(root, filters, ORIGIN_KEY)
    }

    pub fn scan_target(&self, root: &Path) -> Result<usize> {
        self.scan_terminus::<&str>(root, &[], TARGET_KEY)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let origin: Inventory = self.manifests.load(ORIGIN_KEY)?;
        let target = self.target()?;
        Ok(StatusReport::compute(&origin, &target))
    }

    /// A missing target inventory means nothing has been delivered yet.
    fn target(&self) -> Result<Inventory> {
        self.manifests.load(TARGET_KEY)
    }

    fn ledger(&self, key: &str) -> Result<PartLedger> {
        self.manifests.load(key)
    }

    /// Prefer the cancellation reason over the error a cancelled transfer
    /// surfaced with.
    fn cancelled_or(&self, err: FerryError) -> FerryError {
        match self.cancel.reason() {
            Some(reason) => FerryError::Cancelled(reason),
            None => err,
        }
    }

    fn finish(&self, stage: &str, report: &StageReport, started: std::time::Instant) {
        self.journal.stage_done(
            stage,
            report.cleaned.len(),
            report.processed.len(),
            started.elapsed().as_secs_f64(),
        );
        tracing::info!(
            "{stage}: cleaned {}, processed {}",
            report.cleaned.len(),
            report.processed.len()
        );
    }
}

/// Per-id directory under a work dir. Ids come from file names, so anything
/// that is not a single plain path component is refused.
fn id_dir(work_dir: &Path, id: &str) -> Result<PathBuf> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(work_dir.join(id)),
        _ => Err(FerryError::InvalidKey(format!("logical id '{id}'"))),
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create `dir` and return it in canonical form.
fn prepare_dir(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(dir.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_dir_accepts_plain_names_only() {
        let w = Path::new("/work");
        assert_eq!(id_dir(w, "run.dat").unwrap(), PathBuf::from("/work/run.dat"));
        assert!(id_dir(w, "..").is_err());
        assert!(id_dir(w, "a/b").is_err());
        assert!(id_dir(w, "/abs").is_err());
        assert!(id_dir(w, "").is_err());
    }

    #[test]
    fn removing_a_missing_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_if_present(&dir.path().join("nope")).unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(sub.join("deep")).unwrap();
        fs::write(sub.join("deep/f"), b"x").unwrap();
        remove_dir_if_present(&sub).unwrap();
        assert!(!sub.exists());
    }
}

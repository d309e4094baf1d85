use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

use super::{id_dir, prepare_dir, remove_dir_if_present, Engine, StageReport};
use crate::error::{FerryError, Result};
use crate::manifest::{
    key_basename, Classification, Manifest, DISASSEMBLE_KEY, DOWNLOAD_KEY, UPLOAD_KEY,
};
use crate::progress::{MeteredTransfer, ProgressMeter};

const STAGE: &str = "download";

impl Engine {
    /// Fetch the parts of every fully uploaded file into `work_dir/<id>/`.
    pub fn download(&self, work_dir: &Path, dry_run: bool) -> Result<StageReport> {
        let uploaded = self.ledger(UPLOAD_KEY)?;
        let disassembled = self.ledger(DISASSEMBLE_KEY)?;
        // half-uploaded entries are not ready yet
        let source = uploaded.complete_subset(&disassembled);
        let target = self.target()?;
        let mut ledger = self.ledger(DOWNLOAD_KEY)?;
        let plan = Classification::compute(&ledger, &source, &target);

        if dry_run {
            return Ok(StageReport::planned(&plan));
        }

        let started = Instant::now();
        self.journal.stage_start(STAGE);
        let work_dir = prepare_dir(work_dir)?;
        let interval = self.config.transfer.progress_interval();
        let mut report = StageReport::default();

        for id in &plan.delivered {
            self.cancel.check()?;
            tracing::info!("{id} delivered, removing its downloaded parts");
            remove_dir_if_present(&id_dir(&work_dir, id)?)?;
            ledger.remove(id);
            self.manifests.save(DOWNLOAD_KEY, &ledger)?;
            self.journal.cleaned(STAGE, id);
            report.cleaned.push(id.clone());
        }

        for id in plan.pending() {
            self.cancel.check()?;
            let chunk_dir = id_dir(&work_dir, id)?;
            fs::create_dir_all(&chunk_dir)?;
            if !ledger.contains(id) {
                ledger.touch(id);
                self.manifests.save(DOWNLOAD_KEY, &ledger)?;
            } else if !resumable(ledger.parts(id), &chunk_dir, source.parts(id)) {
                tracing::warn!(
                    "{id} was partly downloaded elsewhere, starting it over in {}",
                    chunk_dir.display()
                );
                ledger.set(id.clone(), Vec::new());
                self.manifests.save(DOWNLOAD_KEY, &ledger)?;
            }

            for key in source.parts(id) {
                self.cancel.check()?;
                let name = key_basename(key);
                if ledger.has_part_named(id, name) {
                    continue;
                }
                let path = chunk_dir.join(name);
                let recorded = path.to_string_lossy().into_owned();

                let size = self.store.size(key)?.ok_or_else(|| {
                    FerryError::Store(format!("{key} is in {UPLOAD_KEY} but not in the store"))
                })?;
                let meter = ProgressMeter::new(ProgressMeter::label_for(&recorded), size, interval);
                let observer = MeteredTransfer::new(meter, &self.cancel);
                tracing::info!("downloading {key} to {recorded}");
                if let Err(e) = self.store.download_file(key, &path, &observer) {
                    let e = self.cancelled_or(e);
                    if !e.is_cancelled() {
                        self.journal.failed(STAGE, id, &e.to_string());
                    }
                    return Err(e);
                }

                ledger.push_part(id, recorded);
                self.manifests.save(DOWNLOAD_KEY, &ledger)?;
            }

            self.journal.processed(STAGE, id, ledger.parts(id).len());
            report.processed.push(id.clone());
        }

        self.finish(STAGE, &report, started);
        Ok(report)
    }
}

/// A partial entry can be resumed only if every recorded part sits in
/// `chunk_dir` and names a distinct uploaded part.
fn resumable(recorded: &[String], chunk_dir: &Path, keys: &[String]) -> bool {
    let mut seen = BTreeSet::new();
    recorded.iter().all(|part| {
        let path = Path::new(part);
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        path.parent() == Some(chunk_dir)
            && keys.iter().any(|k| key_basename(k) == name)
            && seen.insert(name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resume_needs_parts_in_the_current_dir() {
        let keys = strings(&["parts/f/aa", "parts/f/ab", "parts/f/ac"]);
        let here = Path::new("/w2/f");
        assert!(resumable(&[], here, &keys));
        assert!(resumable(&strings(&["/w2/f/aa", "/w2/f/ab"]), here, &keys));
        assert!(!resumable(&strings(&["/w1/f/aa"]), here, &keys));
        assert!(!resumable(&strings(&["/w2/f/zz"]), here, &keys));
        assert!(!resumable(&strings(&["/w2/f/aa", "/w2/f/aa"]), here, &keys));
    }
}

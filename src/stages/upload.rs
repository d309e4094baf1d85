use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

use super::{Engine, StageReport};
use crate::error::Result;
use crate::manifest::{
    part_key, Classification, Manifest, DISASSEMBLE_KEY, PARTS_PREFIX, UPLOAD_KEY,
};
use crate::progress::{MeteredTransfer, ProgressMeter};

const STAGE: &str = "upload";

impl Engine {
    /// Push every disassembled part that is not in the upload ledger yet.
    ///
    /// Stops with `FerryError::Cancelled` once the engine's cancel token is
    /// tripped; parts recorded so far stay recorded.
    pub fn upload(&self, dry_run: bool) -> Result<StageReport> {
        let source = self.ledger(DISASSEMBLE_KEY)?;
        let target = self.target()?;
        let mut ledger = self.ledger(UPLOAD_KEY)?;
        let plan = Classification::compute(&ledger, &source, &target);

        if dry_run {
            return Ok(StageReport::planned(&plan));
        }

        let started = Instant::now();
        self.journal.stage_start(STAGE);
        let mut report = StageReport::default();

        for id in &plan.delivered {
            self.cancel.check()?;
            tracing::info!("{id} delivered, deleting its remote parts");
            for key in ledger.parts(id) {
                self.store.delete(key)?;
            }
            ledger.remove(id);
            self.manifests.save(UPLOAD_KEY, &ledger)?;
            self.journal.cleaned(STAGE, id);
            report.cleaned.push(id.clone());
        }

        let pending: Vec<_> = plan.pending().cloned().collect();
        if pending.is_empty() {
            self.finish(STAGE, &report, started);
            return Ok(report);
        }

        let remote: BTreeSet<String> = self
            .store
            .list(&format!("{PARTS_PREFIX}/"))?
            .into_iter()
            .collect();
        let interval = self.config.transfer.progress_interval();

        for id in &pending {
            self.cancel.check()?;
            if !ledger.contains(id) {
                ledger.touch(id);
                self.manifests.save(UPLOAD_KEY, &ledger)?;
            }

            for part in source.parts(id) {
                self.cancel.check()?;
                let path = Path::new(part);
                let key = part_key(id, path);
                if ledger.has_part(id, &key) {
                    continue;
                }

                if remote.contains(&key) {
                    tracing::info!("{key} already in the store, recording it");
                } else {
                    let size = fs::metadata(path)?.len();
                    let meter = ProgressMeter::new(ProgressMeter::label_for(part), size, interval);
                    let observer = MeteredTransfer::new(meter, &self.cancel);
                    tracing::info!("uploading {part} to {key}");
                    if let Err(e) = self.store.upload_file(path, &key, &observer) {
                        let e = self.cancelled_or(e);
                        if !e.is_cancelled() {
                            self.journal.failed(STAGE, id, &e.to_string());
                        }
                        return Err(e);
                    }
                }

                ledger.push_part(id, key);
                self.manifests.save(UPLOAD_KEY, &ledger)?;
            }

            self.journal.processed(STAGE, id, ledger.parts(id).len());
            report.processed.push(id.clone());
        }

        self.finish(STAGE, &report, started);
        Ok(report)
    }
}

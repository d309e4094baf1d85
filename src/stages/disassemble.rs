use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{id_dir, prepare_dir, remove_dir_if_present, Engine, StageReport};
use crate::error::{FerryError, Result};
use crate::manifest::{Classification, Inventory, DISASSEMBLE_KEY, ORIGIN_KEY};
use crate::pipeline::{run_pipeline, CommandLine, Placeholders};

const STAGE: &str = "disassemble";

impl Engine {
    /// Compress and split every origin file that is neither delivered nor
    /// already split into `work_dir/<id>/`.
    pub fn disassemble(
        &self,
        work_dir: &Path,
        part_size: u64,
        dry_run: bool,
    ) -> Result<StageReport> {
        if part_size == 0 {
            return Err(FerryError::Config("part size must be positive".into()));
        }
        let origin: Inventory = self.manifests.load(ORIGIN_KEY)?;
        let target = self.target()?;
        let mut ledger = self.ledger(DISASSEMBLE_KEY)?;
        let plan = Classification::compute(&ledger, &origin, &target);

        if dry_run {
            return Ok(StageReport::planned(&plan));
        }

        let started = Instant::now();
        self.journal.stage_start(STAGE);
        let work_dir = prepare_dir(work_dir)?;
        let mut report = StageReport::default();

        for id in &plan.delivered {
            self.cancel.check()?;
            tracing::info!("{id} delivered, removing its chunks");
            remove_dir_if_present(&id_dir(&work_dir, id)?)?;
            ledger.remove(id);
            self.manifests.save(DISASSEMBLE_KEY, &ledger)?;
            self.journal.cleaned(STAGE, id);
            report.cleaned.push(id.clone());
        }

        for id in plan.pending() {
            self.cancel.check()?;
            let record = origin.get(id).ok_or_else(|| FerryError::MissingRecord {
                id: id.clone(),
                key: ORIGIN_KEY.to_string(),
            })?;

            // leftovers from an interrupted run are never trusted
            let chunk_dir = id_dir(&work_dir, id)?;
            remove_dir_if_present(&chunk_dir)?;
            fs::create_dir_all(&chunk_dir)?;

            tracing::info!("compressing and splitting {id}");
            let vars = Placeholders::new()
                .with("input", record.path.as_str())
                .with_path("output_dir", &chunk_dir)
                .with("part_size", part_size.to_string());
            let compress = CommandLine::from_template(&self.config.transforms.compress, &vars);
            let split = CommandLine::from_template(&self.config.transforms.split, &vars);
            if let Err(e) = run_pipeline(&compress, &split) {
                // Ctrl-C reaches the codecs too
                let e = self.cancelled_or(e);
                if !e.is_cancelled() {
                    self.journal.failed(STAGE, id, &e.to_string());
                }
                return Err(e);
            }

            let parts = list_chunks(&chunk_dir)?;
            tracing::debug!("{id}: {} parts", parts.len());
            let count = parts.len();
            ledger.set(
                id.clone(),
                parts
                    .into_iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            );
            self.manifests.save(DISASSEMBLE_KEY, &ledger)?;
            self.journal.processed(STAGE, id, count);
            report.processed.push(id.clone());
        }

        self.finish(STAGE, &report, started);
        Ok(report)
    }
}

/// Chunk files in `dir`, sorted so that the order is concatenation order.
fn list_chunks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            parts.push(entry.path());
        }
    }
    parts.sort();
    Ok(parts)
}

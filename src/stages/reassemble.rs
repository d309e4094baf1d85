use std::fs;
use std::path::Path;
use std::time::Instant;

use super::{prepare_dir, Engine};
use crate::error::{FerryError, Result};
use crate::manifest::{FileRecord, Inventory, LogicalId, DOWNLOAD_KEY, ORIGIN_KEY, UPLOAD_KEY};
use crate::pipeline::{run_pipeline, CommandLine, Placeholders};
use crate::scan::secs_to_filetime;

const STAGE: &str = "reassemble";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassembleReport {
    pub restored: Vec<LogicalId>,
    /// Left alone because the destination already had a file of that name
    pub conflicts: Vec<LogicalId>,
    /// Not fully downloaded yet
    pub skipped: Vec<LogicalId>,
}

impl Engine {
    /// Rebuild every fully downloaded file and move it into `dst_dir`.
    ///
    /// The download ledger is read whole on every run; files already moved
    /// into place show up as conflicts until the target is rescanned and
    /// the cleanup sweeps drop them.
    pub fn reassemble(&self, work_dir: &Path, dst_dir: &Path) -> Result<ReassembleReport> {
        let work_dir = prepare_dir(work_dir)?;
        let dst_dir = prepare_dir(dst_dir)?;
        let downloaded = self.ledger(DOWNLOAD_KEY)?;
        let uploaded = self.ledger(UPLOAD_KEY)?;
        // timestamps come from the origin record, so there is no sane default
        let origin: Inventory = self.manifests.load_required(ORIGIN_KEY)?;

        let started = Instant::now();
        self.journal.stage_start(STAGE);
        let mut report = ReassembleReport::default();

        for (id, parts) in downloaded.iter() {
            self.cancel.check()?;
            if !downloaded.is_complete_against(id, &uploaded) {
                tracing::warn!("{id} is not fully downloaded, skipping");
                report.skipped.push(id.clone());
                continue;
            }

            let basename = Path::new(id)
                .file_name()
                .ok_or_else(|| FerryError::InvalidKey(format!("logical id '{id}'")))?;
            let dst_path = dst_dir.join(basename);
            if dst_path.exists() {
                self.conflict(id, &dst_path, &mut report);
                continue;
            }

            let record = origin.get(id).ok_or_else(|| FerryError::MissingRecord {
                id: id.clone(),
                key: ORIGIN_KEY.to_string(),
            })?;

            let output = work_dir.join(basename);
            if output.is_dir() {
                return Err(FerryError::Config(format!(
                    "{} is a directory; reassemble needs a work dir separate from download's",
                    output.display()
                )));
            }
            tracing::info!("reassembling {id}");
            let mut sorted = parts.clone();
            sorted.sort();
            if let Err(e) = self.rebuild(&sorted, &output, record) {
                let e = self.cancelled_or(e);
                if !e.is_cancelled() {
                    self.journal.failed(STAGE, id, &e.to_string());
                }
                return Err(e);
            }

            // someone may have put it there while we were decompressing
            if dst_path.exists() {
                self.conflict(id, &dst_path, &mut report);
                fs::remove_file(&output)?;
                continue;
            }
            fs::rename(&output, &dst_path)?;
            self.journal.processed(STAGE, id, sorted.len());
            report.restored.push(id.clone());
        }

        self.journal.stage_done(
            STAGE,
            0,
            report.restored.len(),
            started.elapsed().as_secs_f64(),
        );
        tracing::info!(
            "reassemble: restored {}, conflicts {}, skipped {}",
            report.restored.len(),
            report.conflicts.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Concatenate and decompress `parts` into `output`, then give it the
    /// origin's timestamps and make it read-only.
    fn rebuild(&self, parts: &[String], output: &Path, record: &FileRecord) -> Result<()> {
        // a read-only leftover from an earlier attempt
        if output.exists() {
            fs::remove_file(output)?;
        }
        let vars = Placeholders::new().with_path("output", output);
        let concatenate =
            CommandLine::from_template(&self.config.transforms.concatenate, &vars).args(parts);
        let decompress = CommandLine::from_template(&self.config.transforms.decompress, &vars);
        run_pipeline(&concatenate, &decompress)?;

        filetime::set_file_times(
            output,
            secs_to_filetime(record.atime),
            secs_to_filetime(record.mtime),
        )?;
        set_read_only(output)
    }

    fn conflict(&self, id: &str, dst_path: &Path, report: &mut ReassembleReport) {
        tracing::error!("{} already exists, not overwriting it", dst_path.display());
        self.journal.conflict(id, dst_path);
        report.conflicts.push(id.to_string());
    }
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

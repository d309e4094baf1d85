use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Durable record of what each stage did, separate from diagnostic logging.
pub trait Journal: Send + Sync {
    fn stage_start(&self, _stage: &str) {}
    fn cleaned(&self, _stage: &str, _id: &str) {}
    fn processed(&self, _stage: &str, _id: &str, _parts: usize) {}
    fn conflict(&self, _id: &str, _dst: &Path) {}
    fn failed(&self, _stage: &str, _id: &str, _msg: &str) {}
    fn stage_done(&self, _stage: &str, _cleaned: usize, _processed: usize, _seconds: f64) {}
}

pub struct NoopJournal;
impl Journal for NoopJournal {}

pub struct TextJournal {
    file: Mutex<File>,
}

impl TextJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Journal for TextJournal {
    fn stage_start(&self, stage: &str) {
        self.line(&format!("START stage={stage}"));
    }
    fn cleaned(&self, stage: &str, id: &str) {
        self.line(&format!("CLEAN stage={stage} id={id}"));
    }
    fn processed(&self, stage: &str, id: &str, parts: usize) {
        self.line(&format!("DONE stage={stage} id={id} parts={parts}"));
    }
    fn conflict(&self, id: &str, dst: &Path) {
        self.line(&format!("CONFLICT id={id} dst={}", dst.display()));
    }
    fn failed(&self, stage: &str, id: &str, msg: &str) {
        self.line(&format!("ERROR stage={stage} id={id} msg={msg}"));
    }
    fn stage_done(&self, stage: &str, cleaned: usize, processed: usize, seconds: f64) {
        self.line(&format!(
            "END stage={stage} cleaned={cleaned} processed={processed} seconds={seconds:.3}"
        ));
    }
}

//! Typed manifests and the set algebra the stages use to reconcile them.
//!
//! Every stage owns one ledger and reads an upstream source plus the target
//! inventory. From those three maps it derives, fresh on every run, which ids
//! were delivered (clean up), which are half done (resume) and which have not
//! been started yet. Nothing else is tracked between runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const ORIGIN_KEY: &str = "origin.json";
pub const TARGET_KEY: &str = "target.json";
pub const DISASSEMBLE_KEY: &str = "disassemble.json";
pub const UPLOAD_KEY: &str = "upload.json";
pub const DOWNLOAD_KEY: &str = "download.json";

/// Prefix under which all parts are stored remotely.
pub const PARTS_PREFIX: &str = "parts";

/// A file's path relative to the origin root.
pub type LogicalId = String;

/// One scanned file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path at scan time
    pub path: String,
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: f64,
    pub atime: f64,
    /// When the scan saw the file
    #[serde(rename = "ts")]
    pub scanned_at: f64,
}

/// Origin or target inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory(pub BTreeMap<LogicalId, FileRecord>);

/// Ordered part list per logical id (local chunk paths or remote keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartLedger(pub BTreeMap<LogicalId, Vec<String>>);

/// Anything keyed by logical id with a part count per entry.
pub trait Manifest {
    fn contains(&self, id: &str) -> bool;
    fn ids(&self) -> BTreeSet<LogicalId>;
    /// Number of parts recorded for `id`, if the manifest tracks parts.
    fn part_count(&self, id: &str) -> Option<usize>;
}

impl Manifest for Inventory {
    fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    fn ids(&self) -> BTreeSet<LogicalId> {
        self.0.keys().cloned().collect()
    }

    fn part_count(&self, _id: &str) -> Option<usize> {
        None
    }
}

impl Manifest for PartLedger {
    fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    fn ids(&self) -> BTreeSet<LogicalId> {
        self.0.keys().cloned().collect()
    }

    fn part_count(&self, id: &str) -> Option<usize> {
        self.0.get(id).map(Vec::len)
    }
}

impl Inventory {
    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.0.get(id)
    }

    pub fn insert(&mut self, id: impl Into<LogicalId>, record: FileRecord) {
        self.0.insert(id.into(), record);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartLedger {
    pub fn parts(&self, id: &str) -> &[String] {
        self.0.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set(&mut self, id: impl Into<LogicalId>, parts: Vec<String>) {
        self.0.insert(id.into(), parts);
    }

    /// Append one part, creating the entry on first use. Returns false if the
    /// part was already recorded.
    pub fn push_part(&mut self, id: &str, part: impl Into<String>) -> bool {
        let part = part.into();
        let entry = self.0.entry(id.to_string()).or_default();
        if entry.contains(&part) {
            return false;
        }
        entry.push(part);
        true
    }

    /// Make sure `id` has an entry, even an empty one.
    pub fn touch(&mut self, id: &str) {
        self.0.entry(id.to_string()).or_default();
    }

    pub fn remove(&mut self, id: &str) -> Option<Vec<String>> {
        self.0.remove(id)
    }

    pub fn has_part(&self, id: &str, part: &str) -> bool {
        self.parts(id).iter().any(|p| p == part)
    }

    /// True when a recorded part of `id` ends in the file name `name`,
    /// wherever it was recorded.
    pub fn has_part_named(&self, id: &str, name: &str) -> bool {
        self.parts(id)
            .iter()
            .any(|p| Path::new(p).file_name().is_some_and(|n| n == name))
    }

    /// True when `id` has exactly as many parts here as in `upstream`.
    /// Ids unknown upstream count as complete.
    pub fn is_complete_against(&self, id: &str, upstream: &PartLedger) -> bool {
        match (self.0.get(id), upstream.0.get(id)) {
            (Some(mine), Some(theirs)) => mine.len() == theirs.len(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Entries that are complete against `upstream`.
    pub fn complete_subset(&self, upstream: &PartLedger) -> PartLedger {
        PartLedger(
            self.0
                .iter()
                .filter(|(id, _)| self.is_complete_against(id, upstream))
                .map(|(id, parts)| (id.clone(), parts.clone()))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LogicalId, &Vec<String>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Three-way split of a stage's work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// In the stage's ledger and in target: clean up
    pub delivered: BTreeSet<LogicalId>,
    /// In the ledger but with fewer parts than the source: resume
    pub in_flight: BTreeSet<LogicalId>,
    /// In the source, not in the ledger, not in target: start
    pub unprocessed: BTreeSet<LogicalId>,
}

impl Classification {
    pub fn compute<S: Manifest>(own: &PartLedger, source: &S, target: &Inventory) -> Self {
        let own_ids = own.ids();
        let source_ids = source.ids();

        let delivered: BTreeSet<_> = own_ids
            .iter()
            .filter(|id| target.contains(id))
            .cloned()
            .collect();

        let unprocessed: BTreeSet<_> = source_ids
            .iter()
            .filter(|id| !own.contains(id) && !target.contains(id))
            .cloned()
            .collect();

        let in_flight: BTreeSet<_> = own_ids
            .iter()
            .filter(|id| !target.contains(id))
            .filter(|id| match (own.part_count(id), source.part_count(id)) {
                (Some(mine), Some(theirs)) => mine < theirs,
                _ => false,
            })
            .cloned()
            .collect();

        Self {
            delivered,
            in_flight,
            unprocessed,
        }
    }

    /// Ids to work on this run, resumed entries first.
    pub fn pending(&self) -> impl Iterator<Item = &LogicalId> {
        self.in_flight.iter().chain(self.unprocessed.iter())
    }
}

/// Remote key for a local chunk file: `parts/<logical id>/<chunk name>`.
///
/// Chunks live at `<work dir>/<logical id>/<chunk name>`, so the key depends
/// only on the logical id and the chunk name, never on where the work
/// directory happens to be mounted.
pub fn part_key(id: &str, chunk_path: &Path) -> String {
    let name = chunk_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = id.trim_matches('/');
    format!("{PARTS_PREFIX}/{id}/{name}")
}

/// Last `/`-separated component of a key.
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Ids of `origin` split by whether `target` has them, plus size mismatches
/// among the delivered ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub present: Vec<LogicalId>,
    pub undelivered: Vec<LogicalId>,
    pub mismatched: Vec<LogicalId>,
}

impl StatusReport {
    pub fn compute(origin: &Inventory, target: &Inventory) -> Self {
        let mut report = StatusReport::default();
        for (id, record) in &origin.0 {
            match target.get(id) {
                Some(delivered) => {
                    if delivered.size != record.size {
                        report.mismatched.push(id.clone());
                    }
                    report.present.push(id.clone());
                }
                None => report.undelivered.push(id.clone()),
            }
        }
        report
    }
}

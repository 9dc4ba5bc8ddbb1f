//! Incremental Snapshot Index
//!
//! Per-label manifests of what was written, where, and in which state the
//! source file was when it was read. A backup run scans the source tree,
//! diffs it against the prior manifest and, when the run ends, assembles and
//! atomically stores the next manifest from the committed transfer records.

pub mod diff;
pub mod scan;
pub mod store;

use crate::pipeline::{FileTransferRecord, Strategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub use diff::{diff, Diff};
pub use scan::scan;
pub use store::ManifestStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Symlink { target: String },
}

/// One file of the source tree as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Manifest key and archive entry name.
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    pub mtime: i64,
}

/// Scanned tree, ordered by manifest key.
pub type SourceTree = BTreeMap<String, SourceEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub volume_id: String,
    /// Byte offset of the entry header within its volume's archive segment.
    pub offset: u64,
    /// Run that wrote the entry; selects the volume spans holding it.
    pub run_id: String,
}

/// The part of one run's archive that landed on one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpan {
    pub run_id: String,
    pub strategy: Strategy,
    /// Position of this span within the run, starting at 0.
    pub sequence: u32,
    pub volume_id: String,
    /// Tape file number the span starts at.
    pub tape_file: u64,
    pub first_path: Option<String>,
    pub last_path: Option<String>,
    pub files: u64,
    /// Offset of the span's first byte in the run's archive stream.
    pub archive_offset: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    pub created_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub volumes: Vec<VolumeSpan>,
    pub files: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(label: &str, job: Option<&str>, strategy: Strategy) -> Self {
        Self {
            label: label.to_string(),
            job: job.map(str::to_string),
            created_at: Utc::now(),
            strategy,
            volumes: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    /// Fill this manifest from the outcome of a run.
    ///
    /// Paths committed by the run take their new records. When a prior
    /// manifest is given (incremental runs), every other path still present
    /// in `tree` keeps its prior entry, including changed files the run did
    /// not get to, so they are picked up again next time. Paths gone from the
    /// tree are dropped. Prior spans stay listed while an entry refers to
    /// their run.
    pub fn assemble(
        mut self,
        tree: &SourceTree,
        prior: Option<&Manifest>,
        records: &[FileTransferRecord],
        spans: Vec<VolumeSpan>,
    ) -> Self {
        if let Some(prior) = prior {
            for (name, entry) in &prior.files {
                if tree.contains_key(name) {
                    self.files.insert(name.clone(), entry.clone());
                }
            }
        }

        for record in records {
            let Some(source) = tree.get(&record.path) else {
                continue;
            };
            self.files.insert(
                record.path.clone(),
                ManifestEntry {
                    kind: source.kind.clone(),
                    size: record.size,
                    mtime: source.mtime,
                    checksum: record.checksum.clone(),
                    volume_id: record.volume_id.clone(),
                    offset: record.offset,
                    run_id: record.run_id.clone(),
                },
            );
        }

        let referenced: HashSet<&str> = self.files.values().map(|e| e.run_id.as_str()).collect();
        let new_runs: HashSet<&str> = spans.iter().map(|s| s.run_id.as_str()).collect();
        let mut volumes: Vec<VolumeSpan> = prior
            .map(|p| {
                p.volumes
                    .iter()
                    .filter(|s| referenced.contains(s.run_id.as_str()))
                    .filter(|s| !new_runs.contains(s.run_id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        volumes.extend(spans.iter().cloned());
        self.volumes = volumes;

        self
    }

    /// Spans of one run in write order.
    pub fn spans_of(&self, run_id: &str) -> Vec<&VolumeSpan> {
        let mut spans: Vec<&VolumeSpan> =
            self.volumes.iter().filter(|s| s.run_id == run_id).collect();
        spans.sort_by_key(|s| s.sequence);
        spans
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, size: u64, mtime: i64) -> SourceEntry {
        SourceEntry {
            name: name.to_string(),
            path: PathBuf::from(format!("/{}", name)),
            kind: EntryKind::File,
            size,
            mtime,
        }
    }

    fn record(index: usize, name: &str, size: u64, run: &str) -> FileTransferRecord {
        FileTransferRecord {
            index,
            path: name.to_string(),
            volume_id: "VOL001".to_string(),
            offset: 0,
            archive_offset: 0,
            size,
            checksum: None,
            run_id: run.to_string(),
        }
    }

    fn span(run: &str) -> VolumeSpan {
        VolumeSpan {
            run_id: run.to_string(),
            strategy: Strategy::Direct,
            sequence: 0,
            volume_id: "VOL001".to_string(),
            tape_file: 0,
            first_path: None,
            last_path: None,
            files: 1,
            archive_offset: 0,
            bytes: 1024,
        }
    }

    #[test]
    fn test_assemble_merges_prior_and_drops_deleted() {
        let mut tree = SourceTree::new();
        tree.insert("d/a".into(), source("d/a", 10, 2));
        tree.insert("d/b".into(), source("d/b", 20, 1));

        let prior = Manifest::new("daily", None, Strategy::Direct).assemble(
            &{
                let mut t = tree.clone();
                t.insert("d/gone".into(), source("d/gone", 5, 1));
                t
            },
            None,
            &[
                record(0, "d/a", 10, "r1"),
                record(1, "d/b", 20, "r1"),
                record(2, "d/gone", 5, "r1"),
            ],
            vec![span("r1")],
        );
        assert_eq!(prior.files.len(), 3);

        let next = Manifest::new("daily", None, Strategy::Direct).assemble(
            &tree,
            Some(&prior),
            &[record(0, "d/a", 10, "r2")],
            vec![span("r2")],
        );

        assert_eq!(next.files.len(), 2);
        assert_eq!(next.files["d/a"].run_id, "r2");
        assert_eq!(next.files["d/b"].run_id, "r1");
        assert!(!next.files.contains_key("d/gone"));
        assert_eq!(next.volumes.len(), 2);
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut tree = SourceTree::new();
        tree.insert("d/a".into(), source("d/a", 10, 2));
        let manifest = Manifest::new("daily", Some("web"), Strategy::Prestaged).assemble(
            &tree,
            None,
            &[record(0, "d/a", 10, "r1")],
            vec![span("r1")],
        );

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["strategy"], "tar");
        assert_eq!(json["files"]["d/a"]["type"], "file");
        assert_eq!(json["files"]["d/a"]["volume_id"], "VOL001");
        assert!(json["files"]["d/a"].get("checksum").is_none());

        let back: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, manifest);
    }
}

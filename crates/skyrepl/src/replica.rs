//! Replica metadata shared by the controller, workers and the registry.

use std::collections::BTreeMap;

use anyhow::ensure;
use serde::{Deserialize, Serialize};

/// Completeness of one chunk replica on one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    NotFound,
    Corrupt,
    Incomplete,
    Complete,
}

/// One file backing a chunk replica.
///
/// `cs` is the content checksum as a hex string; empty when it was not
/// computed for this observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub cs: String,
    pub mtime: u64,
}

/// One observation of a chunk replica on a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub status: ReplicaStatus,
    pub worker: String,
    pub database: String,
    pub chunk: u32,
    /// Epoch milliseconds of the observation.
    pub verify_time: u64,
    pub files: Vec<FileInfo>,
}

impl ReplicaInfo {
    /// Index the files by name.
    pub fn file_map(&self) -> BTreeMap<&str, &FileInfo> {
        self.files.iter().map(|f| (f.name.as_str(), f)).collect()
    }
}

/// Pairwise comparison of two observations of the same chunk replica.
///
/// Checksums are compared only when both sides carry one; a missing
/// checksum is an unknown, not a mismatch.
#[derive(Clone, Debug)]
pub struct ReplicaDiff {
    replica1: ReplicaInfo,
    replica2: ReplicaInfo,
    status_mismatch: bool,
    num_files_mismatch: bool,
    file_names_mismatch: bool,
    file_size_mismatch: bool,
    file_cs_mismatch: bool,
    file_mtime_mismatch: bool,
}

impl ReplicaDiff {
    /// Compare two observations. Both must refer to the same chunk of the
    /// same database.
    pub fn new(replica1: ReplicaInfo, replica2: ReplicaInfo) -> anyhow::Result<Self> {
        ensure!(
            replica1.database == replica2.database && replica1.chunk == replica2.chunk,
            "replicas refer to different objects: {}:{} vs {}:{}",
            replica1.database,
            replica1.chunk,
            replica2.database,
            replica2.chunk,
        );
        let status_mismatch = replica1.status != replica2.status;

        let files1 = replica1.file_map();
        let files2 = replica2.file_map();
        let num_files_mismatch = files1.len() != files2.len();
        let file_names_mismatch =
            files1.keys().ne(files2.keys());

        let mut file_size_mismatch = false;
        let mut file_cs_mismatch = false;
        let mut file_mtime_mismatch = false;
        for (name, f1) in &files1 {
            let Some(f2) = files2.get(name) else { continue };
            file_size_mismatch |= f1.size != f2.size;
            file_mtime_mismatch |= f1.mtime != f2.mtime;
            if !f1.cs.is_empty() && !f2.cs.is_empty() {
                file_cs_mismatch |= f1.cs != f2.cs;
            }
        }
        Ok(Self {
            replica1,
            replica2,
            status_mismatch,
            num_files_mismatch,
            file_names_mismatch,
            file_size_mismatch,
            file_cs_mismatch,
            file_mtime_mismatch,
        })
    }

    pub fn replica1(&self) -> &ReplicaInfo {
        &self.replica1
    }

    pub fn replica2(&self) -> &ReplicaInfo {
        &self.replica2
    }

    /// True when both observations come from the same worker.
    pub fn is_self(&self) -> bool {
        self.replica1.worker == self.replica2.worker
    }

    /// True when any mismatch was detected.
    pub fn not_equal(&self) -> bool {
        self.status_mismatch
            || self.num_files_mismatch
            || self.file_names_mismatch
            || self.file_size_mismatch
            || self.file_cs_mismatch
            || self.file_mtime_mismatch
    }

    pub fn status_mismatch(&self) -> bool {
        self.status_mismatch
    }

    pub fn file_names_mismatch(&self) -> bool {
        self.num_files_mismatch || self.file_names_mismatch
    }

    pub fn file_size_mismatch(&self) -> bool {
        self.file_size_mismatch
    }

    pub fn file_cs_mismatch(&self) -> bool {
        self.file_cs_mismatch
    }

    pub fn file_mtime_mismatch(&self) -> bool {
        self.file_mtime_mismatch
    }

    /// Compact mismatch summary for logging.
    pub fn flags(&self) -> String {
        let mut parts = Vec::new();
        if self.status_mismatch {
            parts.push("status");
        }
        if self.num_files_mismatch {
            parts.push("num_files");
        }
        if self.file_names_mismatch {
            parts.push("file_names");
        }
        if self.file_size_mismatch {
            parts.push("file_size");
        }
        if self.file_cs_mismatch {
            parts.push("file_cs");
        }
        if self.file_mtime_mismatch {
            parts.push("file_mtime");
        }
        if parts.is_empty() {
            "equal".to_string()
        } else {
            parts.join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(worker: &str, files: Vec<FileInfo>) -> ReplicaInfo {
        ReplicaInfo {
            status: ReplicaStatus::Complete,
            worker: worker.into(),
            database: "sky_dr1".into(),
            chunk: 42,
            verify_time: 1_000,
            files,
        }
    }

    fn file(name: &str, size: u64, cs: &str) -> FileInfo {
        FileInfo {
            name: name.into(),
            size,
            cs: cs.into(),
            mtime: 7,
        }
    }

    #[test]
    fn equal_replicas_produce_no_diff() {
        let a = replica("w1", vec![file("chunk_42.dat", 10, "ab")]);
        let b = replica("w2", vec![file("chunk_42.dat", 10, "ab")]);
        let diff = ReplicaDiff::new(a, b).unwrap();
        assert!(!diff.not_equal());
        assert!(!diff.is_self());
        assert_eq!(diff.flags(), "equal");
    }

    #[test]
    fn size_and_checksum_mismatches_are_flagged() {
        let a = replica("w1", vec![file("chunk_42.dat", 10, "ab")]);
        let b = replica("w1", vec![file("chunk_42.dat", 11, "cd")]);
        let diff = ReplicaDiff::new(a, b).unwrap();
        assert!(diff.not_equal());
        assert!(diff.is_self());
        assert!(diff.file_size_mismatch());
        assert!(diff.file_cs_mismatch());
        assert!(!diff.file_names_mismatch());
    }

    #[test]
    fn missing_checksum_is_not_a_mismatch() {
        let a = replica("w1", vec![file("chunk_42.dat", 10, "")]);
        let b = replica("w2", vec![file("chunk_42.dat", 10, "cd")]);
        let diff = ReplicaDiff::new(a, b).unwrap();
        assert!(!diff.file_cs_mismatch());
        assert!(!diff.not_equal());
    }

    #[test]
    fn differing_file_sets_are_flagged() {
        let a = replica("w1", vec![file("chunk_42.dat", 10, "ab")]);
        let b = replica(
            "w2",
            vec![file("chunk_42.dat", 10, "ab"), file("chunk_42.idx", 2, "ee")],
        );
        let diff = ReplicaDiff::new(a, b).unwrap();
        assert!(diff.not_equal());
        assert!(diff.file_names_mismatch());
    }

    #[test]
    fn status_mismatch_is_flagged() {
        let a = replica("w1", vec![]);
        let mut b = replica("w2", vec![]);
        b.status = ReplicaStatus::Incomplete;
        let diff = ReplicaDiff::new(a, b).unwrap();
        assert!(diff.status_mismatch());
        assert!(diff.not_equal());
    }

    #[test]
    fn different_objects_are_rejected() {
        let a = replica("w1", vec![]);
        let mut b = replica("w2", vec![]);
        b.chunk = 43;
        assert!(ReplicaDiff::new(a, b).is_err());
    }
}

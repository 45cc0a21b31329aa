//! Exclusive chunk ownership used to serialize mutating jobs per chunk.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use anyhow::ensure;
use serde::{Deserialize, Serialize};

/// A chunk key. Chunk numbers are scoped by database family, so the pair
/// identifies the lockable object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub database_family: String,
    pub number: u32,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.database_family, self.number)
    }
}

/// In-memory table of chunk ownership.
///
/// Owners are opaque non-empty strings (job ids in practice). Locking is
/// advisory: release does not check the caller's identity.
#[derive(Default)]
pub struct ChunkLocker {
    table: Mutex<BTreeMap<Chunk, String>>,
}

impl ChunkLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `chunk` for `owner`. Returns true when the chunk was free or
    /// already held by the same owner, false when another owner holds it.
    pub fn lock(&self, chunk: Chunk, owner: &str) -> anyhow::Result<bool> {
        ensure!(!owner.is_empty(), "chunk owner must not be empty");
        let mut table = self.table.lock().unwrap();
        match table.get(&chunk) {
            Some(current) => Ok(current == owner),
            None => {
                table.insert(chunk, owner.to_string());
                Ok(true)
            }
        }
    }

    /// True when any owner holds `chunk`.
    pub fn is_locked(&self, chunk: &Chunk) -> bool {
        self.table.lock().unwrap().contains_key(chunk)
    }

    /// Current owner of `chunk`, if any.
    pub fn owner_of(&self, chunk: &Chunk) -> Option<String> {
        self.table.lock().unwrap().get(chunk).cloned()
    }

    /// Release `chunk` unconditionally, returning the prior owner.
    pub fn release(&self, chunk: &Chunk) -> Option<String> {
        self.table.lock().unwrap().remove(chunk)
    }

    /// Release every chunk held by `owner`, returning the released chunks.
    pub fn release_owner(&self, owner: &str) -> anyhow::Result<Vec<Chunk>> {
        ensure!(!owner.is_empty(), "chunk owner must not be empty");
        let mut table = self.table.lock().unwrap();
        let chunks: Vec<Chunk> = table
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(c, _)| c.clone())
            .collect();
        for chunk in &chunks {
            table.remove(chunk);
        }
        Ok(chunks)
    }

    /// Snapshot of held chunks grouped by owner, optionally restricted to
    /// one owner.
    pub fn locked(&self, owner: Option<&str>) -> BTreeMap<String, Vec<Chunk>> {
        let table = self.table.lock().unwrap();
        let mut result: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
        for (chunk, o) in table.iter() {
            if owner.is_some_and(|want| want != o) {
                continue;
            }
            result.entry(o.clone()).or_default().push(chunk.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(number: u32) -> Chunk {
        Chunk {
            database_family: "production".into(),
            number,
        }
    }

    #[test]
    fn lock_is_exclusive_between_owners() {
        let locker = ChunkLocker::new();
        assert!(locker.lock(chunk(1), "job-a").unwrap());
        assert!(!locker.lock(chunk(1), "job-b").unwrap());
        assert_eq!(locker.owner_of(&chunk(1)).as_deref(), Some("job-a"));
    }

    #[test]
    fn relock_by_same_owner_is_idempotent() {
        let locker = ChunkLocker::new();
        assert!(locker.lock(chunk(1), "job-a").unwrap());
        assert!(locker.lock(chunk(1), "job-a").unwrap());
        assert_eq!(locker.locked(Some("job-a")).get("job-a").map(Vec::len), Some(1));
    }

    #[test]
    fn release_returns_prior_owner_and_frees_the_chunk() {
        let locker = ChunkLocker::new();
        locker.lock(chunk(1), "job-a").unwrap();
        assert_eq!(locker.release(&chunk(1)).as_deref(), Some("job-a"));
        assert_eq!(locker.release(&chunk(1)), None);
        assert!(locker.lock(chunk(1), "job-b").unwrap());
    }

    #[test]
    fn release_owner_drops_only_that_owners_chunks() {
        let locker = ChunkLocker::new();
        locker.lock(chunk(1), "job-a").unwrap();
        locker.lock(chunk(2), "job-a").unwrap();
        locker.lock(chunk(3), "job-b").unwrap();
        let mut released = locker.release_owner("job-a").unwrap();
        released.sort();
        assert_eq!(released, vec![chunk(1), chunk(2)]);
        assert!(!locker.is_locked(&chunk(1)));
        assert!(locker.is_locked(&chunk(3)));
    }

    #[test]
    fn empty_owner_is_rejected() {
        let locker = ChunkLocker::new();
        assert!(locker.lock(chunk(1), "").is_err());
        assert!(locker.release_owner("").is_err());
    }

    #[test]
    fn locked_snapshot_groups_by_owner() {
        let locker = ChunkLocker::new();
        locker.lock(chunk(1), "job-a").unwrap();
        locker.lock(chunk(2), "job-b").unwrap();
        let all = locker.locked(None);
        assert_eq!(all.len(), 2);
        let only_b = locker.locked(Some("job-b"));
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b["job-b"], vec![chunk(2)]);
    }

    #[test]
    fn interleaved_lock_release_cycle() {
        let locker = ChunkLocker::new();
        assert!(locker.lock(chunk(7), "job-a").unwrap());
        assert!(!locker.lock(chunk(7), "job-b").unwrap());
        locker.release(&chunk(7));
        assert!(locker.lock(chunk(7), "job-b").unwrap());
        assert!(!locker.lock(chunk(7), "job-a").unwrap());
    }
}

//! Durable log of prepared transactions
//!
//! One record per prepared transaction this coordinator initiated. The
//! presence of a record signals that the prepared transaction should be
//! committed unless proven otherwise; its absence after recovery means the
//! distributed transaction aborted or never reached prepare. Records are
//! inserted by the commit protocol at prepare time and deleted by the
//! recovery engine once resolved.

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// One prepared transaction awaiting a commit decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Node group the prepared transaction lives on
    pub group_id: i32,

    /// Globally unique prepared-transaction name
    pub transaction_name: String,

    /// Outer transaction that initiated the prepare, when it did not come
    /// from the main execution context
    pub outer_transaction_id: Option<u64>,
}

impl RecoveryRecord {
    pub fn new(
        group_id: i32,
        transaction_name: impl Into<String>,
        outer_transaction_id: Option<u64>,
    ) -> Self {
        Self {
            group_id,
            transaction_name: transaction_name.into(),
            outer_transaction_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("recovery log storage failed: {0}")]
    Storage(#[from] fjall::Error),

    #[error("recovery log encoding failed: {0}")]
    Encoding(String),
}

/// Value stored against each (group, name) key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    outer_transaction_id: Option<u64>,
}

/// Key format: {group_id BE, 4 bytes}{'/'}{transaction_name}
const GROUP_PREFIX_LEN: usize = 5;

pub struct RecoveryLog {
    keyspace: Keyspace,
    records: PartitionHandle,
}

impl RecoveryLog {
    /// Open (or create) the log under the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let keyspace = fjall::Config::new(path).open()?;
        let records =
            keyspace.open_partition("transaction_records", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, records })
    }

    fn encode_key(group_id: i32, transaction_name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(GROUP_PREFIX_LEN + transaction_name.len());
        key.extend_from_slice(&group_id.to_be_bytes());
        key.push(b'/');
        key.extend_from_slice(transaction_name.as_bytes());
        key
    }

    fn group_prefix(group_id: i32) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(GROUP_PREFIX_LEN);
        prefix.extend_from_slice(&group_id.to_be_bytes());
        prefix.push(b'/');
        prefix
    }

    /// Register that a transaction has been prepared on a worker.
    pub fn append(&self, record: &RecoveryRecord) -> Result<(), LogError> {
        let key = Self::encode_key(record.group_id, &record.transaction_name);
        let stored = StoredRecord {
            outer_transaction_id: record.outer_transaction_id,
        };
        let mut value = Vec::new();
        ciborium::into_writer(&stored, &mut value)
            .map_err(|error| LogError::Encoding(error.to_string()))?;

        self.records.insert(key, value)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Snapshot of every record for one node group.
    pub fn scan_group(&self, group_id: i32) -> Result<Vec<RecoveryRecord>, LogError> {
        let mut records = Vec::new();
        for entry in self.records.prefix(Self::group_prefix(group_id)) {
            let (key, value) = entry?;

            let Some(transaction_name) = key
                .get(GROUP_PREFIX_LEN..)
                .and_then(|name| std::str::from_utf8(name).ok())
            else {
                continue;
            };
            let stored: StoredRecord = ciborium::from_reader(&value[..])
                .map_err(|error| LogError::Encoding(error.to_string()))?;

            records.push(RecoveryRecord {
                group_id,
                transaction_name: transaction_name.to_string(),
                outer_transaction_id: stored.outer_transaction_id,
            });
        }
        Ok(records)
    }

    /// Delete a resolved record.
    pub fn remove(&self, record: &RecoveryRecord) -> Result<(), LogError> {
        let key = Self::encode_key(record.group_id, &record.transaction_name);
        self.records.remove(key)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Delete every record for a node group. Returns how many were removed.
    pub fn delete_group(&self, group_id: i32) -> Result<usize, LogError> {
        let mut keys = Vec::new();
        for entry in self.records.prefix(Self::group_prefix(group_id)) {
            let (key, _) = entry?;
            keys.push(key);
        }
        let removed = keys.len();
        for key in keys {
            self.records.remove(key)?;
        }
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(removed)
    }

    pub fn contains(&self, group_id: i32, transaction_name: &str) -> Result<bool, LogError> {
        Ok(self
            .records
            .contains_key(Self::encode_key(group_id, transaction_name))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_log() -> (tempfile::TempDir, RecoveryLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = RecoveryLog::open(dir.path()).unwrap();
        (dir, log)
    }

    #[test]
    fn test_append_scan_remove() {
        let (_dir, log) = open_temp_log();

        let record = RecoveryRecord::new(2, "lattice_2_10_3_7", None);
        log.append(&record).unwrap();
        assert!(log.contains(2, "lattice_2_10_3_7").unwrap());

        let scanned = log.scan_group(2).unwrap();
        assert_eq!(scanned, vec![record.clone()]);

        // other groups see nothing
        assert!(log.scan_group(3).unwrap().is_empty());

        log.remove(&record).unwrap();
        assert!(!log.contains(2, "lattice_2_10_3_7").unwrap());
        assert!(log.scan_group(2).unwrap().is_empty());
    }

    #[test]
    fn test_outer_transaction_id_round_trips() {
        let (_dir, log) = open_temp_log();

        let record = RecoveryRecord::new(1, "lattice_1_4_9_1", Some(42));
        log.append(&record).unwrap();

        let scanned = log.scan_group(1).unwrap();
        assert_eq!(scanned[0].outer_transaction_id, Some(42));
    }

    #[test]
    fn test_delete_group() {
        let (_dir, log) = open_temp_log();

        log.append(&RecoveryRecord::new(1, "lattice_1_1_1_1", None))
            .unwrap();
        log.append(&RecoveryRecord::new(1, "lattice_1_1_2_1", None))
            .unwrap();
        log.append(&RecoveryRecord::new(2, "lattice_2_1_3_1", None))
            .unwrap();

        assert_eq!(log.delete_group(1).unwrap(), 2);
        assert!(log.scan_group(1).unwrap().is_empty());
        assert_eq!(log.scan_group(2).unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = RecoveryRecord::new(7, "lattice_7_2_5_1", Some(9));
        {
            let log = RecoveryLog::open(dir.path()).unwrap();
            log.append(&record).unwrap();
        }
        let log = RecoveryLog::open(dir.path()).unwrap();
        assert_eq!(log.scan_group(7).unwrap(), vec![record]);
    }
}

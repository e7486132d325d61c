//! Prepared-transaction naming
//!
//! Every prepared transaction this coordinator creates on a worker carries a
//! globally unique name encoding the coordinator group, the originating
//! process, a per-process transaction counter, and a connection sequence
//! number. Recovery parses these names back to decide whether the owning
//! distributed transaction is still in progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix shared by all prepared-transaction names created by this system.
pub const TRANSACTION_NAME_PREFIX: &str = "lattice";

/// Parsed form of a prepared-transaction name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreparedTransactionId {
    /// Group of the coordinator that initiated the transaction
    pub group_id: i32,

    /// Process id of the originating backend
    pub process_id: u32,

    /// Per-process distributed transaction counter
    pub transaction_number: u64,

    /// Sequence number of the connection within the transaction
    pub connection_number: u32,
}

impl PreparedTransactionId {
    pub fn new(
        group_id: i32,
        process_id: u32,
        transaction_number: u64,
        connection_number: u32,
    ) -> Self {
        Self {
            group_id,
            process_id,
            transaction_number,
            connection_number,
        }
    }

    /// Parse a prepared-transaction name.
    ///
    /// Returns `None` for names that do not follow the
    /// `lattice_<group>_<pid>_<txn>_<conn>` shape. Callers must tolerate
    /// this: log rows can be inserted by hand, and a worker may hold
    /// prepared transactions created by something else entirely.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(TRANSACTION_NAME_PREFIX)?;
        let rest = rest.strip_prefix('_')?;

        let mut parts = rest.split('_');
        let group_id = parts.next()?.parse().ok()?;
        let process_id = parts.next()?.parse().ok()?;
        let transaction_number = parts.next()?.parse().ok()?;
        let connection_number = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            group_id,
            process_id,
            transaction_number,
            connection_number,
        })
    }
}

impl fmt::Display for PreparedTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            TRANSACTION_NAME_PREFIX,
            self.group_id,
            self.process_id,
            self.transaction_number,
            self.connection_number
        )
    }
}

impl FromStr for PreparedTransactionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid prepared transaction name: {}", s))
    }
}

/// SQL LIKE pattern matching every prepared-transaction name created by the
/// coordinator with the given group id, with literal underscores escaped.
pub fn transaction_name_prefix_pattern(group_id: i32) -> String {
    format!("{}\\_{}\\_%", TRANSACTION_NAME_PREFIX, group_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::like_match;

    #[test]
    fn test_roundtrip() {
        let id = PreparedTransactionId::new(5, 10, 3, 7);
        assert_eq!(id.to_string(), "lattice_5_10_3_7");
        assert_eq!(PreparedTransactionId::parse("lattice_5_10_3_7"), Some(id));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(PreparedTransactionId::parse(""), None);
        assert_eq!(PreparedTransactionId::parse("lattice"), None);
        assert_eq!(PreparedTransactionId::parse("lattice_1_2_3"), None);
        assert_eq!(PreparedTransactionId::parse("lattice_1_2_3_4_5"), None);
        assert_eq!(PreparedTransactionId::parse("lattice_a_b_c_d"), None);
        assert_eq!(PreparedTransactionId::parse("other_1_2_3_4"), None);
    }

    #[test]
    fn test_prefix_pattern_matches_own_group_only() {
        let pattern = transaction_name_prefix_pattern(12);
        assert!(like_match(&pattern, "lattice_12_10_3_7"));
        assert!(!like_match(&pattern, "lattice_120_10_3_7"));
        assert!(!like_match(&pattern, "lattice_1_10_3_7"));
        assert!(!like_match(&pattern, "latticex12_10_3_7"));
    }
}

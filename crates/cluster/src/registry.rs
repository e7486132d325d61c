//! Per-process distributed-transaction bookkeeping
//!
//! The registry assigns transaction numbers, tracks which distributed
//! transactions are currently in progress in this process, and remembers
//! the fate of outer transactions that initiated prepared transactions
//! from outside the main execution context. Recovery reads all three as
//! point-in-time snapshots.

use lattice_common::PreparedTransactionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Observed fate of an outer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterTransactionState {
    InProgress,
    Committed,
    Aborted,
}

pub struct TransactionRegistry {
    local_group_id: i32,
    process_id: u32,
    next_transaction_number: AtomicU64,
    active: Mutex<HashSet<u64>>,
    outer: Mutex<HashMap<u64, OuterTransactionState>>,
}

impl TransactionRegistry {
    pub fn new(local_group_id: i32, process_id: u32) -> Self {
        Self {
            local_group_id,
            process_id,
            next_transaction_number: AtomicU64::new(1),
            active: Mutex::new(HashSet::new()),
            outer: Mutex::new(HashMap::new()),
        }
    }

    /// Group id of this coordinator; prepared-transaction names embed it.
    pub fn local_group_id(&self) -> i32 {
        self.local_group_id
    }

    /// Start a distributed transaction, returning its number.
    pub fn begin_transaction(&self) -> u64 {
        let number = self.next_transaction_number.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(number);
        number
    }

    /// Finish a distributed transaction (committed or aborted).
    pub fn end_transaction(&self, transaction_number: u64) {
        self.active.lock().remove(&transaction_number);
    }

    /// Point-in-time snapshot of the in-progress transaction numbers.
    pub fn active_transaction_numbers(&self) -> HashSet<u64> {
        self.active.lock().clone()
    }

    /// Name for the prepared transaction this process creates over the
    /// given connection within the given distributed transaction.
    pub fn prepared_transaction_name(
        &self,
        transaction_number: u64,
        connection_number: u32,
    ) -> String {
        PreparedTransactionId::new(
            self.local_group_id,
            self.process_id,
            transaction_number,
            connection_number,
        )
        .to_string()
    }

    /// Record the fate of an outer transaction.
    pub fn set_outer_transaction(&self, outer_transaction_id: u64, state: OuterTransactionState) {
        self.outer.lock().insert(outer_transaction_id, state);
    }

    /// Fate of an outer transaction. `None` means the registry never saw
    /// it, which callers treat as finished-without-commit.
    pub fn outer_transaction_state(&self, outer_transaction_id: u64) -> Option<OuterTransactionState> {
        self.outer.lock().get(&outer_transaction_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_lifecycle() {
        let registry = TransactionRegistry::new(2, 10);

        let first = registry.begin_transaction();
        let second = registry.begin_transaction();
        assert_ne!(first, second);

        let active = registry.active_transaction_numbers();
        assert!(active.contains(&first));
        assert!(active.contains(&second));

        registry.end_transaction(first);
        let active = registry.active_transaction_numbers();
        assert!(!active.contains(&first));
        assert!(active.contains(&second));
    }

    #[test]
    fn test_prepared_transaction_name_embeds_identity() {
        let registry = TransactionRegistry::new(2, 10);
        let name = registry.prepared_transaction_name(3, 7);
        assert_eq!(name, "lattice_2_10_3_7");

        let parsed = PreparedTransactionId::parse(&name).unwrap();
        assert_eq!(parsed.group_id, 2);
        assert_eq!(parsed.process_id, 10);
        assert_eq!(parsed.transaction_number, 3);
        assert_eq!(parsed.connection_number, 7);
    }

    #[test]
    fn test_outer_transaction_state() {
        let registry = TransactionRegistry::new(2, 10);
        assert_eq!(registry.outer_transaction_state(99), None);

        registry.set_outer_transaction(99, OuterTransactionState::InProgress);
        assert_eq!(
            registry.outer_transaction_state(99),
            Some(OuterTransactionState::InProgress)
        );

        registry.set_outer_transaction(99, OuterTransactionState::Committed);
        assert_eq!(
            registry.outer_transaction_state(99),
            Some(OuterTransactionState::Committed)
        );
    }
}

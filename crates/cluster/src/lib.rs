//! Cluster collaborators for the coordination core
//!
//! This crate holds the narrow interfaces the I/O driver and the recovery
//! engine consume: the registry of worker nodes, the connection pool, and
//! the per-process distributed-transaction registry.

mod directory;
mod pool;
mod registry;

pub use directory::{NodeDirectory, NodeRole, WorkerNode};
pub use pool::ConnectionPool;
pub use registry::{OuterTransactionState, TransactionRegistry};

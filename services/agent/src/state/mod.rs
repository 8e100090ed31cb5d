//! Local state persistence for the agent.
//!
//! SQLite storage for app records (status, allocation, retained artifact,
//! last error). The proxy routes file, not this store, is the source of
//! declared running intent during recovery.

mod store;

pub use store::{StateStore, StateStoreError};

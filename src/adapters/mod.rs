//! Adapters layer: concrete implementations of ports.
//!
//! Contains the SQLite storage/audit adapter, the static package catalog,
//! and the log sanitization writer for `tracing` output.

pub mod catalog;
pub mod sanitize;
pub mod sqlite;

pub use catalog::StaticCatalog;
pub use sqlite::{SqliteStore, StorageError};

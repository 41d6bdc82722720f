//! Ports layer: trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the application services and external systems (storage, the
//! audit sink, the package catalog).

mod audit;
mod catalog;
mod storage;

pub use audit::AuditSink;
pub use catalog::PackageCatalog;
pub use storage::{EntitlementStore, PatientStore, ReportStore};

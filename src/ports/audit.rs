//! Audit sink port.

use crate::domain::AuditEntry;

/// Write-only, append-only sink for audit entries.
///
/// Implementations must never expose an update or delete path; an entry,
/// once recorded, is an immutable fact. Reporting/compliance export is out
/// of scope for this core.
pub trait AuditSink: Send + Sync {
    /// Error type for sink operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append one entry.
    ///
    /// # Errors
    /// Returns error if the entry could not be persisted. Callers decide
    /// whether that failure propagates (see `AuditPolicy`); it must never
    /// be silently dropped.
    fn record(&self, entry: &AuditEntry) -> Result<(), Self::Error>;
}

//! Application layer: services orchestrating domain logic and ports.

mod entitlement;
mod patient;
mod reports;

pub use entitlement::EntitlementService;
pub use patient::PatientService;
pub use reports::ReportService;

use crate::adapters::StorageError;
use crate::CoreError;

/// How audit-write failures on PHI mutations are handled.
///
/// The primary write has already committed when the audit entry is
/// recorded, so the choice is between surfacing the gap to the caller and
/// logging it while the request succeeds. Reads are always audited
/// best-effort regardless of this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditPolicy {
    /// Log the failure at error level and let the operation succeed.
    #[default]
    BestEffort,
    /// Fail the operation with `CoreError::AuditWrite`. The primary
    /// mutation is not rolled back.
    Required,
}

pub(crate) fn storage<E: Into<StorageError>>(err: E) -> CoreError {
    CoreError::Storage(err.into())
}

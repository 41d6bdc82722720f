//! # Nutriguard
//!
//! Entitlement, protection and reconciliation core for a health records
//! backend. The surrounding service (HTTP routing, report extraction,
//! notifications) lives elsewhere; this crate owns the three pieces with
//! real data-integrity risk:
//!
//! - per-user daily usage quotas gating free and paid tiers
//! - field-level encryption and an append-only audit trail for
//!   personally identifying health data
//! - reconciliation of newly extracted diagnostic reports into a
//!   versioned longitudinal record
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: core business types, the field cipher and the merge algorithm
//! - `ports`: trait definitions for storage, audit and package lookup
//! - `adapters`: concrete implementations (SQLite, static catalog, log
//!   sanitization)
//! - `application`: services orchestrating domain and ports

pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

pub use application::{AuditPolicy, EntitlementService, PatientService, ReportService};
pub use domain::{
    DiagnosticReport, ExtractedReport, FieldCipher, PlanType, QuotaDecision, ResourceKind,
    Subscription, UsageStats,
};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for the entitlement/protection/reconciliation core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Daily quota exhausted for the free tier. Non-retryable until the
    /// counter resets at midnight UTC or the user upgrades.
    #[error("daily {resource} limit reached ({limit} per day on the free tier), resets at midnight UTC")]
    LimitExceeded {
        resource: domain::ResourceKind,
        limit: i64,
    },

    /// Every user must hold exactly one active subscription; a missing row
    /// is a data-integrity bug, not a user error.
    #[error("no active subscription for user {0}")]
    SubscriptionNotFound(String),

    /// No package reference data configured for a plan.
    #[error("no package configured for plan {0}")]
    PackageNotConfigured(domain::PlanType),

    /// Cryptographic failure: key misconfiguration, encryption failure or
    /// an authentication tag mismatch on decrypt.
    #[error("cryptographic operation failed: {0}")]
    Crypto(#[from] domain::CipherError),

    /// Incoming extracted report failed structural validation; the stored
    /// report is left untouched.
    #[error("malformed extracted report: {0}")]
    MergeValidation(#[from] domain::ReportValidationError),

    /// The audit entry for a completed PHI mutation could not be written.
    /// The primary operation has already committed; see `AuditPolicy`.
    #[error("audit write failed: {0}")]
    AuditWrite(String),

    /// Storage operation failed.
    #[error("storage operation failed: {0}")]
    Storage(#[from] adapters::StorageError),

    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record that must be unique per user already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invariant violated inside the process (poisoned lock and similar).
    #[error("internal error: {0}")]
    Internal(String),
}

//! Domain layer: core business types and logic.
//!
//! Everything here is pure: no storage, no network. The field cipher holds
//! only an immutable key, and the report merge is a deterministic function
//! of its inputs.

mod audit;
mod cipher;
mod package;
mod patient;
mod report;
mod subscription;

pub use audit::{AuditAction, AuditContext, AuditEntry, AuditOutcome};
pub use cipher::{CipherError, FieldCipher, KEY_LEN};
pub use package::{BillingPeriod, Package};
pub use patient::{HealthPersona, PersonaUpdate, PiiProfile, PiiUpdate, ProtectedIdentity};
pub use report::{
    merge, DiagnosticReport, ExtractedReport, ExtractedResult, HistoryEntry, MergeOutcome,
    ReportValidationError, TestResult,
};
pub use subscription::{
    PlanType, QuotaDecision, ResourceKind, Subscription, SubscriptionStatus, UsageStats,
    TRIAL_PERIOD_DAYS, UNLIMITED,
};

/// Generate a UUID v4 string using a CSPRNG.
///
/// Uses ChaCha20Rng seeded from OS entropy so identifiers are unpredictable
/// on all platforms.
#[must_use]
pub fn new_entity_id() -> String {
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_entropy();
    let bytes: [u8; 16] = rng.gen();

    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        (bytes[6] & 0x0f) | 0x40, bytes[7],
        (bytes[8] & 0x3f) | 0x80, bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}

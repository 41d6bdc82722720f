//! Audit trail types.
//!
//! Every touch of protected identity data and every report reconciliation
//! produces exactly one [`AuditEntry`]: who acted, whose data, what
//! happened, when, and from where. Entries are append-only facts; nothing
//! in this crate updates or deletes one after insertion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_entity_id;

/// Distinguished action families for audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Read of a protected field.
    PhiAccess,
    PhiCreate,
    PhiUpdate,
    PhiDelete,
    /// Account-deletion side effect: persona detached from its owner.
    PhiAnonymize,
    /// First diagnostic report stored for a user.
    ReportCreate,
    /// Reconciliation of a new report into the stored one.
    ReportUpdate,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhiAccess => "phi_access",
            Self::PhiCreate => "phi_create",
            Self::PhiUpdate => "phi_update",
            Self::PhiDelete => "phi_delete",
            Self::PhiAnonymize => "phi_anonymize",
            Self::ReportCreate => "report_create",
            Self::ReportUpdate => "report_update",
        }
    }

    /// Parse a stored action code.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "phi_access" => Some(Self::PhiAccess),
            "phi_create" => Some(Self::PhiCreate),
            "phi_update" => Some(Self::PhiUpdate),
            "phi_delete" => Some(Self::PhiDelete),
            "phi_anonymize" => Some(Self::PhiAnonymize),
            "report_create" => Some(Self::ReportCreate),
            "report_update" => Some(Self::ReportUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the audited operation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Network/request context captured alongside an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    #[must_use]
    pub fn new(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
        }
    }
}

/// Immutable audit fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    /// Acting user; `None` for system-initiated actions.
    pub actor_id: Option<String>,
    /// The user whose data was touched.
    pub subject_user_id: String,
    pub action: AuditAction,
    /// Resource name, e.g. `protected_identity` or `diagnostic_report`.
    pub resource: String,
    pub context: AuditContext,
    /// Free-form structured payload (modified fields, merge summary, ...).
    pub detail: Option<serde_json::Value>,
    pub outcome: AuditOutcome,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// A successful entry with no detail payload.
    #[must_use]
    pub fn new(
        actor_id: Option<&str>,
        subject_user_id: &str,
        action: AuditAction,
        resource: &str,
        context: AuditContext,
    ) -> Self {
        Self {
            id: new_entity_id(),
            actor_id: actor_id.map(str::to_string),
            subject_user_id: subject_user_id.to_string(),
            action,
            resource: resource.to_string(),
            context,
            detail: None,
            outcome: AuditOutcome::Success,
            created_at: Utc::now(),
        }
    }

    /// Attach a structured detail payload.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Stamp the entry with the operation's logical instant instead of the
    /// wall clock at construction time.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark the entry as recording a failed operation.
    #[must_use]
    pub fn failed(mut self) -> Self {
        self.outcome = AuditOutcome::Failure;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_codes_roundtrip() {
        for action in [
            AuditAction::PhiAccess,
            AuditAction::PhiCreate,
            AuditAction::PhiUpdate,
            AuditAction::PhiDelete,
            AuditAction::PhiAnonymize,
            AuditAction::ReportCreate,
            AuditAction::ReportUpdate,
        ] {
            assert_eq!(AuditAction::from_str_opt(action.as_str()), Some(action));
        }
        assert_eq!(AuditAction::from_str_opt("phi_read"), None);
    }

    #[test]
    fn test_entry_construction() {
        let entry = AuditEntry::new(
            Some("actor-1"),
            "subject-1",
            AuditAction::PhiUpdate,
            "protected_identity",
            AuditContext::new(Some("10.0.0.1".into()), None),
        )
        .with_detail(serde_json::json!({"fields_modified": ["email"]}));

        assert_eq!(entry.actor_id.as_deref(), Some("actor-1"));
        assert_eq!(entry.subject_user_id, "subject-1");
        assert_eq!(entry.outcome, AuditOutcome::Success);
        assert!(entry.detail.is_some());
    }

    #[test]
    fn test_entry_carries_the_operation_instant() {
        let instant = Utc::now() - chrono::Duration::days(3);
        let entry = AuditEntry::new(
            None,
            "subject-1",
            AuditAction::PhiUpdate,
            "protected_identity",
            AuditContext::default(),
        )
        .at(instant);
        assert_eq!(entry.created_at, instant);
    }

    #[test]
    fn test_system_actions_have_no_actor() {
        let entry = AuditEntry::new(
            None,
            "subject-1",
            AuditAction::PhiAnonymize,
            "patient_data",
            AuditContext::default(),
        );
        assert!(entry.actor_id.is_none());
    }
}

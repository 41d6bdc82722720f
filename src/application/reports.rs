//! Diagnostic report ingestion and reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::{storage, AuditPolicy};
use crate::adapters::StorageError;
use crate::domain::{
    merge, AuditAction, AuditContext, AuditEntry, DiagnosticReport, ExtractedReport, MergeOutcome,
};
use crate::ports::{AuditSink, ReportStore};
use crate::{CoreError, Result};

const REPORT_RESOURCE: &str = "diagnostic_report";

/// Service folding newly extracted reports into each user's live record.
///
/// The merge itself is pure; this service owns the read-modify-write
/// around it and serializes it per user, so two uploads for the same user
/// cannot interleave and lose history. Different users never contend.
pub struct ReportService<S, A> {
    store: Arc<S>,
    audit: Arc<A>,
    policy: AuditPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S, A> ReportService<S, A>
where
    S: ReportStore,
    S::Error: Into<StorageError>,
    A: AuditSink,
{
    pub fn new(store: Arc<S>, audit: Arc<A>) -> Self {
        Self {
            store,
            audit,
            policy: AuditPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set how audit-write failures are handled.
    #[must_use]
    pub fn with_policy(mut self, policy: AuditPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate a loosely-typed extraction payload and reconcile it into
    /// the user's live report.
    ///
    /// Validation happens before anything is read or locked; a malformed
    /// payload leaves the stored report untouched. A payload that changes
    /// nothing (same values re-uploaded) is a no-op: no save, no version
    /// bump, no audit entry.
    ///
    /// # Errors
    /// Returns [`CoreError::MergeValidation`] for malformed payloads, or
    /// error if the storage operation fails.
    pub fn ingest_json(
        &self,
        user_id: &str,
        payload: &serde_json::Value,
        context: &AuditContext,
    ) -> Result<MergeOutcome> {
        self.ingest_json_at(user_id, payload, context, Utc::now())
    }

    pub fn ingest_json_at(
        &self,
        user_id: &str,
        payload: &serde_json::Value,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let extracted = ExtractedReport::from_json(payload)?;
        self.ingest_at(user_id, &extracted, context, now)
    }

    /// Reconcile an already-validated extracted report.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn ingest_at(
        &self,
        user_id: &str,
        extracted: &ExtractedReport,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let lock = self.user_lock(user_id)?;
        let result = match lock.lock() {
            Ok(_guard) => self.reconcile(user_id, extracted, context, now),
            Err(_) => Err(CoreError::Internal("report lock poisoned".to_string())),
        };
        drop(lock);
        self.evict_uncontended_lock(user_id);
        result
    }

    fn reconcile(
        &self,
        user_id: &str,
        extracted: &ExtractedReport,
        context: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let existing = self.store.live_report(user_id).map_err(storage)?;
        let created = existing.is_none();
        let outcome = merge(existing.as_ref(), extracted, user_id, now);

        if created || outcome.changed() {
            self.store.save_report(&outcome.report).map_err(storage)?;

            tracing::info!(
                user_id = %user_id,
                version = outcome.report.version,
                tests_updated = outcome.tests_updated.len(),
                tests_added = outcome.tests_added.len(),
                "Reconciled diagnostic report"
            );

            let action = if created {
                AuditAction::ReportCreate
            } else {
                AuditAction::ReportUpdate
            };
            self.record(
                AuditEntry::new(
                    Some(user_id),
                    user_id,
                    action,
                    REPORT_RESOURCE,
                    context.clone(),
                )
                .with_detail(serde_json::json!({
                    "version": outcome.report.version,
                    "testsUpdated": outcome.tests_updated,
                    "testsAdded": outcome.tests_added,
                }))
                .at(now),
            )?;
        } else {
            tracing::debug!(user_id = %user_id, "Incoming report changed nothing");
        }

        Ok(outcome)
    }

    /// The user's live report, if one exists.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn latest(&self, user_id: &str) -> Result<Option<DiagnosticReport>> {
        self.store.live_report(user_id).map_err(storage)
    }

    fn user_lock(&self, user_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| CoreError::Internal("report lock registry poisoned".to_string()))?;
        Ok(locks.entry(user_id.to_string()).or_default().clone())
    }

    // Keeps the registry from growing one entry per user ever seen: once
    // the caller has dropped its handle, an entry held only by the map is
    // safe to remove because any later acquirer goes through the registry
    // mutex again.
    fn evict_uncontended_lock(&self, user_id: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(user_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(user_id);
            }
        }
    }

    fn record(&self, entry: AuditEntry) -> Result<()> {
        if let Err(err) = self.audit.record(&entry) {
            tracing::error!(
                action = %entry.action,
                subject = %entry.subject_user_id,
                error = %err,
                "Audit write failed"
            );
            if self.policy == AuditPolicy::Required {
                return Err(CoreError::AuditWrite(err.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteStore;
    use chrono::TimeZone;

    fn service() -> (ReportService<SqliteStore, SqliteStore>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().expect("Should create db"));
        let service = ReportService::new(Arc::clone(&store), Arc::clone(&store));
        (service, store)
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn payload(pairs: &[(&str, &str)]) -> serde_json::Value {
        let results: Vec<serde_json::Value> = pairs
            .iter()
            .map(|(name, value)| serde_json::json!({"testName": name, "value": value}))
            .collect();
        serde_json::json!({ "results": results })
    }

    #[test]
    fn test_first_ingest_creates_version_one() {
        let (service, store) = service();
        let ctx = AuditContext::default();

        let outcome = service
            .ingest_json_at("user-1", &payload(&[("RBC", "4.5")]), &ctx, at(2025, 12, 1))
            .expect("Should ingest");
        assert_eq!(outcome.report.version, 1);

        let entries = store
            .audit_entries_for_subject("user-1")
            .expect("Should load");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::ReportCreate);
        assert_eq!(entries[0].created_at, at(2025, 12, 1));
    }

    #[test]
    fn test_reingest_updates_and_archives() {
        let (service, store) = service();
        let ctx = AuditContext::default();

        service
            .ingest_json_at("user-1", &payload(&[("RBC", "4.5")]), &ctx, at(2025, 12, 1))
            .expect("Should ingest");
        let outcome = service
            .ingest_json_at(
                "user-1",
                &payload(&[("RBC", "4.8"), ("Platelets", "250")]),
                &ctx,
                at(2025, 12, 26),
            )
            .expect("Should ingest");

        assert_eq!(outcome.report.version, 2);
        assert_eq!(outcome.tests_updated, vec!["RBC"]);
        assert_eq!(outcome.tests_added, vec!["Platelets"]);

        let stored = service
            .latest("user-1")
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(stored, outcome.report);

        let entries = store
            .audit_entries_for_subject("user-1")
            .expect("Should load");
        assert_eq!(entries[1].action, AuditAction::ReportUpdate);
        let detail = entries[1].detail.as_ref().expect("detail recorded");
        assert_eq!(detail["testsUpdated"][0], "RBC");
        assert_eq!(detail["testsAdded"][0], "Platelets");
    }

    #[test]
    fn test_double_ingest_is_a_noop() {
        let (service, store) = service();
        let ctx = AuditContext::default();
        let doc = payload(&[("RBC", "4.5"), ("WBC", "7.1")]);

        service
            .ingest_json_at("user-1", &doc, &ctx, at(2025, 12, 1))
            .expect("Should ingest");
        let again = service
            .ingest_json_at("user-1", &doc, &ctx, at(2025, 12, 2))
            .expect("Should ingest");

        assert!(!again.changed());
        assert_eq!(again.report.version, 1);

        // The no-op is not audited; only the creation is.
        let entries = store
            .audit_entries_for_subject("user-1")
            .expect("Should load");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_narrative_only_update_is_persisted() {
        let (service, store) = service();
        let ctx = AuditContext::default();

        let mut doc = payload(&[("RBC", "4.5")]);
        doc["clinicalFindings"] = serde_json::json!("Unremarkable");
        service
            .ingest_json_at("user-1", &doc, &ctx, at(2025, 12, 1))
            .expect("Should ingest");

        // Same results, different narrative: still a new version.
        doc["clinicalFindings"] = serde_json::json!("Mild anemia");
        let outcome = service
            .ingest_json_at("user-1", &doc, &ctx, at(2025, 12, 26))
            .expect("Should ingest");
        assert!(outcome.changed());
        assert_eq!(outcome.report.version, 2);

        let stored = service
            .latest("user-1")
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.clinical_findings.as_deref(), Some("Mild anemia"));

        let entries = store
            .audit_entries_for_subject("user-1")
            .expect("Should load");
        assert_eq!(entries[1].action, AuditAction::ReportUpdate);
    }

    #[test]
    fn test_lock_registry_drains_after_ingest() {
        let (service, _) = service();
        let ctx = AuditContext::default();

        service
            .ingest_json_at("user-1", &payload(&[("RBC", "4.5")]), &ctx, at(2025, 12, 1))
            .expect("Should ingest");
        service
            .ingest_json_at("user-2", &payload(&[("WBC", "7.1")]), &ctx, at(2025, 12, 1))
            .expect("Should ingest");

        let locks = service.locks.lock().expect("Registry should be healthy");
        assert!(locks.is_empty());
    }

    #[test]
    fn test_malformed_payload_leaves_stored_report_untouched() {
        let (service, _) = service();
        let ctx = AuditContext::default();

        let first = service
            .ingest_json_at("user-1", &payload(&[("RBC", "4.5")]), &ctx, at(2025, 12, 1))
            .expect("Should ingest");

        let err = service
            .ingest_json_at(
                "user-1",
                &serde_json::json!({"results": "not an array"}),
                &ctx,
                at(2025, 12, 2),
            )
            .expect_err("Should reject");
        assert!(matches!(err, CoreError::MergeValidation(_)));

        let stored = service
            .latest("user-1")
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(stored, first.report);
    }

    #[test]
    fn test_concurrent_ingests_lose_no_tests() {
        let (service, _) = service();
        let service = Arc::new(service);
        let ctx = AuditContext::default();

        service
            .ingest_json_at("user-1", &payload(&[("RBC", "4.5")]), &ctx, at(2025, 12, 1))
            .expect("Should ingest");

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    let name = format!("Test-{i}");
                    service
                        .ingest_json_at(
                            "user-1",
                            &payload(&[(name.as_str(), "1")]),
                            &AuditContext::default(),
                            at(2025, 12, 10),
                        )
                        .expect("Should ingest");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Thread should not panic");
        }

        let stored = service
            .latest("user-1")
            .expect("Should load")
            .expect("Should exist");
        // One original test plus all four concurrent additions survived.
        assert_eq!(stored.results.len(), 5);
        assert_eq!(stored.version, 5);
    }
}

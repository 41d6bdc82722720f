//! SQLite adapter: implementation of the storage and audit ports.
//!
//! Provides local persistence for subscriptions, usage counters, protected
//! identities, health personas, audit entries and live report documents.
//!
//! # Concurrency
//!
//! The connection is protected by a `Mutex`; a poisoned mutex (from a
//! panic in another thread) causes a panic. This fail-fast behavior is
//! intentional for data integrity in healthcare applications. Correctness
//! of the quota path does not rely on the mutex alone: the reservation is
//! a single conditional `UPDATE` whose affected-row count is the decision,
//! and the trial-expiry transition is a conditional `UPDATE` that is a
//! no-op when another caller already performed it.
//!
//! # Timestamps
//!
//! Instants are stored as RFC 3339 TEXT in UTC; calendar dates as
//! `YYYY-MM-DD` TEXT. The `(user_id, date)` primary key on the counter
//! table enforces at most one counter row per user per day.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{
    AuditAction, AuditContext, AuditEntry, AuditOutcome, DiagnosticReport, HealthPersona,
    PlanType, ProtectedIdentity, ResourceKind, Subscription, SubscriptionStatus,
};
use crate::ports::{AuditSink, EntitlementStore, PatientStore, ReportStore};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// SQLite storage adapter implementing every storage port plus the audit
/// sink.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                plan_type TEXT NOT NULL,
                status TEXT NOT NULL,
                end_date TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subscriptions_user
                ON subscriptions(user_id, status, created_at DESC);

            CREATE TABLE IF NOT EXISTS usage_counters (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                upload_count INTEGER NOT NULL DEFAULT 0,
                analysis_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, date)
            );

            CREATE TABLE IF NOT EXISTS protected_identities (
                user_id TEXT PRIMARY KEY,
                full_name_encrypted TEXT,
                email_encrypted TEXT,
                phone_number_encrypted TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS health_personas (
                id TEXT PRIMARY KEY,
                user_id TEXT UNIQUE,
                gender TEXT,
                date_of_birth TEXT,
                blood_group TEXT,
                height_cm REAL,
                weight_kg REAL,
                location TEXT,
                anonymized_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_entries (
                id TEXT PRIMARY KEY,
                actor_id TEXT,
                subject_user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                ip_address TEXT,
                user_agent TEXT,
                detail TEXT,
                outcome TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_subject_date
                ON audit_entries(subject_user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_action_date
                ON audit_entries(action, created_at);

            CREATE TABLE IF NOT EXISTS diagnostic_reports (
                user_id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                version INTEGER NOT NULL,
                last_updated TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Audit entries for a subject user, oldest first. Used by tests and
    /// by operational tooling; there is no update or delete counterpart.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn audit_entries_for_subject(
        &self,
        subject_user_id: &str,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let conn = self.conn.lock().expect("Lock failed");

        let mut stmt = conn.prepare(
            r"
            SELECT id, actor_id, subject_user_id, action, resource,
                   ip_address, user_agent, detail, outcome, created_at
            FROM audit_entries
            WHERE subject_user_id = ?1
            ORDER BY created_at ASC, id ASC
            ",
        )?;

        let rows = stmt
            .query_map(params![subject_user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, actor, subject, action, resource, ip, ua, detail, outcome, created)| {
                    let action = AuditAction::from_str_opt(&action).ok_or_else(|| {
                        StorageError::Serialization(format!("unknown audit action: {action}"))
                    })?;
                    let detail = detail
                        .map(|d| {
                            serde_json::from_str(&d)
                                .map_err(|e| StorageError::Serialization(e.to_string()))
                        })
                        .transpose()?;
                    Ok(AuditEntry {
                        id,
                        actor_id: actor,
                        subject_user_id: subject,
                        action,
                        resource,
                        context: AuditContext::new(ip, ua),
                        detail,
                        outcome: if outcome == "failure" {
                            AuditOutcome::Failure
                        } else {
                            AuditOutcome::Success
                        },
                        created_at: parse_instant(&created)?,
                    })
                },
            )
            .collect()
    }
}

fn instant(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {raw:?}: {e}")))
}

fn day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn plan_type_from_str(raw: &str) -> Result<PlanType, StorageError> {
    match raw {
        "free" => Ok(PlanType::Free),
        "paid" => Ok(PlanType::Paid),
        other => Err(StorageError::Serialization(format!(
            "unknown plan type: {other}"
        ))),
    }
}

fn status_from_str(raw: &str) -> Result<SubscriptionStatus, StorageError> {
    match raw {
        "active" => Ok(SubscriptionStatus::Active),
        "inactive" => Ok(SubscriptionStatus::Inactive),
        other => Err(StorageError::Serialization(format!(
            "unknown subscription status: {other}"
        ))),
    }
}

impl EntitlementStore for SqliteStore {
    type Error = StorageError;

    fn insert_subscription(&self, subscription: &Subscription) -> Result<(), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute(
            r"
            INSERT INTO subscriptions (id, user_id, plan_type, status, end_date, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                subscription.id,
                subscription.user_id,
                subscription.plan_type.as_str(),
                subscription.status.as_str(),
                subscription.end_date.map(instant),
                instant(subscription.created_at),
            ],
        )?;

        tracing::debug!(
            subscription_id = %subscription.id,
            plan = %subscription.plan_type,
            "Inserted subscription"
        );
        Ok(())
    }

    fn active_subscription(&self, user_id: &str) -> Result<Option<Subscription>, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let row = conn
            .query_row(
                r"
                SELECT id, user_id, plan_type, status, end_date, created_at
                FROM subscriptions
                WHERE user_id = ?1 AND status = 'active'
                ORDER BY created_at DESC
                LIMIT 1
                ",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, user_id, plan, status, end_date, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Subscription {
            id,
            user_id,
            plan_type: plan_type_from_str(&plan)?,
            status: status_from_str(&status)?,
            end_date: end_date.as_deref().map(parse_instant).transpose()?,
            created_at: parse_instant(&created_at)?,
        }))
    }

    fn expire_subscription(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        // Conditional on the pre-transition state: a second concurrent
        // caller matches zero rows and reports a no-op, never an error.
        let changed = conn.execute(
            r"
            UPDATE subscriptions
            SET plan_type = 'free', end_date = NULL
            WHERE id = ?1
              AND plan_type = 'paid'
              AND end_date IS NOT NULL
              AND end_date < ?2
            ",
            params![subscription_id, instant(now)],
        )?;

        Ok(changed == 1)
    }

    fn deactivate_subscription(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute(
            "UPDATE subscriptions SET status = 'inactive', end_date = ?2 WHERE id = ?1",
            params![subscription_id, instant(now)],
        )?;
        Ok(())
    }

    fn try_reserve_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
        kind: ResourceKind,
        limit: i64,
    ) -> Result<Option<i64>, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");
        let date = day(date);
        let now = instant(Utc::now());

        // Lazy creation; the (user_id, date) primary key keeps this to at
        // most one row per user per day even under concurrent callers.
        conn.execute(
            r"
            INSERT OR IGNORE INTO usage_counters (user_id, date, upload_count, analysis_count, updated_at)
            VALUES (?1, ?2, 0, 0, ?3)
            ",
            params![user_id, date, now],
        )?;

        // Check and increment in one conditional statement. Two concurrent
        // requests at count = limit - 1 cannot both pass: the second one
        // matches zero rows.
        let sql = match kind {
            ResourceKind::Upload => {
                r"
                UPDATE usage_counters
                SET upload_count = upload_count + 1, updated_at = ?4
                WHERE user_id = ?1 AND date = ?2 AND upload_count < ?3
                "
            }
            ResourceKind::Analysis => {
                r"
                UPDATE usage_counters
                SET analysis_count = analysis_count + 1, updated_at = ?4
                WHERE user_id = ?1 AND date = ?2 AND analysis_count < ?3
                "
            }
        };
        let changed = conn.execute(sql, params![user_id, date, limit, now])?;

        if changed == 0 {
            return Ok(None);
        }

        let column = match kind {
            ResourceKind::Upload => "upload_count",
            ResourceKind::Analysis => "analysis_count",
        };
        let count: i64 = conn.query_row(
            &format!("SELECT {column} FROM usage_counters WHERE user_id = ?1 AND date = ?2"),
            params![user_id, date],
            |row| row.get(0),
        )?;

        Ok(Some(count))
    }

    fn usage_on(&self, user_id: &str, date: NaiveDate) -> Result<(i64, i64), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let counts = conn
            .query_row(
                r"
                SELECT upload_count, analysis_count
                FROM usage_counters
                WHERE user_id = ?1 AND date = ?2
                ",
                params![user_id, day(date)],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(counts.unwrap_or((0, 0)))
    }
}

impl PatientStore for SqliteStore {
    type Error = StorageError;

    fn insert_identity(&self, identity: &ProtectedIdentity) -> Result<(), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute(
            r"
            INSERT INTO protected_identities (
                user_id, full_name_encrypted, email_encrypted,
                phone_number_encrypted, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                identity.user_id,
                identity.full_name_encrypted,
                identity.email_encrypted,
                identity.phone_number_encrypted,
                instant(identity.created_at),
                instant(identity.updated_at),
            ],
        )?;
        Ok(())
    }

    fn identity(&self, user_id: &str) -> Result<Option<ProtectedIdentity>, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let row = conn
            .query_row(
                r"
                SELECT user_id, full_name_encrypted, email_encrypted,
                       phone_number_encrypted, created_at, updated_at
                FROM protected_identities
                WHERE user_id = ?1
                ",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, name, email, phone, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(ProtectedIdentity {
            user_id,
            full_name_encrypted: name,
            email_encrypted: email,
            phone_number_encrypted: phone,
            created_at: parse_instant(&created_at)?,
            updated_at: parse_instant(&updated_at)?,
        }))
    }

    fn update_identity(&self, identity: &ProtectedIdentity) -> Result<(), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let changed = conn.execute(
            r"
            UPDATE protected_identities
            SET full_name_encrypted = ?2, email_encrypted = ?3,
                phone_number_encrypted = ?4, updated_at = ?5
            WHERE user_id = ?1
            ",
            params![
                identity.user_id,
                identity.full_name_encrypted,
                identity.email_encrypted,
                identity.phone_number_encrypted,
                instant(identity.updated_at),
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::NotFound(format!(
                "protected identity for user {}",
                identity.user_id
            )));
        }
        Ok(())
    }

    fn delete_identity(&self, user_id: &str) -> Result<bool, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let deleted = conn.execute(
            "DELETE FROM protected_identities WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(deleted > 0)
    }

    fn insert_persona(&self, persona: &HealthPersona) -> Result<(), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute(
            r"
            INSERT INTO health_personas (
                id, user_id, gender, date_of_birth, blood_group,
                height_cm, weight_kg, location, anonymized_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                persona.id,
                persona.user_id,
                persona.gender,
                persona.date_of_birth.map(day),
                persona.blood_group,
                persona.height_cm,
                persona.weight_kg,
                persona.location,
                persona.anonymized_at.map(instant),
                instant(persona.created_at),
                instant(persona.updated_at),
            ],
        )?;
        Ok(())
    }

    fn persona_for_user(&self, user_id: &str) -> Result<Option<HealthPersona>, Self::Error> {
        self.persona_where("user_id = ?1", user_id)
    }

    fn persona_by_id(&self, persona_id: &str) -> Result<Option<HealthPersona>, Self::Error> {
        self.persona_where("id = ?1", persona_id)
    }

    fn update_persona(&self, persona: &HealthPersona) -> Result<(), Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let changed = conn.execute(
            r"
            UPDATE health_personas
            SET gender = ?2, date_of_birth = ?3, blood_group = ?4,
                height_cm = ?5, weight_kg = ?6, location = ?7, updated_at = ?8
            WHERE id = ?1
            ",
            params![
                persona.id,
                persona.gender,
                persona.date_of_birth.map(day),
                persona.blood_group,
                persona.height_cm,
                persona.weight_kg,
                persona.location,
                instant(persona.updated_at),
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::NotFound(format!(
                "health persona {}",
                persona.id
            )));
        }
        Ok(())
    }

    fn anonymize_persona(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let changed = conn.execute(
            r"
            UPDATE health_personas
            SET user_id = NULL, anonymized_at = ?2, updated_at = ?2
            WHERE user_id = ?1
            ",
            params![user_id, instant(now)],
        )?;
        Ok(changed > 0)
    }
}

impl SqliteStore {
    fn persona_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> Result<Option<HealthPersona>, StorageError> {
        let conn = self.conn.lock().expect("Lock failed");

        let row = conn
            .query_row(
                &format!(
                    r"
                    SELECT id, user_id, gender, date_of_birth, blood_group,
                           height_cm, weight_kg, location, anonymized_at,
                           created_at, updated_at
                    FROM health_personas
                    WHERE {predicate}
                    "
                ),
                params![value],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            user_id,
            gender,
            dob,
            blood_group,
            height_cm,
            weight_kg,
            location,
            anonymized_at,
            created_at,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        let date_of_birth = dob
            .map(|raw| {
                NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .map_err(|e| StorageError::Serialization(format!("bad date {raw:?}: {e}")))
            })
            .transpose()?;

        Ok(Some(HealthPersona {
            id,
            user_id,
            gender,
            date_of_birth,
            blood_group,
            height_cm,
            weight_kg,
            location,
            anonymized_at: anonymized_at.as_deref().map(parse_instant).transpose()?,
            created_at: parse_instant(&created_at)?,
            updated_at: parse_instant(&updated_at)?,
        }))
    }
}

impl AuditSink for SqliteStore {
    type Error = StorageError;

    fn record(&self, entry: &AuditEntry) -> Result<(), Self::Error> {
        let detail = entry
            .detail
            .as_ref()
            .map(|d| {
                serde_json::to_string(d).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()?;

        let conn = self.conn.lock().expect("Lock failed");

        // Insert only. Audit rows are immutable facts; this adapter has no
        // update or delete path for them.
        conn.execute(
            r"
            INSERT INTO audit_entries (
                id, actor_id, subject_user_id, action, resource,
                ip_address, user_agent, detail, outcome, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                entry.id,
                entry.actor_id,
                entry.subject_user_id,
                entry.action.as_str(),
                entry.resource,
                entry.context.ip_address,
                entry.context.user_agent,
                detail,
                entry.outcome.as_str(),
                instant(entry.created_at),
            ],
        )?;
        Ok(())
    }
}

impl ReportStore for SqliteStore {
    type Error = StorageError;

    fn live_report(&self, user_id: &str) -> Result<Option<DiagnosticReport>, Self::Error> {
        let conn = self.conn.lock().expect("Lock failed");

        let document = conn
            .query_row(
                "SELECT document FROM diagnostic_reports WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        document
            .map(|doc| {
                serde_json::from_str(&doc).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn save_report(&self, report: &DiagnosticReport) -> Result<(), Self::Error> {
        let document = serde_json::to_string(report)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().expect("Lock failed");

        conn.execute(
            r"
            INSERT INTO diagnostic_reports (user_id, document, version, last_updated)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                document = excluded.document,
                version = excluded.version,
                last_updated = excluded.last_updated
            ",
            params![
                report.user_id,
                document,
                report.version,
                instant(report.last_updated),
            ],
        )?;

        tracing::debug!(user_id = %report.user_id, version = report.version, "Saved live report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{merge, AuditContext, ExtractedReport, ExtractedResult};
    use chrono::Duration;

    fn extracted_single(name: &str, value: &str) -> ExtractedReport {
        ExtractedReport {
            results: vec![ExtractedResult {
                name: name.to_string(),
                value: value.to_string(),
                unit: None,
                reference_range: None,
                status: None,
                interpretation: None,
            }],
            clinical_findings: None,
            diagnostic_impressions: None,
        }
    }

    #[test]
    fn test_subscription_roundtrip_and_ordering() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let now = Utc::now();

        let old = Subscription::trial("user-1", now - Duration::days(30));
        let newer = Subscription::paid("user-1", now);
        store.insert_subscription(&old).expect("Should insert");
        store.insert_subscription(&newer).expect("Should insert");

        let active = store
            .active_subscription("user-1")
            .expect("Should load")
            .expect("Should exist");
        // Most recently created active row wins.
        assert_eq!(active.id, newer.id);

        assert!(store
            .active_subscription("user-2")
            .expect("Should load")
            .is_none());
    }

    #[test]
    fn test_expire_subscription_is_idempotent() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let start = Utc::now() - Duration::days(10);
        let sub = Subscription::trial("user-1", start);
        store.insert_subscription(&sub).expect("Should insert");

        let now = Utc::now();
        assert!(store
            .expire_subscription(&sub.id, now)
            .expect("First transition should apply"));
        // Second concurrent-style attempt is a no-op, not an error.
        assert!(!store
            .expire_subscription(&sub.id, now)
            .expect("Second transition should be a no-op"));

        let reloaded = store
            .active_subscription("user-1")
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(reloaded.plan_type, PlanType::Free);
        assert!(reloaded.end_date.is_none());
    }

    #[test]
    fn test_expire_does_not_touch_unexpired_rows() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let sub = Subscription::trial("user-1", Utc::now());
        store.insert_subscription(&sub).expect("Should insert");

        assert!(!store
            .expire_subscription(&sub.id, Utc::now())
            .expect("Should not transition an unexpired trial"));
    }

    #[test]
    fn test_reserve_usage_stops_exactly_at_limit() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let today = Utc::now().date_naive();
        let limit = 2;

        assert_eq!(
            store
                .try_reserve_usage("user-1", today, ResourceKind::Upload, limit)
                .expect("Should reserve"),
            Some(1)
        );
        assert_eq!(
            store
                .try_reserve_usage("user-1", today, ResourceKind::Upload, limit)
                .expect("Should reserve"),
            Some(2)
        );
        // The (limit+1)th call is denied and the counter stays at the limit.
        assert_eq!(
            store
                .try_reserve_usage("user-1", today, ResourceKind::Upload, limit)
                .expect("Should evaluate"),
            None
        );
        assert_eq!(
            store.usage_on("user-1", today).expect("Should read"),
            (2, 0)
        );
    }

    #[test]
    fn test_upload_and_analysis_counters_are_independent() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let today = Utc::now().date_naive();

        store
            .try_reserve_usage("user-1", today, ResourceKind::Upload, 2)
            .expect("Should reserve");
        store
            .try_reserve_usage("user-1", today, ResourceKind::Analysis, 2)
            .expect("Should reserve");
        store
            .try_reserve_usage("user-1", today, ResourceKind::Analysis, 2)
            .expect("Should reserve");

        assert_eq!(
            store.usage_on("user-1", today).expect("Should read"),
            (1, 2)
        );
    }

    #[test]
    fn test_usage_on_never_creates_a_row() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let today = Utc::now().date_naive();

        assert_eq!(
            store.usage_on("user-1", today).expect("Should read"),
            (0, 0)
        );

        let conn = store.conn.lock().expect("Lock failed");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM usage_counters", [], |row| row.get(0))
            .expect("Should count");
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_one_counter_row_per_user_per_day() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let today = Utc::now().date_naive();

        for _ in 0..5 {
            let _ = store
                .try_reserve_usage("user-1", today, ResourceKind::Upload, 100)
                .expect("Should reserve");
        }

        let conn = store.conn.lock().expect("Lock failed");
        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM usage_counters WHERE user_id = 'user-1'",
                [],
                |row| row.get(0),
            )
            .expect("Should count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_identity_crud_and_hard_delete() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let now = Utc::now();

        let identity = ProtectedIdentity {
            user_id: "user-1".to_string(),
            full_name_encrypted: Some("token-a".to_string()),
            email_encrypted: Some("token-b".to_string()),
            phone_number_encrypted: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_identity(&identity).expect("Should insert");

        let loaded = store
            .identity("user-1")
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(loaded.full_name_encrypted.as_deref(), Some("token-a"));

        assert!(store.delete_identity("user-1").expect("Should delete"));
        assert!(store.identity("user-1").expect("Should load").is_none());
        assert!(!store.delete_identity("user-1").expect("Already gone"));
    }

    #[test]
    fn test_persona_anonymization_keeps_row() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let now = Utc::now();

        let persona = HealthPersona::new("user-1", now);
        let persona_id = persona.id.clone();
        store.insert_persona(&persona).expect("Should insert");

        assert!(store
            .anonymize_persona("user-1", now)
            .expect("Should anonymize"));

        // Lookup by owner fails; lookup by row id still works.
        assert!(store
            .persona_for_user("user-1")
            .expect("Should load")
            .is_none());
        let kept = store
            .persona_by_id(&persona_id)
            .expect("Should load")
            .expect("Row must be retained");
        assert!(kept.user_id.is_none());
        assert!(kept.anonymized_at.is_some());

        // Re-anonymizing matches nothing.
        assert!(!store
            .anonymize_persona("user-1", now)
            .expect("Should be a no-op"));
    }

    #[test]
    fn test_audit_entries_append_only_roundtrip() {
        let store = SqliteStore::in_memory().expect("Should create db");

        let entry = AuditEntry::new(
            Some("actor-1"),
            "user-1",
            AuditAction::PhiAccess,
            "protected_identity",
            AuditContext::new(Some("192.0.2.1".to_string()), Some("curl/8".to_string())),
        )
        .with_detail(serde_json::json!({"fields": ["email"]}));
        store.record(&entry).expect("Should record");

        let entries = store
            .audit_entries_for_subject("user-1")
            .expect("Should load");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::PhiAccess);
        assert_eq!(entries[0].context.ip_address.as_deref(), Some("192.0.2.1"));
        assert_eq!(
            entries[0].detail.as_ref().expect("detail stored")["fields"][0],
            "email"
        );
    }

    #[test]
    fn test_report_document_roundtrip() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let now = Utc::now();

        assert!(store.live_report("user-1").expect("Should load").is_none());

        let v1 = merge(None, &extracted_single("RBC", "4.5"), "user-1", now).report;
        store.save_report(&v1).expect("Should save");

        let v2 = merge(
            Some(&v1),
            &extracted_single("RBC", "4.8"),
            "user-1",
            now + Duration::days(1),
        )
        .report;
        store.save_report(&v2).expect("Should upsert");

        let loaded = store
            .live_report("user-1")
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.results[0].history.len(), 1);
        assert_eq!(loaded, v2);
    }

    #[test]
    fn test_on_disk_database() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let path = dir.path().join("nutriguard.db");

        {
            let store = SqliteStore::new(&path).expect("Should create db");
            store
                .insert_subscription(&Subscription::trial("user-1", Utc::now()))
                .expect("Should insert");
        }

        // Reopen and observe the persisted row.
        let store = SqliteStore::new(&path).expect("Should reopen db");
        assert!(store
            .active_subscription("user-1")
            .expect("Should load")
            .is_some());
    }
}

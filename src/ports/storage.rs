//! Storage ports.
//!
//! These traits abstract the storage backend from the application
//! services. One backend may implement all of them (the SQLite adapter
//! does), but each service only requires the slice it actually uses.

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::{
    DiagnosticReport, HealthPersona, ProtectedIdentity, ResourceKind, Subscription,
};

/// Persistence for subscriptions and daily usage counters.
pub trait EntitlementStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert a new subscription row.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn insert_subscription(&self, subscription: &Subscription) -> Result<(), Self::Error>;

    /// The most recently created active subscription for a user, if any.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn active_subscription(&self, user_id: &str) -> Result<Option<Subscription>, Self::Error>;

    /// Lazily transition an expired trial to the free tier: set
    /// `plan_type = free` and clear `end_date`, but only if the row is
    /// still `paid` with an `end_date` in the past.
    ///
    /// Returns `true` if this call performed the transition, `false` if a
    /// concurrent caller already did (which is not an error).
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn expire_subscription(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Mark a subscription inactive with the given end date (used when an
    /// explicit upgrade replaces it).
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn deactivate_subscription(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Self::Error>;

    /// Atomically reserve one unit of `kind` for `(user, date)`: create
    /// the counter row if missing, then increment the matching count only
    /// if it is currently below `limit` — check and increment in a single
    /// conditional statement, never a separate read-then-write.
    ///
    /// Returns `Some(new_count)` when the reservation succeeded and
    /// `None` when the limit was already reached (the stored count is
    /// then unchanged).
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn try_reserve_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
        kind: ResourceKind,
        limit: i64,
    ) -> Result<Option<i64>, Self::Error>;

    /// Read-only `(uploads, analyses)` counts for `(user, date)`; zero for
    /// a missing row. Never creates or mutates the counter.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn usage_on(&self, user_id: &str, date: NaiveDate) -> Result<(i64, i64), Self::Error>;
}

/// Persistence for protected identities and health personas.
pub trait PatientStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert a new identity row (1:1 with the user).
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn insert_identity(&self, identity: &ProtectedIdentity) -> Result<(), Self::Error>;

    /// Fetch a user's identity row.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn identity(&self, user_id: &str) -> Result<Option<ProtectedIdentity>, Self::Error>;

    /// Replace the stored cipher tokens for a user's identity.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn update_identity(&self, identity: &ProtectedIdentity) -> Result<(), Self::Error>;

    /// Hard-delete a user's identity row. Returns `true` if a row existed.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn delete_identity(&self, user_id: &str) -> Result<bool, Self::Error>;

    /// Insert a new persona row.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn insert_persona(&self, persona: &HealthPersona) -> Result<(), Self::Error>;

    /// Fetch the persona currently owned by a user.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn persona_for_user(&self, user_id: &str) -> Result<Option<HealthPersona>, Self::Error>;

    /// Fetch a persona by its own row id; works for anonymized rows whose
    /// owner reference has been cleared.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn persona_by_id(&self, persona_id: &str) -> Result<Option<HealthPersona>, Self::Error>;

    /// Persist updated persona attributes.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn update_persona(&self, persona: &HealthPersona) -> Result<(), Self::Error>;

    /// Detach a persona from its owner: set `user_id` to null and stamp
    /// `anonymized_at`, retaining the row. Returns `true` if a row was
    /// anonymized.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn anonymize_persona(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, Self::Error>;
}

/// Persistence for the single live diagnostic report per user.
pub trait ReportStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The user's live report document, if one exists.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn live_report(&self, user_id: &str) -> Result<Option<DiagnosticReport>, Self::Error>;

    /// Upsert the live report document (superseded full documents are not
    /// retained; history lives inside each test result).
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    fn save_report(&self, report: &DiagnosticReport) -> Result<(), Self::Error>;
}

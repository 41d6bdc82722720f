//! Subscription and quota types.
//!
//! Every user holds exactly one active subscription. New accounts start on
//! a one-time 7-day trial (`paid` with an `end_date`); the trial lazily
//! converts to the free tier the first time it is read after expiry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::new_entity_id;

/// Length of the one-time signup trial.
pub const TRIAL_PERIOD_DAYS: i64 = 7;

/// Sentinel for "no daily limit" in quota decisions and package limits.
pub const UNLIMITED: i64 = -1;

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Paid,
}

impl PlanType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource a quota reservation is charged against. Uploads and
/// analyses are counted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Upload,
    Analysis,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's subscription row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    /// Expiry for trials; `None` means non-expiring.
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// The one-time signup trial: paid tier expiring after
    /// [`TRIAL_PERIOD_DAYS`].
    #[must_use]
    pub fn trial(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_entity_id(),
            user_id: user_id.into(),
            plan_type: PlanType::Paid,
            status: SubscriptionStatus::Active,
            end_date: Some(now + Duration::days(TRIAL_PERIOD_DAYS)),
            created_at: now,
        }
    }

    /// A non-expiring paid subscription (explicit upgrade).
    #[must_use]
    pub fn paid(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_entity_id(),
            user_id: user_id.into(),
            plan_type: PlanType::Paid,
            status: SubscriptionStatus::Active,
            end_date: None,
            created_at: now,
        }
    }

    /// A paid subscription with an `end_date` is a trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.plan_type == PlanType::Paid && self.end_date.is_some()
    }

    /// Whether the trial/paid period has lapsed and the row is due for the
    /// lazy `paid -> free` transition.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.plan_type, self.end_date) {
            (PlanType::Paid, Some(end)) => end < now,
            _ => false,
        }
    }

    /// Whole days of trial left, clamped at zero. `None` for non-trials.
    #[must_use]
    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.is_trial() {
            return None;
        }
        self.end_date.map(|end| (end - now).num_days().max(0))
    }
}

/// Outcome of a quota check-and-reserve.
///
/// `remaining` is [`UNLIMITED`] (-1) for paid/trial tiers; for a denied
/// reservation it is 0 and the stored counter has not moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub plan_type: PlanType,
}

/// Read-only projection of a user's usage for today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStats {
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    pub uploads_today: i64,
    pub analyses_today: i64,
    /// [`UNLIMITED`] on paid/trial plans.
    pub remaining_uploads: i64,
    pub remaining_analyses: i64,
    pub is_trial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_days_remaining: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_subscription_shape() {
        let now = Utc::now();
        let sub = Subscription::trial("user-1", now);

        assert_eq!(sub.plan_type, PlanType::Paid);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.is_trial());
        assert_eq!(
            sub.end_date.expect("Trial must have an end date"),
            now + Duration::days(TRIAL_PERIOD_DAYS)
        );
    }

    #[test]
    fn test_trial_expiry_predicate() {
        let now = Utc::now();
        let sub = Subscription::trial("user-1", now);

        assert!(!sub.is_expired(now));
        assert!(!sub.is_expired(now + Duration::days(TRIAL_PERIOD_DAYS)));
        assert!(sub.is_expired(now + Duration::days(TRIAL_PERIOD_DAYS) + Duration::seconds(1)));
    }

    #[test]
    fn test_paid_without_end_date_never_expires() {
        let now = Utc::now();
        let sub = Subscription::paid("user-1", now);

        assert!(!sub.is_trial());
        assert!(!sub.is_expired(now + Duration::days(10_000)));
        assert_eq!(sub.trial_days_remaining(now), None);
    }

    #[test]
    fn test_trial_days_remaining_clamps_at_zero() {
        let now = Utc::now();
        let sub = Subscription::trial("user-1", now);

        assert_eq!(sub.trial_days_remaining(now), Some(TRIAL_PERIOD_DAYS));
        assert_eq!(
            sub.trial_days_remaining(now + Duration::days(TRIAL_PERIOD_DAYS + 3)),
            Some(0)
        );
    }
}

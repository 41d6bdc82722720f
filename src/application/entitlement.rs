//! Subscription lifecycle and daily quota enforcement.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::storage;
use crate::adapters::StorageError;
use crate::domain::{
    PlanType, QuotaDecision, ResourceKind, Subscription, UsageStats, UNLIMITED,
};
use crate::ports::{EntitlementStore, PackageCatalog};
use crate::{CoreError, Result};

/// Service owning subscriptions and the daily quota gate.
///
/// Time-dependent operations come in pairs: the plain method uses the
/// current wall clock and the `_at` variant takes an explicit instant for
/// deterministic tests.
pub struct EntitlementService<S, C> {
    store: Arc<S>,
    catalog: Arc<C>,
}

impl<S, C> EntitlementService<S, C>
where
    S: EntitlementStore,
    S::Error: Into<StorageError>,
    C: PackageCatalog,
{
    pub fn new(store: Arc<S>, catalog: Arc<C>) -> Self {
        Self { store, catalog }
    }

    /// Start the one-time signup trial for a new user.
    ///
    /// Idempotent: if the user already holds an active subscription it is
    /// returned unchanged, so a retried signup cannot grant a second trial.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn start_trial(&self, user_id: &str) -> Result<Subscription> {
        self.start_trial_at(user_id, Utc::now())
    }

    pub fn start_trial_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<Subscription> {
        if let Some(existing) = self.store.active_subscription(user_id).map_err(storage)? {
            tracing::debug!(user_id = %user_id, "Subscription already exists, trial not granted");
            return Ok(existing);
        }

        let subscription = Subscription::trial(user_id, now);
        self.store
            .insert_subscription(&subscription)
            .map_err(storage)?;

        tracing::info!(
            user_id = %user_id,
            end_date = ?subscription.end_date,
            "Started signup trial"
        );
        Ok(subscription)
    }

    /// Replace the user's current subscription with a non-expiring paid
    /// one.
    ///
    /// # Errors
    /// Returns error if the storage operation fails.
    pub fn upgrade_to_paid(&self, user_id: &str) -> Result<Subscription> {
        self.upgrade_to_paid_at(user_id, Utc::now())
    }

    pub fn upgrade_to_paid_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<Subscription> {
        if let Some(current) = self.store.active_subscription(user_id).map_err(storage)? {
            self.store
                .deactivate_subscription(&current.id, now)
                .map_err(storage)?;
        }

        let subscription = Subscription::paid(user_id, now);
        self.store
            .insert_subscription(&subscription)
            .map_err(storage)?;

        tracing::info!(user_id = %user_id, "Upgraded to paid plan");
        Ok(subscription)
    }

    /// The user's active subscription with the lazy trial-expiry transition
    /// applied: an expired trial is flipped to the free tier on first read
    /// past its end date.
    ///
    /// # Errors
    /// Returns [`CoreError::SubscriptionNotFound`] if the user has no
    /// active subscription, or error if the storage operation fails.
    pub fn resolve_active_subscription(&self, user_id: &str) -> Result<Subscription> {
        self.resolve_active_subscription_at(user_id, Utc::now())
    }

    pub fn resolve_active_subscription_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let subscription = self
            .store
            .active_subscription(user_id)
            .map_err(storage)?
            .ok_or_else(|| CoreError::SubscriptionNotFound(user_id.to_string()))?;

        if !subscription.is_expired(now) {
            return Ok(subscription);
        }

        // Lazy transition. A concurrent caller may win the conditional
        // update; either way the row is free afterwards, so re-read it.
        let transitioned = self
            .store
            .expire_subscription(&subscription.id, now)
            .map_err(storage)?;
        if transitioned {
            tracing::info!(user_id = %user_id, "Trial expired, moved to free tier");
        }

        self.store
            .active_subscription(user_id)
            .map_err(storage)?
            .ok_or_else(|| CoreError::SubscriptionNotFound(user_id.to_string()))
    }

    /// Check the user's quota for `kind` and, on the free tier, reserve
    /// one unit of it.
    ///
    /// Paid and trial users are always allowed with [`UNLIMITED`]
    /// remaining and no counter touched. A denied decision leaves the
    /// stored counter unchanged.
    ///
    /// # Errors
    /// Returns error if the subscription cannot be resolved, the free
    /// package is not configured, or the storage operation fails.
    pub fn check_and_reserve(&self, user_id: &str, kind: ResourceKind) -> Result<QuotaDecision> {
        self.check_and_reserve_at(user_id, kind, Utc::now())
    }

    pub fn check_and_reserve_at(
        &self,
        user_id: &str,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let subscription = self.resolve_active_subscription_at(user_id, now)?;

        if subscription.plan_type == PlanType::Paid {
            return Ok(QuotaDecision {
                allowed: true,
                remaining: UNLIMITED,
                plan_type: PlanType::Paid,
            });
        }

        let limit = self.limit_for(PlanType::Free, kind)?;
        if limit == UNLIMITED {
            return Ok(QuotaDecision {
                allowed: true,
                remaining: UNLIMITED,
                plan_type: PlanType::Free,
            });
        }

        match self
            .store
            .try_reserve_usage(user_id, now.date_naive(), kind, limit)
            .map_err(storage)?
        {
            Some(count) => Ok(QuotaDecision {
                allowed: true,
                remaining: (limit - count).max(0),
                plan_type: PlanType::Free,
            }),
            None => {
                tracing::warn!(user_id = %user_id, resource = %kind, limit, "Daily quota exhausted");
                Ok(QuotaDecision {
                    allowed: false,
                    remaining: 0,
                    plan_type: PlanType::Free,
                })
            }
        }
    }

    /// Like [`check_and_reserve`](Self::check_and_reserve) but a denied
    /// decision becomes [`CoreError::LimitExceeded`], for callers that
    /// treat quota exhaustion as a failure.
    ///
    /// # Errors
    /// Returns [`CoreError::LimitExceeded`] on a denied reservation.
    pub fn reserve(&self, user_id: &str, kind: ResourceKind) -> Result<QuotaDecision> {
        self.reserve_at(user_id, kind, Utc::now())
    }

    pub fn reserve_at(
        &self,
        user_id: &str,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let decision = self.check_and_reserve_at(user_id, kind, now)?;
        if decision.allowed {
            return Ok(decision);
        }
        Err(CoreError::LimitExceeded {
            resource: kind,
            limit: self.limit_for(PlanType::Free, kind)?,
        })
    }

    /// Read-only usage projection for today. Never reserves anything and
    /// never creates a counter row.
    ///
    /// # Errors
    /// Returns error if the subscription cannot be resolved or the storage
    /// operation fails.
    pub fn usage_stats(&self, user_id: &str) -> Result<UsageStats> {
        self.usage_stats_at(user_id, Utc::now())
    }

    pub fn usage_stats_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<UsageStats> {
        let subscription = self.resolve_active_subscription_at(user_id, now)?;
        let (uploads_today, analyses_today) = self
            .store
            .usage_on(user_id, now.date_naive())
            .map_err(storage)?;

        let (remaining_uploads, remaining_analyses) = match subscription.plan_type {
            PlanType::Paid => (UNLIMITED, UNLIMITED),
            PlanType::Free => {
                let upload_limit = self.limit_for(PlanType::Free, ResourceKind::Upload)?;
                let analysis_limit = self.limit_for(PlanType::Free, ResourceKind::Analysis)?;
                (
                    remaining(upload_limit, uploads_today),
                    remaining(analysis_limit, analyses_today),
                )
            }
        };

        Ok(UsageStats {
            plan_type: subscription.plan_type,
            status: subscription.status,
            uploads_today,
            analyses_today,
            remaining_uploads,
            remaining_analyses,
            is_trial: subscription.is_trial(),
            trial_days_remaining: subscription.trial_days_remaining(now),
        })
    }

    fn limit_for(&self, plan: PlanType, kind: ResourceKind) -> Result<i64> {
        let package = self
            .catalog
            .package_for(plan)
            .ok_or(CoreError::PackageNotConfigured(plan))?;
        Ok(package.limit_for(kind))
    }
}

fn remaining(limit: i64, used: i64) -> i64 {
    if limit == UNLIMITED {
        UNLIMITED
    } else {
        (limit - used).max(0)
    }
}

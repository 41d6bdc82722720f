//! Package tier reference data.
//!
//! Packages define the daily limits attached to each plan. They are looked
//! up through the `PackageCatalog` port and never mutated by this core.

use serde::{Deserialize, Serialize};

use super::subscription::{ResourceKind, UNLIMITED};

/// Billing cadence for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

/// Tier definition: limits, pricing, availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Daily upload allowance; [`UNLIMITED`] for no cap.
    pub daily_upload_limit: i64,
    /// Daily analysis allowance, counted independently of uploads.
    pub daily_analysis_limit: i64,
    pub price_cents: i64,
    pub billing_period: BillingPeriod,
    pub active: bool,
}

impl Package {
    /// Default free tier: 2 uploads and 2 analyses per day.
    #[must_use]
    pub fn free_default() -> Self {
        Self {
            name: "free".to_string(),
            daily_upload_limit: 2,
            daily_analysis_limit: 2,
            price_cents: 0,
            billing_period: BillingPeriod::Monthly,
            active: true,
        }
    }

    /// Default paid tier: no daily caps.
    #[must_use]
    pub fn paid_default() -> Self {
        Self {
            name: "premium".to_string(),
            daily_upload_limit: UNLIMITED,
            daily_analysis_limit: UNLIMITED,
            price_cents: 999,
            billing_period: BillingPeriod::Monthly,
            active: true,
        }
    }

    /// Daily limit for the given resource.
    #[must_use]
    pub fn limit_for(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Upload => self.daily_upload_limit,
            ResourceKind::Analysis => self.daily_analysis_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_free_limits() {
        let free = Package::free_default();
        assert_eq!(free.limit_for(ResourceKind::Upload), 2);
        assert_eq!(free.limit_for(ResourceKind::Analysis), 2);
        assert_eq!(free.price_cents, 0);
    }

    #[test]
    fn test_paid_is_unlimited() {
        let paid = Package::paid_default();
        assert_eq!(paid.limit_for(ResourceKind::Upload), UNLIMITED);
        assert_eq!(paid.limit_for(ResourceKind::Analysis), UNLIMITED);
    }
}

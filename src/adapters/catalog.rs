//! In-process package catalog.

use crate::domain::{Package, PlanType};
use crate::ports::PackageCatalog;

/// Static catalog holding one package per tier. Limit configuration is
/// owned elsewhere; this adapter is the read-only view the quota path
/// consults.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    free: Package,
    paid: Package,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(free: Package, paid: Package) -> Self {
        Self { free, paid }
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new(Package::free_default(), Package::paid_default())
    }
}

impl PackageCatalog for StaticCatalog {
    fn package_for(&self, plan: PlanType) -> Option<Package> {
        match plan {
            PlanType::Free => Some(self.free.clone()),
            PlanType::Paid => Some(self.paid.clone()),
        }
    }
}

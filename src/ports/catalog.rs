//! Package catalog port.

use crate::domain::{Package, PlanType};

/// Read-only lookup of package tier reference data.
///
/// The catalog is owned elsewhere; this core only ever reads limits from
/// it and never mutates a package.
pub trait PackageCatalog: Send + Sync {
    /// The package governing the given plan, if one is configured.
    fn package_for(&self, plan: PlanType) -> Option<Package>;
}

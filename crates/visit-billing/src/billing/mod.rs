//! Insurance-billing core for visiting-nursing care.
//!
//! Visit records flow through the rule catalog and evaluator into bonus
//! applications, which the aggregator folds into a monthly receipt. The
//! lifecycle service owns the recalculation boundary and the
//! confirm / reopen / send state machine.

pub mod aggregation;
pub mod catalog;
pub mod domain;
pub mod evaluation;
pub mod lifecycle;
pub mod memory;
pub mod receipt;
pub mod repository;
pub mod router;
pub mod visits;

#[cfg(test)]
mod tests;

pub use aggregation::{AggregationInput, MonthlyLimits, ReceiptAggregator};
pub use catalog::{
    BonusCategory, BonusRule, CatalogDocument, CatalogError, CatalogSnapshot, ConditionSpec,
    MonthlyLimit, PointsSpec, RuleCatalog, RuleCode, RuleState,
};
pub use domain::{
    BillingPeriod, DeathLocation, DeathRecord, FacilityCapability, FacilityId, FacilityProfile,
    InsuranceType, OperatorId, PatientId, PatientProfile, PeriodError, VisitId, VisitRecord,
    VisitStatus,
};
pub use evaluation::{EvaluationPass, MonthlyUsage, PassKind, RuleEvaluator, VisitContext};
pub use lifecycle::{
    BillingSources, Clock, ReceiptLifecycleService, ReceiptServiceError, SystemClock,
    VisitListingEntry,
};
pub use memory::{
    InMemoryBillingStore, InMemoryFacilityDirectory, InMemoryPatientDirectory, InMemoryVisitStore,
};
pub use receipt::{
    BonusApplication, MonthlyReceipt, ReceiptId, ReceiptKey, ReceiptMessage, ReceiptStatus,
    ReceiptTotals, ReceiptView, ValidationReport,
};
pub use repository::{BillingStore, ReceiptCommit, ReplaceScope, RepositoryError};
pub use router::receipt_router;
pub use visits::{
    eligible_in_order, FacilityDirectory, MonthVisits, PatientDirectory, VisitRecordStore,
};

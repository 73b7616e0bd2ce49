mod validation;

use std::collections::BTreeMap;

use super::catalog::{CatalogSnapshot, RuleCode};
use super::domain::{FacilityProfile, PatientProfile, VisitRecord};
use super::evaluation::MonthlyUsage;
use super::receipt::{
    BonusApplication, MonthlyReceiptSnapshot, ReceiptKey, ReceiptTotals, ValidationReport,
};
use crate::config::ValidationSettings;

/// Monthly caps keyed by rule code, as configured when the pass ran.
pub type MonthlyLimits = BTreeMap<RuleCode, u32>;

pub fn limits_from_snapshot(snapshot: &CatalogSnapshot) -> MonthlyLimits {
    snapshot
        .rules()
        .iter()
        .filter_map(|rule| {
            rule.monthly_limit
                .map(|limit| (rule.code.clone(), limit.max()))
        })
        .collect()
}

/// Receipt inputs after evaluation.
#[derive(Debug, Clone, Copy)]
pub struct AggregationInput<'a> {
    pub key: &'a ReceiptKey,
    pub patient: &'a PatientProfile,
    pub facility: &'a FacilityProfile,
    /// Eligible records of the month.
    pub visits: &'a [VisitRecord],
    /// Every live application of the receipt.
    pub applications: &'a [BonusApplication],
    pub base_visit_points: i64,
    pub monthly_limits: &'a MonthlyLimits,
    /// Applications of the same patient and month held by other receipts.
    pub outside_usage: &'a MonthlyUsage,
}

/// Sums base points and applications into receipt totals and validates them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiptAggregator {
    settings: ValidationSettings,
}

impl ReceiptAggregator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    pub fn aggregate(&self, input: &AggregationInput<'_>) -> MonthlyReceiptSnapshot {
        MonthlyReceiptSnapshot {
            totals: self.totals(input),
            validation: self.validate(input),
        }
    }

    pub fn totals(&self, input: &AggregationInput<'_>) -> ReceiptTotals {
        let visit_count = input.visits.len() as u32;
        let base_visit_points = input.base_visit_points * i64::from(visit_count);

        let mut category_subtotals = BTreeMap::new();
        for application in input.applications {
            *category_subtotals.entry(application.category).or_insert(0) += application.points;
        }

        let grand_total_points = base_visit_points + category_subtotals.values().sum::<i64>();
        let grand_total_amount = input
            .facility
            .amount_for(input.key.insurance_type, grand_total_points);

        ReceiptTotals {
            visit_count,
            base_visit_points,
            category_subtotals,
            grand_total_points,
            grand_total_amount,
        }
    }

    pub fn validate(&self, input: &AggregationInput<'_>) -> ValidationReport {
        validation::run(input, &self.settings)
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::{BonusCategory, RuleCode};
use super::domain::{BillingPeriod, FacilityId, InsuranceType, OperatorId, PatientId, VisitId};

/// Identifier wrapper for persisted receipts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReceiptId(pub String);

/// Natural key of a monthly receipt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReceiptKey {
    pub patient_id: PatientId,
    pub facility_id: FacilityId,
    pub period: BillingPeriod,
    pub insurance_type: InsuranceType,
}

/// One successful (visit, rule) evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusApplication {
    pub receipt_id: ReceiptId,
    pub visit_id: VisitId,
    pub patient_id: PatientId,
    pub period: BillingPeriod,
    pub rule_code: RuleCode,
    pub rule_version: u32,
    pub category: BonusCategory,
    pub points: i64,
    /// JSON list of the satisfied conditions and the points derivation.
    pub explanation: String,
    pub computed_at: DateTime<Utc>,
}

impl BonusApplication {
    /// Identity used for idempotence comparisons; ignores the timestamp.
    pub fn identity(&self) -> (VisitId, RuleCode, i64) {
        (self.visit_id.clone(), self.rule_code.clone(), self.points)
    }
}

/// Stable code plus operator-facing text for a validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptMessage {
    pub code: String,
    pub message: String,
}

impl ReceiptMessage {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ReceiptMessage>,
    pub warnings: Vec<ReceiptMessage>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Point totals computed by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptTotals {
    pub visit_count: u32,
    pub base_visit_points: i64,
    pub category_subtotals: BTreeMap<BonusCategory, i64>,
    pub grand_total_points: i64,
    pub grand_total_amount: i64,
}

impl ReceiptTotals {
    pub fn is_consistent(&self) -> bool {
        self.grand_total_points
            == self.base_visit_points + self.category_subtotals.values().sum::<i64>()
    }
}

/// Aggregator output: totals plus validation findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyReceiptSnapshot {
    pub totals: ReceiptTotals,
    pub validation: ValidationReport,
}

/// Lifecycle state derived from the receipt's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Draft,
    Confirmed,
    Sent,
}

impl ReceiptStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ReceiptStatus::Draft => "draft",
            ReceiptStatus::Confirmed => "confirmed",
            ReceiptStatus::Sent => "sent",
        }
    }
}

/// The monthly billing aggregate for one receipt key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyReceipt {
    pub id: ReceiptId,
    pub key: ReceiptKey,
    pub totals: ReceiptTotals,
    pub is_confirmed: bool,
    pub is_sent: bool,
    pub has_errors: bool,
    pub has_warnings: bool,
    pub errors: Vec<ReceiptMessage>,
    pub warnings: Vec<ReceiptMessage>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<OperatorId>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub recalculated_at: Option<DateTime<Utc>>,
}

impl MonthlyReceipt {
    pub fn new(id: ReceiptId, key: ReceiptKey, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            key,
            totals: ReceiptTotals::default(),
            is_confirmed: false,
            is_sent: false,
            has_errors: false,
            has_warnings: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            confirmed_at: None,
            confirmed_by: None,
            sent_at: None,
            created_at,
            recalculated_at: None,
        }
    }

    pub fn status(&self) -> ReceiptStatus {
        if self.is_sent {
            ReceiptStatus::Sent
        } else if self.is_confirmed {
            ReceiptStatus::Confirmed
        } else {
            ReceiptStatus::Draft
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: MonthlyReceiptSnapshot, at: DateTime<Utc>) {
        self.totals = snapshot.totals;
        self.apply_validation(snapshot.validation);
        self.recalculated_at = Some(at);
    }

    /// Replace the message lists wholesale; prior findings never linger.
    pub fn apply_validation(&mut self, report: ValidationReport) {
        self.has_errors = report.has_errors();
        self.has_warnings = report.has_warnings();
        self.errors = report.errors;
        self.warnings = report.warnings;
    }

    pub fn validation(&self) -> ValidationReport {
        ValidationReport {
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        }
    }

    pub fn view(&self) -> ReceiptView {
        ReceiptView {
            receipt_id: self.id.clone(),
            patient_id: self.key.patient_id.clone(),
            facility_id: self.key.facility_id.clone(),
            year: self.key.period.year,
            month: self.key.period.month,
            insurance_type: self.key.insurance_type.label(),
            status: self.status().label(),
            visit_count: self.totals.visit_count,
            base_visit_points: self.totals.base_visit_points,
            category_subtotals: self
                .totals
                .category_subtotals
                .iter()
                .map(|(category, points)| (category.label(), *points))
                .collect(),
            grand_total_points: self.totals.grand_total_points,
            grand_total_amount: self.totals.grand_total_amount,
            has_errors: self.has_errors,
            has_warnings: self.has_warnings,
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            confirmed_at: self.confirmed_at,
            confirmed_by: self.confirmed_by.clone(),
            sent_at: self.sent_at,
        }
    }
}

/// Read-only projection handed to UI and export layers.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptView {
    pub receipt_id: ReceiptId,
    pub patient_id: PatientId,
    pub facility_id: FacilityId,
    pub year: i32,
    pub month: u32,
    pub insurance_type: &'static str,
    pub status: &'static str,
    pub visit_count: u32,
    pub base_visit_points: i64,
    pub category_subtotals: BTreeMap<&'static str, i64>,
    pub grand_total_points: i64,
    pub grand_total_amount: i64,
    pub has_errors: bool,
    pub has_warnings: bool,
    pub errors: Vec<ReceiptMessage>,
    pub warnings: Vec<ReceiptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_by: Option<OperatorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

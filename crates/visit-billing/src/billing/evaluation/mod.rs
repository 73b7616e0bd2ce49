mod conditions;
mod points;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::catalog::{BonusRule, CatalogSnapshot, RuleCode};
use super::domain::{
    BillingPeriod, FacilityProfile, InsuranceType, PatientProfile, VisitId, VisitRecord,
};
use super::receipt::{BonusApplication, ReceiptId};
use conditions::evaluate_condition;
use points::resolve_points;

/// Everything a condition or points schedule may look at for one visit.
#[derive(Debug, Clone, Copy)]
pub struct VisitContext<'a> {
    pub visit: &'a VisitRecord,
    pub patient: &'a PatientProfile,
    pub facility: &'a FacilityProfile,
    pub insurance_type: InsuranceType,
    pub is_first_record_of_month: bool,
    pub is_recalculation_pass: bool,
    /// Eligible records of the month in canonical order.
    pub month_visits: &'a [VisitRecord],
    /// Eligible records reaching back far enough for rolling windows.
    pub history: &'a [VisitRecord],
}

/// Scope of an evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassKind {
    /// Rebuild every application of the receipt.
    FullMonth,
    /// Re-evaluate a single visit, leaving the other applications in place.
    SingleVisit(VisitId),
}

/// Live application counts per rule code for the patient's month, excluding
/// the scope being recomputed.
pub type MonthlyUsage = BTreeMap<RuleCode, u32>;

/// Inputs for one pass over a receipt.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationPass<'a> {
    pub receipt_id: &'a ReceiptId,
    pub patient: &'a PatientProfile,
    pub facility: &'a FacilityProfile,
    pub insurance_type: InsuranceType,
    pub period: BillingPeriod,
    pub month_visits: &'a [VisitRecord],
    pub history: &'a [VisitRecord],
    pub prior_usage: &'a MonthlyUsage,
    pub kind: &'a PassKind,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ExplanationEntry<'a> {
    check: &'a str,
    detail: String,
}

/// Applies a frozen catalog snapshot to a month of visits.
pub struct RuleEvaluator {
    snapshot: CatalogSnapshot,
}

impl RuleEvaluator {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &CatalogSnapshot {
        &self.snapshot
    }

    /// Produce the applications for the pass. Records are walked in the order
    /// given (canonical), rules in snapshot order, so the result is stable.
    pub fn evaluate(&self, pass: &EvaluationPass<'_>) -> Vec<BonusApplication> {
        let rules: Vec<&BonusRule> = self
            .snapshot
            .rules()
            .iter()
            .filter(|rule| match rule.validate() {
                Ok(()) => true,
                Err(error) => {
                    warn!(rule = %rule.code.0, version = rule.version, %error, "skipping malformed bonus rule");
                    false
                }
            })
            .collect();

        let first_id = pass.month_visits.first().map(|record| &record.id);
        let is_recalculation_pass = matches!(pass.kind, PassKind::FullMonth);
        let mut usage = pass.prior_usage.clone();
        let mut applications = Vec::new();

        let targets = pass.month_visits.iter().filter(|record| match pass.kind {
            PassKind::FullMonth => true,
            PassKind::SingleVisit(id) => record.id == *id,
        });

        for visit in targets {
            let ctx = VisitContext {
                visit,
                patient: pass.patient,
                facility: pass.facility,
                insurance_type: pass.insurance_type,
                is_first_record_of_month: first_id == Some(&visit.id),
                is_recalculation_pass,
                month_visits: pass.month_visits,
                history: pass.history,
            };

            for rule in &rules {
                if let Some(application) = self.apply_rule(rule, &ctx, &mut usage, pass) {
                    applications.push(application);
                }
            }
        }

        applications
    }

    fn apply_rule(
        &self,
        rule: &BonusRule,
        ctx: &VisitContext<'_>,
        usage: &mut MonthlyUsage,
        pass: &EvaluationPass<'_>,
    ) -> Option<BonusApplication> {
        let date = ctx.visit.visit_date;
        if !rule.applies_on(date) {
            return None;
        }
        if !rule.matches_facility(&ctx.facility.id) {
            return None;
        }
        if rule.insurance_type != ctx.insurance_type {
            return None;
        }

        let mut explanation = Vec::with_capacity(rule.conditions.len() + 2);
        for condition in &rule.conditions {
            let outcome = evaluate_condition(condition, ctx);
            if !outcome.satisfied {
                debug!(
                    rule = %rule.code.0,
                    visit = %ctx.visit.id.0,
                    check = condition.label(),
                    detail = %outcome.detail,
                    "bonus condition not met"
                );
                return None;
            }
            explanation.push(ExplanationEntry {
                check: condition.label(),
                detail: outcome.detail,
            });
        }

        if let Some(limit) = rule.monthly_limit {
            if limit.anchors_to_first_record()
                && ctx.is_recalculation_pass
                && !ctx.is_first_record_of_month
            {
                return None;
            }
            let used = usage.get(&rule.code).copied().unwrap_or(0);
            if used >= limit.max() {
                debug!(rule = %rule.code.0, visit = %ctx.visit.id.0, used, "monthly limit reached");
                return None;
            }
            explanation.push(ExplanationEntry {
                check: "monthly_limit",
                detail: format!("{} of {} used before this visit", used, limit.max()),
            });
        }

        let resolved = match resolve_points(&rule.points, ctx) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return None,
            Err(error) => {
                warn!(
                    rule = %rule.code.0,
                    version = rule.version,
                    visit = %ctx.visit.id.0,
                    %error,
                    "bonus rule schedule unresolvable; skipping"
                );
                return None;
            }
        };
        explanation.push(ExplanationEntry {
            check: "points",
            detail: format!("{} points ({})", resolved.points, resolved.basis),
        });

        *usage.entry(rule.code.clone()).or_insert(0) += 1;

        Some(BonusApplication {
            receipt_id: pass.receipt_id.clone(),
            visit_id: ctx.visit.id.clone(),
            patient_id: ctx.patient.id.clone(),
            period: pass.period,
            rule_code: rule.code.clone(),
            rule_version: rule.version,
            category: rule.category,
            points: resolved.points,
            explanation: serde_json::to_string(&explanation).unwrap_or_else(|_| "[]".to_string()),
            computed_at: pass.computed_at,
        })
    }
}

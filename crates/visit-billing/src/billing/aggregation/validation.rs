use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use super::AggregationInput;
use crate::billing::catalog::RuleCode;
use crate::billing::domain::{BillingPeriod, DateWindow};
use crate::billing::receipt::{ReceiptMessage, ValidationReport};
use crate::config::ValidationSettings;

pub(super) fn run(input: &AggregationInput<'_>, settings: &ValidationSettings) -> ValidationReport {
    let mut report = ValidationReport::default();
    let period = input.key.period;
    let visit_dates: Vec<NaiveDate> = input.visits.iter().map(|visit| visit.visit_date).collect();

    identifying_fields(input, &mut report);

    let cards: Vec<DateWindow> = input
        .patient
        .insurance_cards
        .iter()
        .filter(|card| card.insurance_type == input.key.insurance_type)
        .map(|card| card.coverage)
        .collect();
    coverage(
        &cards,
        &period,
        &visit_dates,
        settings,
        CoverageLabels {
            subject: "insurance card",
            missing: "insurance_card_missing",
            expired: "insurance_card_expired",
            ending: "insurance_card_ending",
        },
        &mut report,
    );

    let orders: Vec<DateWindow> = input
        .patient
        .doctor_orders
        .iter()
        .map(|order| order.coverage)
        .collect();
    coverage(
        &orders,
        &period,
        &visit_dates,
        settings,
        CoverageLabels {
            subject: "doctor order",
            missing: "doctor_order_missing",
            expired: "doctor_order_expired",
            ending: "doctor_order_ending",
        },
        &mut report,
    );

    monthly_limits(input, &mut report);

    let visit_count = input.visits.len() as u32;
    if visit_count == 0 {
        report.warnings.push(ReceiptMessage::new(
            "no_visits",
            format!("no billable visits in {}-{:02}", period.year, period.month),
        ));
    } else if visit_count < settings.low_visit_warning {
        report.warnings.push(ReceiptMessage::new(
            "low_visit_count",
            format!(
                "only {visit_count} billable visit(s); review before confirming (threshold {})",
                settings.low_visit_warning
            ),
        ));
    }

    for entry in &input.patient.special_management {
        if let Some(end) = entry.window.end {
            if end > period.first_day() && end <= period.last_day() {
                report.warnings.push(ReceiptMessage::new(
                    "special_management_ending",
                    format!("{:?} management ends on {end}, inside the billing month", entry.kind),
                ));
            }
        }
    }

    report
}

fn identifying_fields(input: &AggregationInput<'_>, report: &mut ValidationReport) {
    if input.patient.name.trim().is_empty() {
        report
            .errors
            .push(ReceiptMessage::new("missing_patient_name", "patient name is blank"));
    }
    if is_blank(input.patient.insured_number.as_deref()) {
        report.errors.push(ReceiptMessage::new(
            "missing_insured_number",
            "patient insured number is not recorded",
        ));
    }
    if is_blank(input.facility.facility_code.as_deref()) {
        report.errors.push(ReceiptMessage::new(
            "missing_facility_code",
            "facility code is not registered",
        ));
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |raw| raw.trim().is_empty())
}

struct CoverageLabels {
    subject: &'static str,
    missing: &'static str,
    expired: &'static str,
    ending: &'static str,
}

/// Every visit date must be covered; with no visits the month must at least be
/// overlapped.
fn coverage(
    windows: &[DateWindow],
    period: &BillingPeriod,
    visit_dates: &[NaiveDate],
    settings: &ValidationSettings,
    labels: CoverageLabels,
    report: &mut ValidationReport,
) {
    if !windows
        .iter()
        .any(|window| window.overlaps(period.first_day(), period.last_day()))
    {
        report.errors.push(ReceiptMessage::new(
            labels.missing,
            format!(
                "no {} covers {}-{:02}",
                labels.subject, period.year, period.month
            ),
        ));
        return;
    }

    let uncovered: Vec<NaiveDate> = visit_dates
        .iter()
        .copied()
        .filter(|date| !windows.iter().any(|window| window.contains(*date)))
        .collect();

    if let Some(last) = uncovered.last() {
        let lapsed = windows
            .iter()
            .any(|window| window.end.map_or(false, |end| end <= *last));
        let listed = uncovered
            .iter()
            .map(NaiveDate::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let (code, verb) = if lapsed {
            (labels.expired, "expired before")
        } else {
            (labels.missing, "does not cover")
        };
        report.errors.push(ReceiptMessage::new(
            code,
            format!("{} {verb} visit date(s) {listed}", labels.subject),
        ));
        return;
    }

    let horizon = period.last_day() + Duration::days(settings.coverage_warning_days);
    let ending = windows
        .iter()
        .filter(|window| window.contains(period.last_day()))
        .filter_map(|window| window.end)
        .filter(|end| *end <= horizon)
        .max();
    if let Some(end) = ending {
        report.warnings.push(ReceiptMessage::new(
            labels.ending,
            format!("{} coverage ends on {end}", labels.subject),
        ));
    }
}

fn monthly_limits(input: &AggregationInput<'_>, report: &mut ValidationReport) {
    let mut counts: BTreeMap<&RuleCode, u32> = BTreeMap::new();
    for application in input.applications {
        *counts.entry(&application.rule_code).or_insert(0) += 1;
    }

    for (code, count) in counts {
        let Some(limit) = input.monthly_limits.get(code) else {
            continue;
        };
        let total = count + input.outside_usage.get(code).copied().unwrap_or(0);
        if total > *limit {
            report.errors.push(ReceiptMessage::new(
                "monthly_limit_exceeded",
                format!(
                    "rule {} applied {total} time(s) this month (limit {limit})",
                    code.0
                ),
            ));
        }
    }
}

use chrono::{Duration, NaiveDateTime, NaiveTime};

use super::VisitContext;
use crate::billing::catalog::{ConditionSpec, PatientWindowKind, RollingAnchor, TimeBasis};

/// Result of one condition check, kept for the application's explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConditionOutcome {
    pub satisfied: bool,
    pub detail: String,
}

impl ConditionOutcome {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            satisfied: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            detail: detail.into(),
        }
    }

    fn check(satisfied: bool, detail: impl Into<String>) -> Self {
        Self {
            satisfied,
            detail: detail.into(),
        }
    }
}

pub(crate) fn evaluate_condition(condition: &ConditionSpec, ctx: &VisitContext<'_>) -> ConditionOutcome {
    match condition {
        ConditionSpec::PatientWindow { window } => patient_window(*window, ctx),
        ConditionSpec::RollingVisitCount {
            flag,
            window_days,
            minimum,
            anchor,
            include_reference_date,
            require_visit_on_reference,
        } => {
            let reference = match anchor {
                RollingAnchor::VisitDate => ctx.visit.visit_date,
                RollingAnchor::DeathDate => match ctx.patient.death {
                    Some(death) => death.date,
                    None => return ConditionOutcome::fail("patient has no death date"),
                },
            };

            if *require_visit_on_reference && ctx.visit.visit_date != reference {
                return ConditionOutcome::fail(format!(
                    "visit on {} is not the reference date {reference}",
                    ctx.visit.visit_date
                ));
            }

            // Always `window_days` calendar days, ending just before the
            // reference date or on it.
            let days_back = if *include_reference_date {
                i64::from(*window_days) - 1
            } else {
                i64::from(*window_days)
            };
            let window_start = reference - Duration::days(days_back);
            let count = ctx
                .history
                .iter()
                .filter(|record| record.has_flag(*flag))
                .filter(|record| {
                    record.visit_date >= window_start
                        && (record.visit_date < reference
                            || (*include_reference_date && record.visit_date == reference))
                })
                .count();

            ConditionOutcome::check(
                count >= *minimum as usize,
                format!(
                    "{count} {:?} visit(s) from {window_start} to {reference} (minimum {minimum})",
                    flag
                ),
            )
        }
        ConditionSpec::DurationOver { minutes } => match ctx.visit.duration_minutes() {
            Some(actual) => ConditionOutcome::check(
                actual > *minutes,
                format!("visit lasted {actual} minutes (threshold {minutes})"),
            ),
            None => ConditionOutcome::fail("actual start or end time missing"),
        },
        ConditionSpec::TimeOfDay { from, to, basis } => time_of_day(*from, *to, *basis, ctx),
        ConditionSpec::FirstRecordOfMonth => ConditionOutcome::check(
            ctx.is_first_record_of_month,
            if ctx.is_first_record_of_month {
                "first eligible record of the month"
            } else {
                "not the first eligible record of the month"
            },
        ),
        ConditionSpec::VisitFlag { flag } => ConditionOutcome::check(
            ctx.visit.has_flag(*flag),
            format!("visit flag {flag:?}"),
        ),
        ConditionSpec::PatientFlag { flag } => ConditionOutcome::check(
            ctx.patient.has_flag(*flag),
            format!("patient flag {flag:?}"),
        ),
        ConditionSpec::FacilityCapability { capability } => ConditionOutcome::check(
            ctx.facility.has_capability(*capability),
            format!("facility capability {capability:?}"),
        ),
        ConditionSpec::NthVisitOfDay { at_least } => {
            let ordinal = ctx
                .month_visits
                .iter()
                .filter(|record| record.visit_date == ctx.visit.visit_date)
                .position(|record| record.id == ctx.visit.id)
                .map(|index| index + 1);
            match ordinal {
                Some(ordinal) => ConditionOutcome::check(
                    ordinal >= *at_least as usize,
                    format!("visit #{ordinal} of {} (needs #{at_least})", ctx.visit.visit_date),
                ),
                None => ConditionOutcome::fail("visit not among the month's eligible records"),
            }
        }
        ConditionSpec::DeathLocation { locations } => match ctx.patient.death {
            Some(death) => ConditionOutcome::check(
                locations.contains(&death.location),
                format!("death location {:?}", death.location),
            ),
            None => ConditionOutcome::fail("patient has no death record"),
        },
    }
}

fn patient_window(window: PatientWindowKind, ctx: &VisitContext<'_>) -> ConditionOutcome {
    let date = ctx.visit.visit_date;
    match window {
        PatientWindowKind::SpecialManagement { management } => {
            let hit = ctx.patient.special_management.iter().find(|entry| {
                management.map_or(true, |kind| entry.kind == kind) && entry.window.contains(date)
            });
            match hit {
                Some(entry) => ConditionOutcome::pass(format!(
                    "{date} within {:?} management from {}",
                    entry.kind, entry.window.start
                )),
                None => ConditionOutcome::fail(format!("{date} outside special management windows")),
            }
        }
        PatientWindowKind::SpecialInstruction => {
            match ctx
                .patient
                .special_instructions
                .iter()
                .find(|entry| entry.contains(date))
            {
                Some(entry) => ConditionOutcome::pass(format!(
                    "{date} within special instruction from {}",
                    entry.start
                )),
                None => ConditionOutcome::fail(format!("{date} outside special instruction windows")),
            }
        }
    }
}

/// `[from, to)` on the clock; wraps midnight when `from > to`.
pub(crate) fn in_clock_range(time: NaiveTime, from: NaiveTime, to: NaiveTime) -> bool {
    if from < to {
        time >= from && time < to
    } else {
        time >= from || time < to
    }
}

fn time_of_day(
    from: NaiveTime,
    to: NaiveTime,
    basis: TimeBasis,
    ctx: &VisitContext<'_>,
) -> ConditionOutcome {
    let check = |stamp: Option<NaiveDateTime>| {
        stamp
            .map(|value| in_clock_range(value.time(), from, to))
            .unwrap_or(false)
    };

    let (satisfied, described) = match basis {
        TimeBasis::Start => (check(ctx.visit.actual_start), "start"),
        TimeBasis::End => (check(ctx.visit.actual_end), "end"),
        TimeBasis::Either => (
            check(ctx.visit.actual_start) || check(ctx.visit.actual_end),
            "start or end",
        ),
    };

    ConditionOutcome::check(satisfied, format!("{described} time within {from}-{to}"))
}

use super::VisitContext;
use crate::billing::catalog::PointsSpec;
use crate::billing::domain::InsuranceType;

/// Schedule data that cannot produce a value for this context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum PointsError {
    #[error("no {} entry in insurance schedule", .0.label())]
    MissingInsuranceEntry(InsuranceType),
    #[error("death-location schedule needs a death record")]
    MissingDeathRecord,
    #[error("no schedule entry for death location {0}")]
    MissingLocationEntry(String),
}

/// Points derived from a schedule along with how they were derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedPoints {
    pub points: i64,
    pub basis: String,
}

/// `Ok(None)` is a non-match (no tier reached), not a configuration problem.
pub(crate) fn resolve_points(
    spec: &PointsSpec,
    ctx: &VisitContext<'_>,
) -> Result<Option<ResolvedPoints>, PointsError> {
    match spec {
        PointsSpec::Fixed { points } => Ok(Some(ResolvedPoints {
            points: *points,
            basis: "fixed".to_string(),
        })),
        PointsSpec::ByInsuranceType {
            medical,
            long_term_care,
        } => {
            let entry = match ctx.insurance_type {
                InsuranceType::Medical => medical,
                InsuranceType::LongTermCare => long_term_care,
            };
            entry
                .map(|points| {
                    Some(ResolvedPoints {
                        points,
                        basis: format!("{} schedule", ctx.insurance_type.label()),
                    })
                })
                .ok_or(PointsError::MissingInsuranceEntry(ctx.insurance_type))
        }
        PointsSpec::ByDeathLocation { entries } => {
            let death = ctx.patient.death.ok_or(PointsError::MissingDeathRecord)?;
            entries
                .iter()
                .find(|entry| entry.location == death.location)
                .map(|entry| {
                    Some(ResolvedPoints {
                        points: entry.points,
                        basis: format!("death location {:?}", death.location),
                    })
                })
                .ok_or_else(|| PointsError::MissingLocationEntry(format!("{:?}", death.location)))
        }
        PointsSpec::DurationTiers { tiers } => {
            let Some(minutes) = ctx.visit.duration_minutes() else {
                return Ok(None);
            };
            Ok(tiers
                .iter()
                .filter(|tier| minutes >= tier.min_minutes)
                .max_by_key(|tier| tier.min_minutes)
                .map(|tier| ResolvedPoints {
                    points: tier.points,
                    basis: format!("{minutes} minutes reached tier {}", tier.min_minutes),
                }))
        }
    }
}

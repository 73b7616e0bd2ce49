use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::billing::domain::{
    BillingPeriod, DeathLocation, FacilityCapability, FacilityId, InsuranceType, PatientFlag,
    SpecialManagementKind, VisitFlag,
};

/// Stable rule identity shared by every version of a rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleCode(pub String);

/// Receipt subtotal bucket a rule's points land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusCategory {
    SpecialManagement,
    Emergency,
    LongDuration,
    MultipleVisit,
    SameBuildingReduction,
    TerminalCare,
    TwentyFourHour,
    TimeOfDay,
    Discharge,
    Other,
}

impl BonusCategory {
    pub const fn label(self) -> &'static str {
        match self {
            BonusCategory::SpecialManagement => "special_management",
            BonusCategory::Emergency => "emergency",
            BonusCategory::LongDuration => "long_duration",
            BonusCategory::MultipleVisit => "multiple_visit",
            BonusCategory::SameBuildingReduction => "same_building_reduction",
            BonusCategory::TerminalCare => "terminal_care",
            BonusCategory::TwentyFourHour => "twenty_four_hour",
            BonusCategory::TimeOfDay => "time_of_day",
            BonusCategory::Discharge => "discharge",
            BonusCategory::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    #[default]
    Inactive,
    Active,
    Superseded,
}

/// Per patient, per calendar month application cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonthlyLimit {
    /// At most one application, anchored to the first record of the month
    /// during a full recalculation.
    OncePerMonth,
    AtMost { count: u32 },
}

impl MonthlyLimit {
    pub const fn max(self) -> u32 {
        match self {
            MonthlyLimit::OncePerMonth => 1,
            MonthlyLimit::AtMost { count } => count,
        }
    }

    pub const fn anchors_to_first_record(self) -> bool {
        matches!(self, MonthlyLimit::OncePerMonth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathLocationPoints {
    pub location: DeathLocation,
    pub points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationTier {
    pub min_minutes: i64,
    pub points: i64,
}

/// How a rule turns a matching visit into points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointsSpec {
    Fixed {
        points: i64,
    },
    ByInsuranceType {
        #[serde(default)]
        medical: Option<i64>,
        #[serde(default)]
        long_term_care: Option<i64>,
    },
    ByDeathLocation {
        entries: Vec<DeathLocationPoints>,
    },
    /// Highest tier whose `min_minutes` the visit duration reaches.
    DurationTiers {
        tiers: Vec<DurationTier>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatientWindowKind {
    SpecialManagement {
        #[serde(default)]
        management: Option<SpecialManagementKind>,
    },
    SpecialInstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingAnchor {
    DeathDate,
    VisitDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBasis {
    Start,
    End,
    Either,
}

/// Closed set of predefined condition checks a rule may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionSpec {
    /// Visit date inside one of the patient's windows of the given kind.
    PatientWindow { window: PatientWindowKind },
    /// Qualifying visits within `window_days` calendar days of the anchor
    /// date reach `minimum`. The window ends the day before the anchor, or on
    /// it when `include_reference_date` is set.
    RollingVisitCount {
        flag: VisitFlag,
        window_days: u32,
        minimum: u32,
        anchor: RollingAnchor,
        #[serde(default)]
        include_reference_date: bool,
        #[serde(default)]
        require_visit_on_reference: bool,
    },
    /// Actual duration strictly greater than `minutes`.
    DurationOver { minutes: i64 },
    /// Clock range `[from, to)`; wraps past midnight when `from > to`.
    TimeOfDay {
        from: NaiveTime,
        to: NaiveTime,
        basis: TimeBasis,
    },
    FirstRecordOfMonth,
    VisitFlag { flag: VisitFlag },
    PatientFlag { flag: PatientFlag },
    FacilityCapability { capability: FacilityCapability },
    /// The visit is at least the `at_least`-th eligible visit of its day.
    NthVisitOfDay { at_least: u32 },
    DeathLocation { locations: Vec<DeathLocation> },
}

impl ConditionSpec {
    pub const fn label(&self) -> &'static str {
        match self {
            ConditionSpec::PatientWindow { .. } => "patient_window",
            ConditionSpec::RollingVisitCount { .. } => "rolling_visit_count",
            ConditionSpec::DurationOver { .. } => "duration_over",
            ConditionSpec::TimeOfDay { .. } => "time_of_day",
            ConditionSpec::FirstRecordOfMonth => "first_record_of_month",
            ConditionSpec::VisitFlag { .. } => "visit_flag",
            ConditionSpec::PatientFlag { .. } => "patient_flag",
            ConditionSpec::FacilityCapability { .. } => "facility_capability",
            ConditionSpec::NthVisitOfDay { .. } => "nth_visit_of_day",
            ConditionSpec::DeathLocation { .. } => "death_location",
        }
    }
}

/// Versioned bonus rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusRule {
    pub code: RuleCode,
    #[serde(default = "first_version")]
    pub version: u32,
    pub name: String,
    pub category: BonusCategory,
    pub insurance_type: InsuranceType,
    #[serde(default)]
    pub facility_id: Option<FacilityId>,
    pub valid_from: NaiveDate,
    /// Inclusive last day; `None` keeps the rule open ended.
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
    pub points: PointsSpec,
    #[serde(default)]
    pub monthly_limit: Option<MonthlyLimit>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub state: RuleState,
}

fn first_version() -> u32 {
    1
}

impl BonusRule {
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        date >= self.valid_from && self.valid_to.map_or(true, |end| date <= end)
    }

    pub fn overlaps(&self, period: &BillingPeriod) -> bool {
        self.valid_from <= period.last_day()
            && self.valid_to.map_or(true, |end| end >= period.first_day())
    }

    pub fn matches_facility(&self, facility_id: &FacilityId) -> bool {
        self.facility_id
            .as_ref()
            .map_or(true, |scoped| scoped == facility_id)
    }

    /// Longest trailing window any rolling-count condition looks back over.
    pub fn lookback_days(&self) -> u32 {
        self.conditions
            .iter()
            .filter_map(|condition| match condition {
                ConditionSpec::RollingVisitCount { window_days, .. } => Some(*window_days),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Whether the outcome on one visit can change when another visit of the
    /// month is added, edited, or removed.
    pub fn depends_on_other_visits(&self) -> bool {
        self.monthly_limit.is_some()
            || self.conditions.iter().any(|condition| {
                matches!(
                    condition,
                    ConditionSpec::FirstRecordOfMonth
                        | ConditionSpec::RollingVisitCount { .. }
                        | ConditionSpec::NthVisitOfDay { .. }
                )
            })
    }

    /// Structural checks that make a definition unusable regardless of context.
    pub fn validate(&self) -> Result<(), RuleDefinitionError> {
        if self.code.0.trim().is_empty() {
            return Err(RuleDefinitionError::MissingCode);
        }

        if let Some(end) = self.valid_to {
            if end < self.valid_from {
                return Err(RuleDefinitionError::InvertedWindow {
                    from: self.valid_from,
                    to: end,
                });
            }
        }

        match &self.points {
            PointsSpec::Fixed { .. } => {}
            PointsSpec::ByInsuranceType {
                medical,
                long_term_care,
            } => {
                let scoped = match self.insurance_type {
                    InsuranceType::Medical => medical,
                    InsuranceType::LongTermCare => long_term_care,
                };
                if scoped.is_none() {
                    return Err(RuleDefinitionError::MissingSchedule(format!(
                        "no {} entry",
                        self.insurance_type.label()
                    )));
                }
            }
            PointsSpec::ByDeathLocation { entries } => {
                if entries.is_empty() {
                    return Err(RuleDefinitionError::MissingSchedule(
                        "death location table is empty".to_string(),
                    ));
                }
            }
            PointsSpec::DurationTiers { tiers } => {
                if tiers.is_empty() {
                    return Err(RuleDefinitionError::MissingSchedule(
                        "duration tier list is empty".to_string(),
                    ));
                }
            }
        }

        if let Some(limit) = self.monthly_limit {
            if limit.max() == 0 {
                return Err(RuleDefinitionError::ZeroMonthlyLimit);
            }
        }

        for condition in &self.conditions {
            match condition {
                ConditionSpec::RollingVisitCount { window_days: 0, .. } => {
                    return Err(RuleDefinitionError::InvalidCondition {
                        condition: condition.label(),
                        detail: "window must span at least one day".to_string(),
                    });
                }
                ConditionSpec::TimeOfDay { from, to, .. } if from == to => {
                    return Err(RuleDefinitionError::InvalidCondition {
                        condition: condition.label(),
                        detail: format!("empty clock range {from}"),
                    });
                }
                ConditionSpec::NthVisitOfDay { at_least: 0 } => {
                    return Err(RuleDefinitionError::InvalidCondition {
                        condition: condition.label(),
                        detail: "ordinal starts at one".to_string(),
                    });
                }
                ConditionSpec::DeathLocation { locations } if locations.is_empty() => {
                    return Err(RuleDefinitionError::InvalidCondition {
                        condition: condition.label(),
                        detail: "no locations listed".to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Reasons a rule definition cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleDefinitionError {
    #[error("rule code is blank")]
    MissingCode,
    #[error("valid_to {to} precedes valid_from {from}")]
    InvertedWindow { from: NaiveDate, to: NaiveDate },
    #[error("points schedule unusable: {0}")]
    MissingSchedule(String),
    #[error("monthly limit must allow at least one application")]
    ZeroMonthlyLimit,
    #[error("{condition} condition invalid: {detail}")]
    InvalidCondition {
        condition: &'static str,
        detail: String,
    },
}

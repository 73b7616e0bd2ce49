use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for patients owned by the care records system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatientId(pub String);

/// Identifier wrapper for nursing stations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FacilityId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NurseId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VisitId(pub String);

/// Operator stamping lifecycle transitions (supplied by the auth layer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub String);

/// Insurance scheme a receipt is billed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsuranceType {
    Medical,
    LongTermCare,
}

impl InsuranceType {
    pub const fn label(self) -> &'static str {
        match self {
            InsuranceType::Medical => "medical",
            InsuranceType::LongTermCare => "long_term_care",
        }
    }
}

/// Calendar month a receipt covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodError> {
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(PeriodError { year, month });
        }
        Ok(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|next| next - Duration::days(1))
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid billing period {year}-{month:02}")]
pub struct PeriodError {
    pub year: i32,
    pub month: u32,
}

/// Half-open date window `[start, end)`; an absent end means open ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.map_or(true, |end| date < end)
    }

    pub fn overlaps(&self, from: NaiveDate, to_inclusive: NaiveDate) -> bool {
        self.start <= to_inclusive && self.end.map_or(true, |end| end > from)
    }
}

/// Documentation workflow state of a visit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Draft,
    Completed,
    Reviewed,
}

impl VisitStatus {
    pub const fn is_billable(self) -> bool {
        matches!(self, VisitStatus::Completed | VisitStatus::Reviewed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    pub body_temperature: Option<f32>,
    pub systolic: Option<u16>,
    pub diastolic: Option<u16>,
    pub pulse: Option<u16>,
    pub spo2: Option<u8>,
}

/// Visit facts written by care documentation; read-only to billing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub id: VisitId,
    pub patient_id: PatientId,
    pub facility_id: FacilityId,
    pub nurse_id: NurseId,
    pub visit_date: NaiveDate,
    #[serde(default)]
    pub actual_start: Option<NaiveDateTime>,
    #[serde(default)]
    pub actual_end: Option<NaiveDateTime>,
    pub status: VisitStatus,
    #[serde(default)]
    pub deleted_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub is_terminal_care: bool,
    #[serde(default)]
    pub is_discharge_date: bool,
    #[serde(default)]
    pub is_emergency: bool,
    #[serde(default)]
    pub vitals: Option<VitalSigns>,
}

impl VisitRecord {
    pub fn is_eligible(&self) -> bool {
        self.status.is_billable() && self.deleted_at.is_none()
    }

    pub fn duration_minutes(&self) -> Option<i64> {
        match (self.actual_start, self.actual_end) {
            (Some(start), Some(end)) => Some((end - start).num_minutes()),
            _ => None,
        }
    }

    pub fn has_flag(&self, flag: VisitFlag) -> bool {
        match flag {
            VisitFlag::Any => true,
            VisitFlag::TerminalCare => self.is_terminal_care,
            VisitFlag::DischargeDate => self.is_discharge_date,
            VisitFlag::Emergency => self.is_emergency,
        }
    }
}

/// Visit-level markers rules can require or count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitFlag {
    Any,
    TerminalCare,
    DischargeDate,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialManagementKind {
    Catheter,
    Ostomy,
    Tracheostomy,
    HomeOxygen,
    PressureUlcer,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialManagementWindow {
    pub kind: SpecialManagementKind,
    pub window: DateWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathLocation {
    Home,
    CareFacility,
    Hospital,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    pub date: NaiveDate,
    pub location: DeathLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceCard {
    pub insurance_type: InsuranceType,
    pub number: String,
    pub coverage: DateWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorOrder {
    pub physician: String,
    pub coverage: DateWindow,
}

/// Patient attributes the billing core consumes from the records system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientProfile {
    pub id: PatientId,
    pub name: String,
    #[serde(default)]
    pub insured_number: Option<String>,
    #[serde(default)]
    pub insurance_cards: Vec<InsuranceCard>,
    #[serde(default)]
    pub doctor_orders: Vec<DoctorOrder>,
    #[serde(default)]
    pub special_management: Vec<SpecialManagementWindow>,
    #[serde(default)]
    pub special_instructions: Vec<DateWindow>,
    #[serde(default)]
    pub death: Option<DeathRecord>,
    #[serde(default)]
    pub lives_in_shared_building: bool,
}

impl PatientProfile {
    pub fn has_flag(&self, flag: PatientFlag) -> bool {
        match flag {
            PatientFlag::SharedBuildingResidence => self.lives_in_shared_building,
            PatientFlag::Deceased => self.death.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientFlag {
    SharedBuildingResidence,
    Deceased,
}

/// Bonus-relevant service capabilities a station has registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityCapability {
    TwentyFourHourResponse,
    SpecialistManagement,
    TerminalCareSystem,
    EmergencyVisits,
}

/// Facility attributes the billing core consumes from the operations system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityProfile {
    pub id: FacilityId,
    pub name: String,
    #[serde(default)]
    pub facility_code: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<FacilityCapability>,
    /// Regional long-term-care unit price in hundredths of a yen (10.72 yen = 1072).
    pub ltc_unit_price: u32,
}

impl FacilityProfile {
    pub fn has_capability(&self, capability: FacilityCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Convert points under the given scheme into a yen amount.
    pub fn amount_for(&self, insurance_type: InsuranceType, points: i64) -> i64 {
        match insurance_type {
            InsuranceType::Medical => points,
            InsuranceType::LongTermCare => {
                (points * i64::from(self.ltc_unit_price)).div_euclid(100)
            }
        }
    }
}

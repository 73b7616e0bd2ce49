//! Read-only access to visit facts and the collaborator records billing consumes.
//!
//! `eligible_in_order` is the single definition of which visits count and in
//! what order they are processed. Recalculation and the display listing both
//! go through it so the "first record of the month" never differs between them.

use std::cmp::Ordering;

use chrono::NaiveDate;

use super::domain::{
    BillingPeriod, FacilityId, FacilityProfile, PatientId, PatientProfile, VisitId, VisitRecord,
};
use super::repository::RepositoryError;

/// Visit storage owned by care documentation. Billing never writes through it.
pub trait VisitRecordStore: Send + Sync {
    fn fetch(&self, id: &VisitId) -> Result<Option<VisitRecord>, RepositoryError>;

    /// Every record (any status, deleted or not) for the patient at the facility
    /// whose visit date falls within `[from, to]`.
    fn for_patient_between(
        &self,
        patient_id: &PatientId,
        facility_id: &FacilityId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<VisitRecord>, RepositoryError>;
}

/// Lookup of patient attributes (insurance, special management, death metadata).
pub trait PatientDirectory: Send + Sync {
    fn patient(&self, id: &PatientId) -> Result<Option<PatientProfile>, RepositoryError>;
}

/// Lookup of facility capability flags and unit prices.
pub trait FacilityDirectory: Send + Sync {
    fn facility(&self, id: &FacilityId) -> Result<Option<FacilityProfile>, RepositoryError>;
}

/// Canonical processing order: visit date, then actual start with missing
/// starts last, then visit id.
pub fn canonical_order(left: &VisitRecord, right: &VisitRecord) -> Ordering {
    left.visit_date
        .cmp(&right.visit_date)
        .then_with(|| match (left.actual_start, right.actual_start) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| left.id.cmp(&right.id))
}

/// Filter to billable records inside the period and sort them canonically.
pub fn eligible_in_order<I>(records: I, period: &BillingPeriod) -> Vec<VisitRecord>
where
    I: IntoIterator<Item = VisitRecord>,
{
    let mut eligible: Vec<VisitRecord> = records
        .into_iter()
        .filter(|record| record.is_eligible() && period.contains(record.visit_date))
        .collect();
    eligible.sort_by(canonical_order);
    eligible
}

/// The month's visits for one patient at one facility, split into the eligible
/// ordered set and the ids of everything else in the month.
#[derive(Debug, Clone)]
pub struct MonthVisits {
    pub eligible: Vec<VisitRecord>,
    pub all_ids: Vec<VisitId>,
}

impl MonthVisits {
    pub fn load<S>(
        store: &S,
        patient_id: &PatientId,
        facility_id: &FacilityId,
        period: &BillingPeriod,
    ) -> Result<Self, RepositoryError>
    where
        S: VisitRecordStore + ?Sized,
    {
        let records =
            store.for_patient_between(patient_id, facility_id, period.first_day(), period.last_day())?;
        let mut all_ids: Vec<VisitId> = records.iter().map(|record| record.id.clone()).collect();
        all_ids.sort();
        let eligible = eligible_in_order(records, period);
        Ok(Self { eligible, all_ids })
    }

    pub fn first_id(&self) -> Option<&VisitId> {
        self.eligible.first().map(|record| &record.id)
    }
}

//! Mutex-backed stores used by the API service and the test suites.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;

use super::domain::{
    BillingPeriod, FacilityId, FacilityProfile, PatientId, PatientProfile, VisitId, VisitRecord,
};
use super::evaluation::MonthlyUsage;
use super::receipt::{BonusApplication, MonthlyReceipt, ReceiptId, ReceiptKey};
use super::repository::{BillingStore, ReceiptCommit, ReplaceScope, RepositoryError};
use super::visits::{FacilityDirectory, PatientDirectory, VisitRecordStore};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, RepositoryError> {
    mutex
        .lock()
        .map_err(|_| RepositoryError::Unavailable("store mutex poisoned".to_string()))
}

#[derive(Debug, Default)]
struct BillingTables {
    receipts: HashMap<ReceiptId, MonthlyReceipt>,
    keys: HashMap<ReceiptKey, ReceiptId>,
    applications: Vec<BonusApplication>,
}

/// Receipt and application tables guarded by one mutex, so a commit is a
/// single critical section.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBillingStore {
    tables: Arc<Mutex<BillingTables>>,
}

impl InMemoryBillingStore {
    pub fn all_applications(&self) -> Result<Vec<BonusApplication>, RepositoryError> {
        Ok(lock(&self.tables)?.applications.clone())
    }
}

impl BillingStore for InMemoryBillingStore {
    fn receipt(&self, id: &ReceiptId) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        Ok(lock(&self.tables)?.receipts.get(id).cloned())
    }

    fn receipt_by_key(&self, key: &ReceiptKey) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .keys
            .get(key)
            .and_then(|id| tables.receipts.get(id))
            .cloned())
    }

    fn applications(&self, receipt_id: &ReceiptId) -> Result<Vec<BonusApplication>, RepositoryError> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .applications
            .iter()
            .filter(|application| application.receipt_id == *receipt_id)
            .cloned()
            .collect())
    }

    fn monthly_usage(
        &self,
        patient_id: &PatientId,
        period: &BillingPeriod,
        excluding: &ReplaceScope,
    ) -> Result<MonthlyUsage, RepositoryError> {
        let tables = lock(&self.tables)?;
        let mut usage = MonthlyUsage::new();
        for application in tables.applications.iter().filter(|application| {
            application.patient_id == *patient_id
                && application.period == *period
                && !excluding.covers(application)
        }) {
            *usage.entry(application.rule_code.clone()).or_insert(0) += 1;
        }
        Ok(usage)
    }

    fn commit(&self, commit: ReceiptCommit) -> Result<MonthlyReceipt, RepositoryError> {
        let ReceiptCommit {
            receipt,
            scope,
            applications,
        } = commit;

        if scope.receipt_id != receipt.id {
            return Err(RepositoryError::Conflict(
                "scope does not belong to the committed receipt".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for application in &applications {
            if !scope.covers(application) {
                return Err(RepositoryError::Conflict(format!(
                    "application for visit {} falls outside the replace scope",
                    application.visit_id.0
                )));
            }
            if !seen.insert((&application.visit_id, &application.rule_code)) {
                return Err(RepositoryError::Conflict(format!(
                    "duplicate application of {} on visit {}",
                    application.rule_code.0, application.visit_id.0
                )));
            }
        }

        let mut tables = lock(&self.tables)?;
        if let Some(existing) = tables.keys.get(&receipt.key) {
            if *existing != receipt.id {
                return Err(RepositoryError::Conflict(format!(
                    "receipt key already held by {}",
                    existing.0
                )));
            }
        }

        tables
            .applications
            .retain(|application| !scope.covers(application));
        tables.applications.extend(applications);
        tables.keys.insert(receipt.key.clone(), receipt.id.clone());
        tables.receipts.insert(receipt.id.clone(), receipt.clone());
        Ok(receipt)
    }

    fn save_receipt(&self, receipt: MonthlyReceipt) -> Result<MonthlyReceipt, RepositoryError> {
        let mut tables = lock(&self.tables)?;
        if !tables.receipts.contains_key(&receipt.id) {
            return Err(RepositoryError::NotFound);
        }
        tables.receipts.insert(receipt.id.clone(), receipt.clone());
        Ok(receipt)
    }

    fn delete_receipt(&self, id: &ReceiptId) -> Result<(), RepositoryError> {
        let mut tables = lock(&self.tables)?;
        let receipt = tables.receipts.remove(id).ok_or(RepositoryError::NotFound)?;
        tables.keys.remove(&receipt.key);
        tables
            .applications
            .retain(|application| application.receipt_id != *id);
        Ok(())
    }
}

/// Visit records keyed by id; writes stand in for the documentation system.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVisitStore {
    records: Arc<Mutex<HashMap<VisitId, VisitRecord>>>,
}

impl InMemoryVisitStore {
    pub fn upsert(&self, record: VisitRecord) -> Result<(), RepositoryError> {
        lock(&self.records)?.insert(record.id.clone(), record);
        Ok(())
    }
}

impl VisitRecordStore for InMemoryVisitStore {
    fn fetch(&self, id: &VisitId) -> Result<Option<VisitRecord>, RepositoryError> {
        Ok(lock(&self.records)?.get(id).cloned())
    }

    fn for_patient_between(
        &self,
        patient_id: &PatientId,
        facility_id: &FacilityId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<VisitRecord>, RepositoryError> {
        Ok(lock(&self.records)?
            .values()
            .filter(|record| {
                record.patient_id == *patient_id
                    && record.facility_id == *facility_id
                    && record.visit_date >= from
                    && record.visit_date <= to
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPatientDirectory {
    patients: Arc<Mutex<HashMap<PatientId, PatientProfile>>>,
}

impl InMemoryPatientDirectory {
    pub fn upsert(&self, patient: PatientProfile) -> Result<(), RepositoryError> {
        lock(&self.patients)?.insert(patient.id.clone(), patient);
        Ok(())
    }
}

impl PatientDirectory for InMemoryPatientDirectory {
    fn patient(&self, id: &PatientId) -> Result<Option<PatientProfile>, RepositoryError> {
        Ok(lock(&self.patients)?.get(id).cloned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryFacilityDirectory {
    facilities: Arc<Mutex<HashMap<FacilityId, FacilityProfile>>>,
}

impl InMemoryFacilityDirectory {
    pub fn upsert(&self, facility: FacilityProfile) -> Result<(), RepositoryError> {
        lock(&self.facilities)?.insert(facility.id.clone(), facility);
        Ok(())
    }
}

impl FacilityDirectory for InMemoryFacilityDirectory {
    fn facility(&self, id: &FacilityId) -> Result<Option<FacilityProfile>, RepositoryError> {
        Ok(lock(&self.facilities)?.get(id).cloned())
    }
}

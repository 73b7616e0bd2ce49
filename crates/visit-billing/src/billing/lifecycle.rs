//! Receipt lifecycle: recalculation boundary plus the confirm / reopen / send
//! state machine.
//!
//! Monthly limits are counted over every receipt of a patient's month, so all
//! operations on receipts of one patient and month run under a shared lock.
//! Other patients and months proceed in parallel; the only thing they share
//! is the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::aggregation::{limits_from_snapshot, AggregationInput, MonthlyLimits, ReceiptAggregator};
use super::catalog::{BonusRule, CatalogError, CatalogSnapshot, RuleCatalog, RuleCode};
use super::domain::{
    BillingPeriod, FacilityId, FacilityProfile, InsuranceType, NurseId, OperatorId, PatientId,
    PatientProfile, VisitId, VisitRecord,
};
use super::evaluation::{EvaluationPass, PassKind, RuleEvaluator};
use super::receipt::{
    BonusApplication, MonthlyReceipt, ReceiptId, ReceiptKey, ReceiptMessage, ReceiptStatus,
    ValidationReport,
};
use super::repository::{BillingStore, ReceiptCommit, ReplaceScope, RepositoryError};
use super::visits::{canonical_order, FacilityDirectory, MonthVisits, PatientDirectory, VisitRecordStore};
use crate::config::ValidationSettings;

/// Source of "now" for audit stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Read-only collaborators owned by other systems.
#[derive(Clone)]
pub struct BillingSources {
    pub visits: Arc<dyn VisitRecordStore>,
    pub patients: Arc<dyn PatientDirectory>,
    pub facilities: Arc<dyn FacilityDirectory>,
}

static RECEIPT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_receipt_id() -> ReceiptId {
    let id = RECEIPT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    ReceiptId(format!("rcpt-{id:06}"))
}

type MonthSlot = (PatientId, BillingPeriod);

fn month_slot(key: &ReceiptKey) -> MonthSlot {
    (key.patient_id.clone(), key.period)
}

/// One mutex per patient-month, created on first use and dropped once idle.
#[derive(Debug, Default)]
struct MonthLocks {
    inner: Mutex<HashMap<MonthSlot, Arc<Mutex<()>>>>,
}

impl MonthLocks {
    fn run<T>(&self, slot: MonthSlot, op: impl FnOnce() -> T) -> T {
        let lock = self.table().entry(slot.clone()).or_default().clone();
        let result = {
            let _guard = hold(&lock);
            op()
        };
        drop(lock);

        let mut table = self.table();
        if table
            .get(&slot)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&slot);
        }
        result
    }

    fn table(&self) -> MutexGuard<'_, HashMap<MonthSlot, Arc<Mutex<()>>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn len(&self) -> usize {
        self.table().len()
    }
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    // Receipt state lives in the store and commits are atomic, so a poisoned
    // lock carries no half-written data.
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Row of the read-only month listing shown next to a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitListingEntry {
    pub visit_id: VisitId,
    pub visit_date: NaiveDate,
    pub actual_start: Option<NaiveDateTime>,
    pub nurse_id: NurseId,
    pub is_first_record_of_month: bool,
    pub bonuses: Vec<RuleCode>,
}

/// Service composing the catalog, evaluator, aggregator, and store.
pub struct ReceiptLifecycleService<S> {
    store: Arc<S>,
    sources: BillingSources,
    catalog: Arc<RuleCatalog>,
    aggregator: ReceiptAggregator,
    clock: Arc<dyn Clock>,
    locks: MonthLocks,
}

impl<S> ReceiptLifecycleService<S>
where
    S: BillingStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        sources: BillingSources,
        catalog: Arc<RuleCatalog>,
        settings: ValidationSettings,
    ) -> Self {
        Self::with_clock(store, sources, catalog, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<S>,
        sources: BillingSources,
        catalog: Arc<RuleCatalog>,
        settings: ValidationSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sources,
            catalog,
            aggregator: ReceiptAggregator::new(settings),
            clock,
            locks: MonthLocks::default(),
        }
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    /// Patient-months with a lock currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Rebuild every application and the snapshot of one receipt, creating the
    /// receipt on first use.
    pub fn recalculate(&self, key: ReceiptKey) -> Result<MonthlyReceipt, ReceiptServiceError> {
        self.locks.run(month_slot(&key), || self.recalculate_locked(key))
    }

    /// Re-evaluate one visit and refresh its receipt's totals.
    ///
    /// Rules whose outcome depends on the rest of the month (monthly limits,
    /// first-record gates, rolling and same-day counts) are re-run over the
    /// whole month in the same commit, so the result always equals a full
    /// rebuild.
    pub fn recalculate_visit(
        &self,
        visit_id: &VisitId,
        insurance_type: InsuranceType,
    ) -> Result<MonthlyReceipt, ReceiptServiceError> {
        let visit = self
            .sources
            .visits
            .fetch(visit_id)?
            .ok_or_else(|| ReceiptServiceError::VisitNotFound(visit_id.clone()))?;

        let key = ReceiptKey {
            patient_id: visit.patient_id.clone(),
            facility_id: visit.facility_id.clone(),
            period: BillingPeriod::containing(visit.visit_date),
            insurance_type,
        };
        self.locks
            .run(month_slot(&key), || self.recalculate_visit_locked(key, visit_id))
    }

    /// Re-run validation against the persisted applications.
    pub fn validate(&self, receipt_id: &ReceiptId) -> Result<ValidationReport, ReceiptServiceError> {
        self.with_receipt(receipt_id, |service, mut receipt| {
            if receipt.is_sent {
                return Ok(receipt.validation());
            }

            let patient = service.patient(&receipt.key.patient_id)?;
            let facility = service.facility(&receipt.key.facility_id)?;
            let month = MonthVisits::load(
                service.sources.visits.as_ref(),
                &receipt.key.patient_id,
                &receipt.key.facility_id,
                &receipt.key.period,
            )?;
            let applications = service.store.applications(&receipt.id)?;
            let limits = service.limits_for(&applications);
            let outside_usage = service.store.monthly_usage(
                &receipt.key.patient_id,
                &receipt.key.period,
                &ReplaceScope::receipt(receipt.id.clone()),
            )?;

            let report = service.aggregator.validate(&AggregationInput {
                key: &receipt.key,
                patient: &patient,
                facility: &facility,
                visits: &month.eligible,
                applications: &applications,
                base_visit_points: 0,
                monthly_limits: &limits,
                outside_usage: &outside_usage,
            });

            receipt.apply_validation(report.clone());
            service.store.save_receipt(receipt)?;
            Ok(report)
        })
    }

    /// Confirm a receipt. Refused while errors are present.
    pub fn finalize(
        &self,
        receipt_id: &ReceiptId,
        operator: OperatorId,
    ) -> Result<MonthlyReceipt, ReceiptServiceError> {
        self.with_receipt(receipt_id, |service, mut receipt| {
            match receipt.status() {
                ReceiptStatus::Sent => return Err(ReceiptServiceError::AlreadySent),
                ReceiptStatus::Confirmed => return Err(ReceiptServiceError::AlreadyConfirmed),
                ReceiptStatus::Draft => {}
            }
            if receipt.has_errors {
                return Err(ReceiptServiceError::HasErrors {
                    messages: receipt.errors.clone(),
                });
            }

            receipt.is_confirmed = true;
            receipt.confirmed_at = Some(service.clock.now());
            receipt.confirmed_by = Some(operator.clone());
            let receipt = service.store.save_receipt(receipt)?;
            info!(receipt = %receipt.id.0, operator = %operator.0, "receipt confirmed");
            Ok(receipt)
        })
    }

    /// Return a confirmed receipt to draft. Refused once sent.
    pub fn reopen(&self, receipt_id: &ReceiptId) -> Result<MonthlyReceipt, ReceiptServiceError> {
        self.with_receipt(receipt_id, |service, mut receipt| {
            match receipt.status() {
                ReceiptStatus::Sent => return Err(ReceiptServiceError::AlreadySent),
                ReceiptStatus::Draft => return Err(ReceiptServiceError::NotConfirmed),
                ReceiptStatus::Confirmed => {}
            }

            receipt.is_confirmed = false;
            receipt.confirmed_at = None;
            receipt.confirmed_by = None;
            let receipt = service.store.save_receipt(receipt)?;
            info!(receipt = %receipt.id.0, "receipt reopened");
            Ok(receipt)
        })
    }

    /// Record transmission to the insurer; the receipt is frozen afterwards.
    pub fn mark_sent(&self, receipt_id: &ReceiptId) -> Result<MonthlyReceipt, ReceiptServiceError> {
        self.with_receipt(receipt_id, |service, mut receipt| {
            match receipt.status() {
                ReceiptStatus::Sent => return Err(ReceiptServiceError::AlreadySent),
                ReceiptStatus::Draft => return Err(ReceiptServiceError::NotConfirmed),
                ReceiptStatus::Confirmed => {}
            }

            receipt.is_sent = true;
            receipt.sent_at = Some(service.clock.now());
            let receipt = service.store.save_receipt(receipt)?;
            info!(receipt = %receipt.id.0, "receipt marked sent");
            Ok(receipt)
        })
    }

    pub fn get(&self, receipt_id: &ReceiptId) -> Result<MonthlyReceipt, ReceiptServiceError> {
        self.store
            .receipt(receipt_id)?
            .ok_or_else(|| ReceiptServiceError::ReceiptNotFound(receipt_id.clone()))
    }

    pub fn applications(
        &self,
        receipt_id: &ReceiptId,
    ) -> Result<Vec<BonusApplication>, ReceiptServiceError> {
        self.get(receipt_id)?;
        Ok(self.store.applications(receipt_id)?)
    }

    /// Administrative removal of a receipt and its applications.
    pub fn delete(&self, receipt_id: &ReceiptId) -> Result<(), ReceiptServiceError> {
        self.with_receipt(receipt_id, |service, receipt| {
            if receipt.is_sent {
                return Err(ReceiptServiceError::AlreadySent);
            }
            service.store.delete_receipt(&receipt.id)?;
            info!(receipt = %receipt.id.0, "receipt deleted");
            Ok(())
        })
    }

    /// The month's eligible visits in processing order, with applied bonuses.
    pub fn month_visit_listing(
        &self,
        key: &ReceiptKey,
    ) -> Result<Vec<VisitListingEntry>, ReceiptServiceError> {
        let month = MonthVisits::load(
            self.sources.visits.as_ref(),
            &key.patient_id,
            &key.facility_id,
            &key.period,
        )?;
        let applications = match self.store.receipt_by_key(key)? {
            Some(receipt) => self.store.applications(&receipt.id)?,
            None => Vec::new(),
        };

        let first = month.first_id().cloned();
        Ok(month
            .eligible
            .into_iter()
            .map(|visit| {
                let mut bonuses: Vec<RuleCode> = applications
                    .iter()
                    .filter(|application| application.visit_id == visit.id)
                    .map(|application| application.rule_code.clone())
                    .collect();
                bonuses.sort();
                VisitListingEntry {
                    is_first_record_of_month: first.as_ref() == Some(&visit.id),
                    visit_id: visit.id,
                    visit_date: visit.visit_date,
                    actual_start: visit.actual_start,
                    nurse_id: visit.nurse_id,
                    bonuses,
                }
            })
            .collect())
    }

    fn recalculate_visit_locked(
        &self,
        key: ReceiptKey,
        visit_id: &VisitId,
    ) -> Result<MonthlyReceipt, ReceiptServiceError> {
        let Some(mut receipt) = self.store.receipt_by_key(&key)? else {
            return self.recalculate_locked(key);
        };
        ensure_draft(&receipt)?;

        let inputs = self.load_inputs(&key)?;
        let now = self.clock.now();
        let receipt_id = receipt.id.clone();

        let (month_wide, per_visit) = inputs
            .snapshot
            .partition(BonusRule::depends_on_other_visits);
        let scope = ReplaceScope::visit(receipt_id.clone(), visit_id.clone())
            .with_rules(month_wide.rules().iter().map(|rule| rule.code.clone()));
        let prior_usage = self
            .store
            .monthly_usage(&key.patient_id, &key.period, &scope)?;

        let run_pass = |snapshot: CatalogSnapshot, kind: PassKind| {
            RuleEvaluator::new(snapshot).evaluate(&EvaluationPass {
                receipt_id: &receipt_id,
                patient: &inputs.patient,
                facility: &inputs.facility,
                insurance_type: key.insurance_type,
                period: key.period,
                month_visits: &inputs.month.eligible,
                history: &inputs.history,
                prior_usage: &prior_usage,
                kind: &kind,
                computed_at: now,
            })
        };
        let mut fresh = run_pass(per_visit, PassKind::SingleVisit(visit_id.clone()));
        fresh.extend(run_pass(month_wide, PassKind::FullMonth));

        let mut combined: Vec<BonusApplication> = self
            .store
            .applications(&receipt_id)?
            .into_iter()
            .filter(|application| !scope.covers(application))
            .collect();
        combined.extend(fresh.iter().cloned());

        let outside_usage = self.store.monthly_usage(
            &key.patient_id,
            &key.period,
            &ReplaceScope::receipt(receipt_id.clone()),
        )?;
        let limits = limits_from_snapshot(&inputs.snapshot);
        let snapshot = self.aggregator.aggregate(&AggregationInput {
            key: &key,
            patient: &inputs.patient,
            facility: &inputs.facility,
            visits: &inputs.month.eligible,
            applications: &combined,
            base_visit_points: inputs.snapshot.base_visit_points(),
            monthly_limits: &limits,
            outside_usage: &outside_usage,
        });
        receipt.apply_snapshot(snapshot, now);

        let applied = fresh.len();
        let receipt = self.store.commit(ReceiptCommit {
            receipt,
            scope,
            applications: fresh,
        })?;

        info!(
            receipt = %receipt.id.0,
            visit = %visit_id.0,
            applied,
            total_points = receipt.totals.grand_total_points,
            "visit recalculated"
        );
        Ok(receipt)
    }

    fn recalculate_locked(&self, key: ReceiptKey) -> Result<MonthlyReceipt, ReceiptServiceError> {
        let existing = self.store.receipt_by_key(&key)?;
        if let Some(receipt) = &existing {
            ensure_draft(receipt)?;
        }

        let inputs = self.load_inputs(&key)?;
        let now = self.clock.now();
        let mut receipt =
            existing.unwrap_or_else(|| MonthlyReceipt::new(next_receipt_id(), key.clone(), now));

        let scope = ReplaceScope::receipt(receipt.id.clone());
        let prior_usage = self
            .store
            .monthly_usage(&key.patient_id, &key.period, &scope)?;

        let evaluator = RuleEvaluator::new(inputs.snapshot);
        let applications = evaluator.evaluate(&EvaluationPass {
            receipt_id: &receipt.id,
            patient: &inputs.patient,
            facility: &inputs.facility,
            insurance_type: key.insurance_type,
            period: key.period,
            month_visits: &inputs.month.eligible,
            history: &inputs.history,
            prior_usage: &prior_usage,
            kind: &PassKind::FullMonth,
            computed_at: now,
        });

        let limits = limits_from_snapshot(evaluator.snapshot());
        let snapshot = self.aggregator.aggregate(&AggregationInput {
            key: &key,
            patient: &inputs.patient,
            facility: &inputs.facility,
            visits: &inputs.month.eligible,
            applications: &applications,
            base_visit_points: evaluator.snapshot().base_visit_points(),
            monthly_limits: &limits,
            outside_usage: &prior_usage,
        });
        receipt.apply_snapshot(snapshot, now);

        let applied = applications.len();
        let receipt = self.store.commit(ReceiptCommit {
            receipt,
            scope,
            applications,
        })?;

        info!(
            receipt = %receipt.id.0,
            patient = %key.patient_id.0,
            period = %format!("{}-{:02}", key.period.year, key.period.month),
            visits = receipt.totals.visit_count,
            applied,
            total_points = receipt.totals.grand_total_points,
            has_errors = receipt.has_errors,
            "receipt recalculated"
        );
        Ok(receipt)
    }

    /// Resolve the receipt, take its patient-month lock, and hand the freshly
    /// re-read receipt to `op`.
    fn with_receipt<T, F>(&self, receipt_id: &ReceiptId, op: F) -> Result<T, ReceiptServiceError>
    where
        F: FnOnce(&Self, MonthlyReceipt) -> Result<T, ReceiptServiceError>,
    {
        let key = self.get(receipt_id)?.key;
        self.locks.run(month_slot(&key), || {
            let receipt = self.get(receipt_id)?;
            op(self, receipt)
        })
    }

    fn load_inputs(&self, key: &ReceiptKey) -> Result<PassInputs, ReceiptServiceError> {
        let patient = self.patient(&key.patient_id)?;
        let facility = self.facility(&key.facility_id)?;
        let snapshot = self
            .catalog
            .snapshot(key.insurance_type, &key.facility_id, &key.period)?;

        let month = MonthVisits::load(
            self.sources.visits.as_ref(),
            &key.patient_id,
            &key.facility_id,
            &key.period,
        )?;

        let lookback = i64::from(snapshot.lookback_days());
        let history_from = key.period.first_day() - Duration::days(lookback);
        let history_to = patient
            .death
            .map(|death| death.date.max(key.period.last_day()))
            .unwrap_or_else(|| key.period.last_day());
        let mut history: Vec<VisitRecord> = self
            .sources
            .visits
            .for_patient_between(&key.patient_id, &key.facility_id, history_from, history_to)?
            .into_iter()
            .filter(VisitRecord::is_eligible)
            .collect();
        history.sort_by(canonical_order);

        Ok(PassInputs {
            patient,
            facility,
            snapshot,
            month,
            history,
        })
    }

    fn limits_for(&self, applications: &[BonusApplication]) -> MonthlyLimits {
        applications
            .iter()
            .filter_map(|application| {
                self.catalog
                    .rule(&application.rule_code, application.rule_version)
                    .and_then(|rule| rule.monthly_limit)
                    .map(|limit| (application.rule_code.clone(), limit.max()))
            })
            .collect()
    }

    fn patient(&self, id: &PatientId) -> Result<PatientProfile, ReceiptServiceError> {
        self.sources
            .patients
            .patient(id)?
            .ok_or_else(|| ReceiptServiceError::PatientNotFound(id.clone()))
    }

    fn facility(&self, id: &FacilityId) -> Result<FacilityProfile, ReceiptServiceError> {
        self.sources
            .facilities
            .facility(id)?
            .ok_or_else(|| ReceiptServiceError::FacilityNotFound(id.clone()))
    }
}

struct PassInputs {
    patient: PatientProfile,
    facility: FacilityProfile,
    snapshot: CatalogSnapshot,
    month: MonthVisits,
    history: Vec<VisitRecord>,
}

fn ensure_draft(receipt: &MonthlyReceipt) -> Result<(), ReceiptServiceError> {
    match receipt.status() {
        ReceiptStatus::Draft => Ok(()),
        ReceiptStatus::Confirmed => Err(ReceiptServiceError::AlreadyConfirmed),
        ReceiptStatus::Sent => Err(ReceiptServiceError::AlreadySent),
    }
}

/// Error raised by the lifecycle service.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptServiceError {
    #[error("receipt {} not found", .0.0)]
    ReceiptNotFound(ReceiptId),
    #[error("visit {} not found", .0.0)]
    VisitNotFound(VisitId),
    #[error("patient {} not found", .0.0)]
    PatientNotFound(PatientId),
    #[error("facility {} not found", .0.0)]
    FacilityNotFound(FacilityId),
    #[error("receipt has {} unresolved error(s)", .messages.len())]
    HasErrors { messages: Vec<ReceiptMessage> },
    #[error("receipt is already confirmed")]
    AlreadyConfirmed,
    #[error("receipt is not confirmed")]
    NotConfirmed,
    #[error("receipt has already been sent")]
    AlreadySent,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ReceiptServiceError {
    /// Stable reason code for UI rendering.
    pub fn code(&self) -> &'static str {
        match self {
            ReceiptServiceError::ReceiptNotFound(_) => "not_found",
            ReceiptServiceError::VisitNotFound(_) => "visit_not_found",
            ReceiptServiceError::PatientNotFound(_) => "patient_not_found",
            ReceiptServiceError::FacilityNotFound(_) => "facility_not_found",
            ReceiptServiceError::HasErrors { .. } => "has_errors",
            ReceiptServiceError::AlreadyConfirmed => "already_confirmed",
            ReceiptServiceError::NotConfirmed => "not_confirmed",
            ReceiptServiceError::AlreadySent => "already_sent",
            ReceiptServiceError::Catalog(_) => "catalog_unavailable",
            ReceiptServiceError::Repository(RepositoryError::Conflict(_)) => "conflict",
            ReceiptServiceError::Repository(RepositoryError::NotFound) => "not_found",
            ReceiptServiceError::Repository(RepositoryError::Unavailable(_)) => {
                "repository_unavailable"
            }
        }
    }

    pub fn messages(&self) -> Vec<String> {
        match self {
            ReceiptServiceError::HasErrors { messages } => messages
                .iter()
                .map(|message| message.message.clone())
                .collect(),
            other => vec![other.to_string()],
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ReceiptServiceError::Repository(error) => error.is_retryable(),
            _ => false,
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use axum::response::Response;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;

use crate::billing::catalog::{
    BonusCategory, BonusRule, CatalogSnapshot, ConditionSpec, DeathLocationPoints, MonthlyLimit,
    PointsSpec, RollingAnchor, RuleCatalog, RuleCode, RuleState, TimeBasis,
};
use crate::billing::domain::{
    BillingPeriod, DateWindow, DeathLocation, DeathRecord, DoctorOrder, FacilityCapability,
    FacilityId, FacilityProfile, InsuranceCard, InsuranceType, NurseId, PatientId, PatientProfile,
    VisitFlag, VisitId, VisitRecord, VisitStatus,
};
use crate::billing::evaluation::{EvaluationPass, MonthlyUsage, PassKind, RuleEvaluator};
use crate::billing::lifecycle::{BillingSources, Clock, ReceiptLifecycleService};
use crate::billing::memory::{
    InMemoryBillingStore, InMemoryFacilityDirectory, InMemoryPatientDirectory, InMemoryVisitStore,
};
use crate::billing::receipt::{BonusApplication, MonthlyReceipt, ReceiptId, ReceiptKey};
use crate::billing::repository::{BillingStore, ReceiptCommit, ReplaceScope, RepositoryError};
use crate::config::ValidationSettings;

pub(super) const MEDICAL_BASE: i64 = 5_550;
pub(super) const LTC_BASE: i64 = 516;

pub(super) fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub(super) fn dec(day: u32) -> NaiveDate {
    date(2024, 12, day)
}

pub(super) fn clock_time(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time")
}

fn stamp(day: NaiveDate, hour: u32, minute: u32) -> NaiveDateTime {
    day.and_time(clock_time(hour, minute))
}

pub(super) fn december() -> BillingPeriod {
    BillingPeriod::new(2024, 12).expect("valid period")
}

pub(super) fn patient_id() -> PatientId {
    PatientId("P-001".to_string())
}

pub(super) fn facility_id() -> FacilityId {
    FacilityId("F-001".to_string())
}

pub(super) fn december_key() -> ReceiptKey {
    ReceiptKey {
        patient_id: patient_id(),
        facility_id: facility_id(),
        period: december(),
        insurance_type: InsuranceType::Medical,
    }
}

/// Completed visit; `start` of `None` leaves both actual times empty.
pub(super) fn visit(id: &str, day: NaiveDate, start: Option<(u32, u32)>, minutes: i64) -> VisitRecord {
    let actual_start = start.map(|(hour, minute)| stamp(day, hour, minute));
    VisitRecord {
        id: VisitId(id.to_string()),
        patient_id: patient_id(),
        facility_id: facility_id(),
        nurse_id: NurseId("N-01".to_string()),
        visit_date: day,
        actual_start,
        actual_end: actual_start.map(|start| start + chrono::Duration::minutes(minutes)),
        status: VisitStatus::Completed,
        deleted_at: None,
        is_terminal_care: false,
        is_discharge_date: false,
        is_emergency: false,
        vitals: None,
    }
}

pub(super) fn terminal_visit(id: &str, day: NaiveDate) -> VisitRecord {
    let mut record = visit(id, day, Some((10, 0)), 60);
    record.is_terminal_care = true;
    record
}

/// Three ordinary December visits with start times.
pub(super) fn december_visits() -> Vec<VisitRecord> {
    vec![
        visit("V-1201", dec(1), Some((9, 0)), 60),
        visit("V-1203", dec(3), Some((10, 0)), 60),
        visit("V-1210", dec(10), Some((14, 0)), 60),
    ]
}

/// Patient with complete identifying data and coverage well past December.
pub(super) fn patient() -> PatientProfile {
    PatientProfile {
        id: patient_id(),
        name: "Hanako Sato".to_string(),
        insured_number: Some("0123-4567".to_string()),
        insurance_cards: vec![
            InsuranceCard {
                insurance_type: InsuranceType::Medical,
                number: "MED-889".to_string(),
                coverage: DateWindow {
                    start: date(2024, 1, 1),
                    end: None,
                },
            },
            InsuranceCard {
                insurance_type: InsuranceType::LongTermCare,
                number: "LTC-412".to_string(),
                coverage: DateWindow {
                    start: date(2024, 1, 1),
                    end: None,
                },
            },
        ],
        doctor_orders: vec![DoctorOrder {
            physician: "Dr. Tanaka".to_string(),
            coverage: DateWindow {
                start: date(2024, 10, 1),
                end: Some(date(2025, 4, 1)),
            },
        }],
        special_management: Vec::new(),
        special_instructions: Vec::new(),
        death: None,
        lives_in_shared_building: false,
    }
}

pub(super) fn deceased_patient(day: NaiveDate, location: DeathLocation) -> PatientProfile {
    let mut patient = patient();
    patient.death = Some(DeathRecord {
        date: day,
        location,
    });
    patient
}

pub(super) fn facility() -> FacilityProfile {
    FacilityProfile {
        id: facility_id(),
        name: "Minato Visiting Nurse Station".to_string(),
        facility_code: Some("1312345678".to_string()),
        capabilities: vec![
            FacilityCapability::TwentyFourHourResponse,
            FacilityCapability::TerminalCareSystem,
        ],
        ltc_unit_price: 1_072,
    }
}

pub(super) fn rule(code: &str, category: BonusCategory, points: i64) -> BonusRule {
    BonusRule {
        code: RuleCode(code.to_string()),
        version: 1,
        name: code.to_string(),
        category,
        insurance_type: InsuranceType::Medical,
        facility_id: None,
        valid_from: date(2024, 6, 1),
        valid_to: None,
        points: PointsSpec::Fixed { points },
        monthly_limit: None,
        conditions: Vec::new(),
        state: RuleState::Active,
    }
}

pub(super) fn twenty_four_hour_rule() -> BonusRule {
    let mut rule = rule("24h-support", BonusCategory::TwentyFourHour, 6_520);
    rule.monthly_limit = Some(MonthlyLimit::OncePerMonth);
    rule.conditions = vec![ConditionSpec::FacilityCapability {
        capability: FacilityCapability::TwentyFourHourResponse,
    }];
    rule
}

pub(super) fn terminal_care_rule() -> BonusRule {
    let mut rule = rule("terminal-care", BonusCategory::TerminalCare, 0);
    rule.points = PointsSpec::ByDeathLocation {
        entries: vec![
            DeathLocationPoints {
                location: DeathLocation::Home,
                points: 25_000,
            },
            DeathLocationPoints {
                location: DeathLocation::CareFacility,
                points: 25_000,
            },
            DeathLocationPoints {
                location: DeathLocation::Hospital,
                points: 10_000,
            },
        ],
    };
    rule.monthly_limit = Some(MonthlyLimit::AtMost { count: 1 });
    rule.conditions = vec![ConditionSpec::RollingVisitCount {
        flag: VisitFlag::TerminalCare,
        window_days: 14,
        minimum: 2,
        anchor: RollingAnchor::DeathDate,
        include_reference_date: false,
        require_visit_on_reference: true,
    }];
    rule
}

pub(super) fn late_night_rule() -> BonusRule {
    let mut rule = rule("late-night", BonusCategory::TimeOfDay, 4_200);
    rule.conditions = vec![ConditionSpec::TimeOfDay {
        from: clock_time(22, 0),
        to: clock_time(6, 0),
        basis: TimeBasis::Start,
    }];
    rule
}

pub(super) fn long_visit_rule() -> BonusRule {
    let mut rule = rule("long-visit", BonusCategory::LongDuration, 5_200);
    rule.conditions = vec![ConditionSpec::DurationOver { minutes: 90 }];
    rule
}

pub(super) fn catalog_with(rules: Vec<BonusRule>) -> RuleCatalog {
    let catalog = RuleCatalog::new();
    catalog.set_base_visit_points(InsuranceType::Medical, MEDICAL_BASE);
    catalog.set_base_visit_points(InsuranceType::LongTermCare, LTC_BASE);
    for rule in rules {
        let code = rule.code.clone();
        let version = rule.version;
        catalog.create(rule).expect("rule created");
        catalog.activate(&code, version).expect("rule activated");
    }
    catalog
}

pub(super) fn computed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 9, 30, 0)
        .single()
        .expect("valid timestamp")
}

/// Run one evaluator pass where history equals the month's visits.
pub(super) fn evaluate(
    rules: Vec<BonusRule>,
    patient: &PatientProfile,
    visits: &[VisitRecord],
    kind: PassKind,
    prior_usage: &MonthlyUsage,
) -> Vec<BonusApplication> {
    let month = crate::billing::visits::eligible_in_order(visits.to_vec(), &december());
    let receipt_id = ReceiptId("rcpt-test".to_string());
    let facility = facility();
    let evaluator = RuleEvaluator::new(CatalogSnapshot::new(MEDICAL_BASE, rules));
    evaluator.evaluate(&EvaluationPass {
        receipt_id: &receipt_id,
        patient,
        facility: &facility,
        insurance_type: InsuranceType::Medical,
        period: december(),
        month_visits: &month,
        history: &month,
        prior_usage,
        kind: &kind,
        computed_at: computed_at(),
    })
}

pub(super) fn codes_on(applications: &[BonusApplication], visit_id: &str) -> Vec<String> {
    let mut codes: Vec<String> = applications
        .iter()
        .filter(|application| application.visit_id.0 == visit_id)
        .map(|application| application.rule_code.0.clone())
        .collect();
    codes.sort();
    codes
}

#[derive(Debug)]
pub(super) struct FixedClock(pub(super) DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub(super) struct Harness<S> {
    pub(super) store: Arc<S>,
    pub(super) visits: InMemoryVisitStore,
    pub(super) patients: InMemoryPatientDirectory,
    pub(super) facilities: InMemoryFacilityDirectory,
    pub(super) service: Arc<ReceiptLifecycleService<S>>,
}

impl<S> Harness<S>
where
    S: BillingStore + 'static,
{
    pub(super) fn add_visit(&self, record: VisitRecord) {
        self.visits.upsert(record).expect("visit stored");
    }

    pub(super) fn set_patient(&self, patient: PatientProfile) {
        self.patients.upsert(patient).expect("patient stored");
    }

    pub(super) fn recalculate(&self) -> MonthlyReceipt {
        self.service
            .recalculate(december_key())
            .expect("recalculation succeeds")
    }
}

pub(super) fn harness_with_store<S>(store: Arc<S>, rules: Vec<BonusRule>) -> Harness<S>
where
    S: BillingStore + 'static,
{
    let visits = InMemoryVisitStore::default();
    let patients = InMemoryPatientDirectory::default();
    let facilities = InMemoryFacilityDirectory::default();
    patients.upsert(patient()).expect("patient stored");
    facilities.upsert(facility()).expect("facility stored");

    let sources = BillingSources {
        visits: Arc::new(visits.clone()),
        patients: Arc::new(patients.clone()),
        facilities: Arc::new(facilities.clone()),
    };
    let service = ReceiptLifecycleService::with_clock(
        store.clone(),
        sources,
        Arc::new(catalog_with(rules)),
        ValidationSettings::default(),
        Arc::new(FixedClock(computed_at())),
    );

    Harness {
        store,
        visits,
        patients,
        facilities,
        service: Arc::new(service),
    }
}

pub(super) fn harness(rules: Vec<BonusRule>) -> Harness<InMemoryBillingStore> {
    let harness = harness_with_store(Arc::new(InMemoryBillingStore::default()), rules);
    for record in december_visits() {
        harness.add_visit(record);
    }
    harness
}

/// Delegates to the in-memory store but can be told to fail every commit.
#[derive(Default)]
pub(super) struct FlakyStore {
    pub(super) inner: InMemoryBillingStore,
    pub(super) fail_commits: AtomicBool,
}

impl FlakyStore {
    pub(super) fn fail_from_now(&self) {
        self.fail_commits.store(true, Ordering::SeqCst);
    }
}

impl BillingStore for FlakyStore {
    fn receipt(&self, id: &ReceiptId) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        self.inner.receipt(id)
    }

    fn receipt_by_key(&self, key: &ReceiptKey) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        self.inner.receipt_by_key(key)
    }

    fn applications(&self, receipt_id: &ReceiptId) -> Result<Vec<BonusApplication>, RepositoryError> {
        self.inner.applications(receipt_id)
    }

    fn monthly_usage(
        &self,
        patient_id: &PatientId,
        period: &BillingPeriod,
        excluding: &ReplaceScope,
    ) -> Result<MonthlyUsage, RepositoryError> {
        self.inner.monthly_usage(patient_id, period, excluding)
    }

    fn commit(&self, commit: ReceiptCommit) -> Result<MonthlyReceipt, RepositoryError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("database offline".to_string()));
        }
        self.inner.commit(commit)
    }

    fn save_receipt(&self, receipt: MonthlyReceipt) -> Result<MonthlyReceipt, RepositoryError> {
        self.inner.save_receipt(receipt)
    }

    fn delete_receipt(&self, id: &ReceiptId) -> Result<(), RepositoryError> {
        self.inner.delete_receipt(id)
    }
}

/// Delegates to the in-memory store. `monthly_usage` waits briefly for a
/// second caller and records whether two callers were ever inside together.
#[derive(Default)]
pub(super) struct RendezvousStore {
    pub(super) inner: InMemoryBillingStore,
    inside: Mutex<usize>,
    arrived: Condvar,
    overlapped: AtomicBool,
}

impl RendezvousStore {
    pub(super) fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn meet(&self) {
        let mut inside = self.inside.lock().expect("rendezvous lock");
        *inside += 1;
        if *inside >= 2 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.arrived.notify_all();
        let (mut inside, _) = self
            .arrived
            .wait_timeout_while(inside, Duration::from_millis(200), |inside| *inside < 2)
            .expect("rendezvous wait");
        *inside -= 1;
    }
}

impl BillingStore for RendezvousStore {
    fn receipt(&self, id: &ReceiptId) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        self.inner.receipt(id)
    }

    fn receipt_by_key(&self, key: &ReceiptKey) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        self.inner.receipt_by_key(key)
    }

    fn applications(&self, receipt_id: &ReceiptId) -> Result<Vec<BonusApplication>, RepositoryError> {
        self.inner.applications(receipt_id)
    }

    fn monthly_usage(
        &self,
        patient_id: &PatientId,
        period: &BillingPeriod,
        excluding: &ReplaceScope,
    ) -> Result<MonthlyUsage, RepositoryError> {
        self.meet();
        self.inner.monthly_usage(patient_id, period, excluding)
    }

    fn commit(&self, commit: ReceiptCommit) -> Result<MonthlyReceipt, RepositoryError> {
        self.inner.commit(commit)
    }

    fn save_receipt(&self, receipt: MonthlyReceipt) -> Result<MonthlyReceipt, RepositoryError> {
        self.inner.save_receipt(receipt)
    }

    fn delete_receipt(&self, id: &ReceiptId) -> Result<(), RepositoryError> {
        self.inner.delete_receipt(id)
    }
}

pub(super) struct UnavailableStore;

impl BillingStore for UnavailableStore {
    fn receipt(&self, _id: &ReceiptId) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn receipt_by_key(&self, _key: &ReceiptKey) -> Result<Option<MonthlyReceipt>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn applications(&self, _receipt_id: &ReceiptId) -> Result<Vec<BonusApplication>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn monthly_usage(
        &self,
        _patient_id: &PatientId,
        _period: &BillingPeriod,
        _excluding: &ReplaceScope,
    ) -> Result<MonthlyUsage, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn commit(&self, _commit: ReceiptCommit) -> Result<MonthlyReceipt, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn save_receipt(&self, _receipt: MonthlyReceipt) -> Result<MonthlyReceipt, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn delete_receipt(&self, _id: &ReceiptId) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

use super::common::*;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::billing::catalog::RuleCode;
use crate::billing::domain::{DeathLocation, FacilityId, InsuranceType, OperatorId, VisitId};
use crate::billing::lifecycle::ReceiptServiceError;
use crate::billing::receipt::{BonusApplication, ReceiptKey, ReceiptStatus};
use crate::billing::repository::{BillingStore, RepositoryError};

fn operator() -> OperatorId {
    OperatorId("clerk-07".to_string())
}

#[test]
fn recalculation_creates_draft_receipt_with_consistent_totals() {
    let harness = harness(vec![twenty_four_hour_rule(), late_night_rule()]);

    let receipt = harness.recalculate();

    assert_eq!(receipt.status(), ReceiptStatus::Draft);
    assert_eq!(receipt.totals.visit_count, 3);
    assert_eq!(receipt.totals.base_visit_points, 3 * MEDICAL_BASE);
    assert_eq!(receipt.totals.grand_total_points, 3 * MEDICAL_BASE + 6_520);
    assert!(receipt.totals.is_consistent());
    assert!(!receipt.has_errors);
    assert_eq!(receipt.recalculated_at, Some(computed_at()));

    let applications = harness.store.applications(&receipt.id).expect("applications");
    let stored_sum: i64 = applications.iter().map(|application| application.points).sum();
    assert_eq!(
        receipt.totals.grand_total_points,
        receipt.totals.base_visit_points + stored_sum
    );
}

#[test]
fn recalculation_is_idempotent() {
    let harness = harness(vec![twenty_four_hour_rule(), late_night_rule(), long_visit_rule()]);
    harness.add_visit(visit("V-1222", dec(22), Some((23, 0)), 120));

    let first = harness.recalculate();
    let first_apps = harness.store.applications(&first.id).expect("applications");
    let second = harness.recalculate();
    let second_apps = harness.store.applications(&second.id).expect("applications");

    assert_eq!(first.id, second.id);
    assert_eq!(first.totals, second.totals);
    assert_eq!(identities(&first_apps), identities(&second_apps));
    assert_eq!(first_apps.len(), 3);
}

/// Register facility F-002 with one December visit for the same patient.
fn add_second_facility<S>(harness: &Harness<S>) -> ReceiptKey
where
    S: BillingStore + 'static,
{
    let mut other_facility = facility();
    other_facility.id = FacilityId("F-002".to_string());
    harness
        .facilities
        .upsert(other_facility)
        .expect("facility stored");
    let mut elsewhere = visit("V-F2-1202", dec(2), Some((9, 0)), 60);
    elsewhere.facility_id = FacilityId("F-002".to_string());
    harness.add_visit(elsewhere);
    ReceiptKey {
        facility_id: FacilityId("F-002".to_string()),
        ..december_key()
    }
}

fn live_count(applications: Vec<BonusApplication>, code: &str) -> usize {
    applications
        .into_iter()
        .filter(|application| application.rule_code == RuleCode(code.to_string()))
        .count()
}

fn identities(applications: &[BonusApplication]) -> BTreeSet<(VisitId, RuleCode, i64)> {
    applications
        .iter()
        .map(|application| application.identity())
        .collect()
}

#[test]
fn once_per_month_rule_stays_single_across_receipts_and_reruns() {
    let harness = harness(vec![twenty_four_hour_rule()]);
    let other_key = add_second_facility(&harness);

    harness.recalculate();
    harness
        .service
        .recalculate(other_key.clone())
        .expect("second receipt");
    harness.recalculate();
    harness.service.recalculate(other_key).expect("rerun");

    let applications = harness.store.all_applications().expect("applications");
    assert_eq!(live_count(applications, "24h-support"), 1);
}

#[test]
fn receipts_of_one_patient_month_never_evaluate_concurrently() {
    let harness = harness_with_store(
        Arc::new(RendezvousStore::default()),
        vec![twenty_four_hour_rule()],
    );
    for record in december_visits() {
        harness.add_visit(record);
    }
    let other_key = add_second_facility(&harness);

    let receipts: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = [december_key(), other_key]
            .into_iter()
            .map(|key| {
                let service = harness.service.clone();
                scope.spawn(move || service.recalculate(key))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread finished").expect("recalculated"))
            .collect()
    });

    assert!(!harness.store.overlapped());
    assert_eq!(receipts.len(), 2);
    assert!(receipts.iter().all(|receipt| !receipt.has_errors));
    let applications = harness.store.inner.all_applications().expect("applications");
    assert_eq!(live_count(applications, "24h-support"), 1);
    assert_eq!(harness.service.active_locks(), 0);
}

#[test]
fn soft_deleted_visit_loses_its_applications() {
    let harness = harness(vec![twenty_four_hour_rule()]);
    let receipt = harness.recalculate();
    let applications = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(applications[0].visit_id, VisitId("V-1201".to_string()));

    let mut deleted = visit("V-1201", dec(1), Some((9, 0)), 60);
    deleted.deleted_at = Some(dec(2).and_time(clock_time(8, 0)));
    harness.add_visit(deleted);
    let receipt = harness.recalculate();

    let applications = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(receipt.totals.visit_count, 2);
    assert_eq!(applications.len(), 1);
    assert_eq!(applications[0].visit_id, VisitId("V-1203".to_string()));
}

#[test]
fn visit_recalculation_replaces_only_that_visit() {
    let harness = harness(vec![twenty_four_hour_rule(), late_night_rule()]);
    let receipt = harness.recalculate();

    harness.add_visit(visit("V-1205", dec(5), Some((23, 15)), 45));
    let updated = harness
        .service
        .recalculate_visit(&VisitId("V-1205".to_string()), InsuranceType::Medical)
        .expect("visit recalculated");

    assert_eq!(updated.id, receipt.id);
    assert_eq!(updated.totals.visit_count, 4);
    assert_eq!(
        updated.totals.grand_total_points,
        4 * MEDICAL_BASE + 6_520 + 4_200
    );
    let applications = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(codes_on(&applications, "V-1201"), vec!["24h-support"]);
    assert_eq!(codes_on(&applications, "V-1205"), vec!["late-night"]);
}

#[test]
fn visit_recalculation_moves_monthly_bonus_off_a_removed_visit() {
    let harness = harness(vec![twenty_four_hour_rule(), late_night_rule()]);
    let receipt = harness.recalculate();

    let mut deleted = visit("V-1201", dec(1), Some((9, 0)), 60);
    deleted.deleted_at = Some(dec(2).and_time(clock_time(8, 0)));
    harness.add_visit(deleted);
    let incremental = harness
        .service
        .recalculate_visit(&VisitId("V-1201".to_string()), InsuranceType::Medical)
        .expect("visit recalculated");
    let incremental_apps = harness.store.applications(&receipt.id).expect("applications");

    assert_eq!(codes_on(&incremental_apps, "V-1203"), vec!["24h-support"]);
    assert!(codes_on(&incremental_apps, "V-1201").is_empty());
    assert_eq!(
        incremental.totals.grand_total_points,
        2 * MEDICAL_BASE + 6_520
    );

    let rebuilt = harness.recalculate();
    let rebuilt_apps = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(rebuilt.totals, incremental.totals);
    assert_eq!(identities(&rebuilt_apps), identities(&incremental_apps));
}

#[test]
fn visit_recalculation_moves_monthly_bonus_to_a_new_first_visit() {
    let harness = harness(vec![twenty_four_hour_rule(), long_visit_rule()]);
    let receipt = harness.recalculate();

    harness.add_visit(visit("V-1201-early", dec(1), Some((7, 0)), 100));
    let incremental = harness
        .service
        .recalculate_visit(&VisitId("V-1201-early".to_string()), InsuranceType::Medical)
        .expect("visit recalculated");
    let incremental_apps = harness.store.applications(&receipt.id).expect("applications");

    assert_eq!(
        codes_on(&incremental_apps, "V-1201-early"),
        vec!["24h-support", "long-visit"]
    );
    assert!(codes_on(&incremental_apps, "V-1201").is_empty());
    assert_eq!(
        incremental.totals.grand_total_points,
        4 * MEDICAL_BASE + 6_520 + 5_200
    );

    let listing = harness
        .service
        .month_visit_listing(&december_key())
        .expect("listing");
    assert_eq!(listing[0].visit_id, VisitId("V-1201-early".to_string()));
    assert!(listing[0].is_first_record_of_month);
    assert_eq!(
        listing[0].bonuses,
        vec![
            RuleCode("24h-support".to_string()),
            RuleCode("long-visit".to_string())
        ]
    );

    let rebuilt = harness.recalculate();
    let rebuilt_apps = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(rebuilt.totals, incremental.totals);
    assert_eq!(identities(&rebuilt_apps), identities(&incremental_apps));
}

#[test]
fn visit_recalculation_without_receipt_runs_full_month() {
    let harness = harness(vec![twenty_four_hour_rule()]);

    let receipt = harness
        .service
        .recalculate_visit(&VisitId("V-1210".to_string()), InsuranceType::Medical)
        .expect("receipt created");

    let applications = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(codes_on(&applications, "V-1201"), vec!["24h-support"]);
    assert_eq!(receipt.totals.visit_count, 3);
}

#[test]
fn unknown_visit_is_reported() {
    let harness = harness(Vec::new());
    match harness
        .service
        .recalculate_visit(&VisitId("V-missing".to_string()), InsuranceType::Medical)
    {
        Err(ReceiptServiceError::VisitNotFound(id)) => assert_eq!(id.0, "V-missing"),
        other => panic!("expected visit_not_found, got {other:?}"),
    }
}

#[test]
fn terminal_care_counts_visits_from_previous_month() {
    let harness = harness_with_store(
        Arc::new(crate::billing::memory::InMemoryBillingStore::default()),
        vec![terminal_care_rule()],
    );
    harness.set_patient(deceased_patient(dec(2), DeathLocation::Home));
    harness.add_visit(terminal_visit("V-1125", date(2024, 11, 25)));
    harness.add_visit(terminal_visit("V-1128", date(2024, 11, 28)));
    harness.add_visit(terminal_visit("V-1202", dec(2)));

    let receipt = harness.recalculate();

    let applications = harness.store.applications(&receipt.id).expect("applications");
    assert_eq!(applications.len(), 1);
    assert_eq!(applications[0].visit_id, VisitId("V-1202".to_string()));
    assert_eq!(applications[0].points, 25_000);
    assert_eq!(receipt.totals.visit_count, 1);
}

#[test]
fn finalize_is_refused_while_errors_exist() {
    let harness = harness(vec![twenty_four_hour_rule()]);
    let mut incomplete = patient();
    incomplete.doctor_orders.clear();
    harness.set_patient(incomplete);
    let receipt = harness.recalculate();
    assert!(receipt.has_errors);

    match harness.service.finalize(&receipt.id, operator()) {
        Err(ReceiptServiceError::HasErrors { messages }) => {
            assert_eq!(messages[0].code, "doctor_order_missing");
        }
        other => panic!("expected has_errors, got {other:?}"),
    }
    let stored = harness.service.get(&receipt.id).expect("receipt");
    assert!(!stored.is_confirmed);
    assert!(stored.confirmed_at.is_none());
}

#[test]
fn lifecycle_walks_draft_confirmed_sent() {
    let harness = harness(vec![twenty_four_hour_rule()]);
    let receipt = harness.recalculate();

    let confirmed = harness
        .service
        .finalize(&receipt.id, operator())
        .expect("finalized");
    assert_eq!(confirmed.status(), ReceiptStatus::Confirmed);
    assert_eq!(confirmed.confirmed_by, Some(operator()));
    assert_eq!(confirmed.confirmed_at, Some(computed_at()));
    assert!(matches!(
        harness.service.finalize(&receipt.id, operator()),
        Err(ReceiptServiceError::AlreadyConfirmed)
    ));
    assert!(matches!(
        harness.service.recalculate(december_key()),
        Err(ReceiptServiceError::AlreadyConfirmed)
    ));

    let reopened = harness.service.reopen(&receipt.id).expect("reopened");
    assert_eq!(reopened.status(), ReceiptStatus::Draft);
    assert!(reopened.confirmed_at.is_none());
    assert!(reopened.confirmed_by.is_none());

    harness
        .service
        .finalize(&receipt.id, operator())
        .expect("finalized again");
    let sent = harness.service.mark_sent(&receipt.id).expect("sent");
    assert_eq!(sent.status(), ReceiptStatus::Sent);
    assert_eq!(sent.sent_at, Some(computed_at()));

    for outcome in [
        harness.service.reopen(&receipt.id).map(|_| ()),
        harness.service.mark_sent(&receipt.id).map(|_| ()),
        harness.service.recalculate(december_key()).map(|_| ()),
        harness.service.delete(&receipt.id),
    ] {
        assert!(matches!(outcome, Err(ReceiptServiceError::AlreadySent)));
    }
    assert_eq!(
        harness.service.get(&receipt.id).expect("still readable").status(),
        ReceiptStatus::Sent
    );
}

#[test]
fn draft_receipts_cannot_be_reopened_or_sent() {
    let harness = harness(Vec::new());
    let receipt = harness.recalculate();

    assert!(matches!(
        harness.service.reopen(&receipt.id),
        Err(ReceiptServiceError::NotConfirmed)
    ));
    assert!(matches!(
        harness.service.mark_sent(&receipt.id),
        Err(ReceiptServiceError::NotConfirmed)
    ));
}

#[test]
fn validate_persists_fresh_findings_without_touching_applications() {
    let harness = harness(vec![twenty_four_hour_rule()]);
    let receipt = harness.recalculate();
    let before = harness.store.applications(&receipt.id).expect("applications");

    let mut edited = patient();
    edited.insured_number = None;
    harness.set_patient(edited);
    let report = harness.service.validate(&receipt.id).expect("validated");

    assert_eq!(report.errors[0].code, "missing_insured_number");
    let stored = harness.service.get(&receipt.id).expect("receipt");
    assert!(stored.has_errors);
    assert_eq!(stored.totals, receipt.totals);
    assert_eq!(
        harness.store.applications(&receipt.id).expect("applications"),
        before
    );

    harness.set_patient(patient());
    let report = harness.service.validate(&receipt.id).expect("validated");
    assert!(!report.has_errors());
    assert!(!harness.service.get(&receipt.id).expect("receipt").has_errors);
}

#[test]
fn validate_on_sent_receipt_returns_stored_findings() {
    let harness = harness(Vec::new());
    let receipt = harness.recalculate();
    harness
        .service
        .finalize(&receipt.id, operator())
        .expect("finalized");
    harness.service.mark_sent(&receipt.id).expect("sent");

    let mut edited = patient();
    edited.insured_number = None;
    harness.set_patient(edited);
    let report = harness.service.validate(&receipt.id).expect("validated");

    assert!(!report.has_errors());
    assert!(!harness.service.get(&receipt.id).expect("receipt").has_errors);
}

#[test]
fn failed_commit_leaves_previous_state_intact() {
    let store = Arc::new(FlakyStore::default());
    let harness = harness_with_store(store.clone(), vec![twenty_four_hour_rule(), late_night_rule()]);
    for record in december_visits() {
        harness.add_visit(record);
    }
    let receipt = harness.recalculate();
    let before = store.applications(&receipt.id).expect("applications");

    store.fail_from_now();
    harness.add_visit(visit("V-1224", dec(24), Some((23, 30)), 60));
    let error = harness
        .service
        .recalculate(december_key())
        .expect_err("commit fails");

    assert!(error.is_retryable());
    assert!(matches!(
        error,
        ReceiptServiceError::Repository(RepositoryError::Unavailable(_))
    ));
    let stored = store.receipt(&receipt.id).expect("read").expect("present");
    assert_eq!(stored.totals, receipt.totals);
    assert_eq!(store.applications(&receipt.id).expect("applications"), before);
}

#[test]
fn concurrent_recalculations_of_one_receipt_serialize() {
    let harness = harness(vec![twenty_four_hour_rule(), late_night_rule(), long_visit_rule()]);
    harness.add_visit(visit("V-1222", dec(22), Some((23, 0)), 120));

    let receipts: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = harness.service.clone();
                scope.spawn(move || service.recalculate(december_key()))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread finished").expect("recalculated"))
            .collect()
    });

    let ids: BTreeSet<_> = receipts.iter().map(|receipt| receipt.id.clone()).collect();
    assert_eq!(ids.len(), 1);
    let receipt_id = ids.into_iter().next().expect("one receipt");
    let applications = harness.store.applications(&receipt_id).expect("applications");
    assert_eq!(applications.len(), 3);
    let unique: BTreeSet<_> = applications
        .iter()
        .map(|application| (application.visit_id.clone(), application.rule_code.clone()))
        .collect();
    assert_eq!(unique.len(), applications.len());
    assert_eq!(harness.service.active_locks(), 0);
}

#[test]
fn delete_removes_draft_receipt_and_applications() {
    let harness = harness(vec![twenty_four_hour_rule()]);
    let receipt = harness.recalculate();

    harness.service.delete(&receipt.id).expect("deleted");

    assert!(matches!(
        harness.service.get(&receipt.id),
        Err(ReceiptServiceError::ReceiptNotFound(_))
    ));
    assert!(harness.store.all_applications().expect("applications").is_empty());
    let recreated = harness.recalculate();
    assert_ne!(recreated.id, receipt.id);
}

#[test]
fn month_listing_marks_first_record_and_applied_bonuses() {
    let harness = harness(vec![twenty_four_hour_rule(), late_night_rule()]);
    harness.add_visit(visit("V-1201-late", dec(1), Some((22, 30)), 30));
    let mut draft = visit("V-1202", dec(2), Some((9, 0)), 30);
    draft.status = crate::billing::domain::VisitStatus::Draft;
    harness.add_visit(draft);
    harness.recalculate();

    let listing = harness
        .service
        .month_visit_listing(&december_key())
        .expect("listing");

    let ids: Vec<&str> = listing.iter().map(|entry| entry.visit_id.0.as_str()).collect();
    assert_eq!(ids, vec!["V-1201", "V-1201-late", "V-1203", "V-1210"]);
    assert!(listing[0].is_first_record_of_month);
    assert!(listing[1..].iter().all(|entry| !entry.is_first_record_of_month));
    assert_eq!(listing[0].bonuses, vec![RuleCode("24h-support".to_string())]);
    assert_eq!(listing[1].bonuses, vec![RuleCode("late-night".to_string())]);
}

#[test]
fn long_term_care_receipt_prices_units_and_needs_base_points() {
    let harness = harness(Vec::new());
    let key = ReceiptKey {
        insurance_type: InsuranceType::LongTermCare,
        ..december_key()
    };
    harness
        .service
        .catalog()
        .set_base_visit_points(InsuranceType::LongTermCare, LTC_BASE);
    let receipt = harness.service.recalculate(key).expect("ltc receipt");
    assert_eq!(receipt.totals.grand_total_amount, 3 * LTC_BASE * 1_072 / 100);

    let empty = crate::billing::catalog::RuleCatalog::new();
    assert!(matches!(
        empty.snapshot(InsuranceType::Medical, &facility_id(), &december()),
        Err(crate::billing::catalog::CatalogError::MissingBasePoints(_))
    ));
}

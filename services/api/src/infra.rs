use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};
use visit_billing::billing::{
    BillingSources, CatalogDocument, FacilityProfile, InMemoryBillingStore,
    InMemoryFacilityDirectory, InMemoryPatientDirectory, InMemoryVisitStore, InsuranceType,
    PatientProfile, ReceiptLifecycleService, ReceiptServiceError, RuleCatalog, VisitRecord,
};
use visit_billing::config::BillingConfig;
use visit_billing::error::AppError;

pub(crate) const DEMO_SEED: &str = include_str!("../fixtures/demo-seed.json");

pub(crate) type BillingService = ReceiptLifecycleService<InMemoryBillingStore>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Records loaded into the in-memory directories at startup.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SeedDocument {
    #[serde(default)]
    pub(crate) catalog: Option<CatalogDocument>,
    #[serde(default)]
    pub(crate) facilities: Vec<FacilityProfile>,
    #[serde(default)]
    pub(crate) patients: Vec<PatientProfile>,
    #[serde(default)]
    pub(crate) visits: Vec<VisitRecord>,
}

impl SeedDocument {
    pub(crate) fn demo() -> Result<Self, AppError> {
        Ok(serde_json::from_str(DEMO_SEED)?)
    }

    pub(crate) fn from_path(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Wire the lifecycle service over in-memory stores.
///
/// A configured rules file wins over any catalog carried by the seed.
pub(crate) fn build_service(
    billing: &BillingConfig,
    seed: SeedDocument,
) -> Result<Arc<BillingService>, AppError> {
    let SeedDocument {
        catalog,
        facilities,
        patients,
        visits,
    } = seed;

    let catalog = match (&billing.rules_path, catalog) {
        (Some(path), _) => RuleCatalog::from_path(path)?,
        (None, Some(document)) => RuleCatalog::from_document(document),
        (None, None) => {
            warn!("no rule catalog configured; receipts will carry base visit points only");
            RuleCatalog::new()
        }
    };

    let visit_store = InMemoryVisitStore::default();
    let patient_directory = InMemoryPatientDirectory::default();
    let facility_directory = InMemoryFacilityDirectory::default();

    let counts = (facilities.len(), patients.len(), visits.len());
    for facility in facilities {
        facility_directory
            .upsert(facility)
            .map_err(ReceiptServiceError::from)?;
    }
    for patient in patients {
        patient_directory
            .upsert(patient)
            .map_err(ReceiptServiceError::from)?;
    }
    for visit in visits {
        visit_store.upsert(visit).map_err(ReceiptServiceError::from)?;
    }
    info!(
        facilities = counts.0,
        patients = counts.1,
        visits = counts.2,
        "billing sources seeded"
    );

    Ok(Arc::new(ReceiptLifecycleService::new(
        Arc::new(InMemoryBillingStore::default()),
        BillingSources {
            visits: Arc::new(visit_store),
            patients: Arc::new(patient_directory),
            facilities: Arc::new(facility_directory),
        },
        Arc::new(catalog),
        billing.validation,
    )))
}

pub(crate) fn parse_insurance_type(raw: &str) -> Result<InsuranceType, String> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "medical" => Ok(InsuranceType::Medical),
        "long_term_care" | "ltc" => Ok(InsuranceType::LongTermCare),
        other => Err(format!(
            "unknown insurance type '{other}' (expected medical or long_term_care)"
        )),
    }
}

use crate::infra::{build_service, parse_insurance_type, SeedDocument};
use clap::Args;
use serde_json::json;
use std::path::PathBuf;
use visit_billing::billing::{
    BillingPeriod, FacilityId, InsuranceType, OperatorId, PatientId, ReceiptKey,
};
use visit_billing::config::AppConfig;
use visit_billing::error::AppError;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Patient to bill
    #[arg(long, default_value = "P-001")]
    pub(crate) patient: String,
    /// Facility issuing the receipt
    #[arg(long, default_value = "F-001")]
    pub(crate) facility: String,
    /// Billing year
    #[arg(long, default_value_t = 2024)]
    pub(crate) year: i32,
    /// Billing month (1-12)
    #[arg(long, default_value_t = 12)]
    pub(crate) month: u32,
    /// Insurance scheme: medical or long_term_care
    #[arg(long, default_value = "medical", value_parser = parse_insurance_type)]
    pub(crate) insurance_type: InsuranceType,
    /// Seed document to use instead of the bundled sample records
    #[arg(long)]
    pub(crate) seed: Option<PathBuf>,
    /// Confirm the receipt as this operator after recalculating
    #[arg(long)]
    pub(crate) confirm_as: Option<String>,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        patient,
        facility,
        year,
        month,
        insurance_type,
        seed,
        confirm_as,
    } = args;

    let config = AppConfig::load()?;
    let seed = match seed {
        Some(path) => SeedDocument::from_path(&path)?,
        None => SeedDocument::demo()?,
    };
    let service = build_service(&config.billing, seed)?;

    let key = ReceiptKey {
        patient_id: PatientId(patient),
        facility_id: FacilityId(facility),
        period: BillingPeriod::new(year, month)?,
        insurance_type,
    };

    let mut receipt = service.recalculate(key.clone())?;
    if let Some(operator) = confirm_as {
        receipt = service.finalize(&receipt.id, OperatorId(operator))?;
    }
    let applications = service.applications(&receipt.id)?;
    let visits = service.month_visit_listing(&key)?;

    let output = json!({
        "receipt": receipt.view(),
        "applications": applications,
        "visits": visits,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

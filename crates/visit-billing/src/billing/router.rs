use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::domain::{BillingPeriod, FacilityId, InsuranceType, OperatorId, PatientId, VisitId};
use super::lifecycle::{ReceiptLifecycleService, ReceiptServiceError};
use super::receipt::{ReceiptId, ReceiptKey};
use super::repository::{BillingStore, RepositoryError};

#[derive(Debug, Clone, Deserialize)]
pub struct RecalculateRequest {
    pub patient_id: PatientId,
    pub facility_id: FacilityId,
    pub year: i32,
    pub month: u32,
    pub insurance_type: InsuranceType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisitRecalculateRequest {
    pub insurance_type: InsuranceType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeRequest {
    pub confirmed_by: OperatorId,
}

type Service<S> = Arc<ReceiptLifecycleService<S>>;

/// Router builder exposing the receipt endpoints.
pub fn receipt_router<S>(service: Service<S>) -> Router
where
    S: BillingStore + 'static,
{
    Router::new()
        .route("/api/v1/receipts/recalculate", post(recalculate_handler::<S>))
        .route(
            "/api/v1/visits/:visit_id/recalculate",
            post(recalculate_visit_handler::<S>),
        )
        .route(
            "/api/v1/receipts/:receipt_id",
            get(get_handler::<S>).delete(delete_handler::<S>),
        )
        .route(
            "/api/v1/receipts/:receipt_id/validate",
            post(validate_handler::<S>),
        )
        .route(
            "/api/v1/receipts/:receipt_id/finalize",
            post(finalize_handler::<S>),
        )
        .route("/api/v1/receipts/:receipt_id/reopen", post(reopen_handler::<S>))
        .route("/api/v1/receipts/:receipt_id/sent", post(sent_handler::<S>))
        .route(
            "/api/v1/receipts/:receipt_id/applications",
            get(applications_handler::<S>),
        )
        .route(
            "/api/v1/receipts/:receipt_id/visits",
            get(visits_handler::<S>),
        )
        .with_state(service)
}

/// Runs a store-bound operation off the async runtime. Once spawned the
/// operation completes even if the client goes away.
async fn blocking<S, T, F>(service: Service<S>, op: F) -> Result<T, Response>
where
    S: BillingStore + 'static,
    T: Send + 'static,
    F: FnOnce(&ReceiptLifecycleService<S>) -> Result<T, ReceiptServiceError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || op(service.as_ref())).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(service_error_response(&error)),
        Err(join_error) => {
            error!(error = %join_error, "receipt operation panicked");
            let payload = json!({
                "code": "internal",
                "messages": ["receipt operation failed"],
            });
            Err((StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response())
        }
    }
}

pub(crate) fn service_error_response(error: &ReceiptServiceError) -> Response {
    let status = match error {
        ReceiptServiceError::ReceiptNotFound(_)
        | ReceiptServiceError::VisitNotFound(_)
        | ReceiptServiceError::PatientNotFound(_)
        | ReceiptServiceError::FacilityNotFound(_)
        | ReceiptServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        ReceiptServiceError::HasErrors { .. }
        | ReceiptServiceError::AlreadyConfirmed
        | ReceiptServiceError::NotConfirmed
        | ReceiptServiceError::AlreadySent
        | ReceiptServiceError::Repository(RepositoryError::Conflict(_)) => StatusCode::CONFLICT,
        other if other.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let payload = json!({
        "code": error.code(),
        "messages": error.messages(),
    });
    (status, axum::Json(payload)).into_response()
}

pub(crate) async fn recalculate_handler<S>(
    State(service): State<Service<S>>,
    axum::Json(request): axum::Json<RecalculateRequest>,
) -> Response
where
    S: BillingStore + 'static,
{
    let period = match BillingPeriod::new(request.year, request.month) {
        Ok(period) => period,
        Err(error) => {
            let payload = json!({
                "code": "invalid_period",
                "messages": [error.to_string()],
            });
            return (StatusCode::UNPROCESSABLE_ENTITY, axum::Json(payload)).into_response();
        }
    };
    let key = ReceiptKey {
        patient_id: request.patient_id,
        facility_id: request.facility_id,
        period,
        insurance_type: request.insurance_type,
    };

    match blocking(service, move |service| service.recalculate(key)).await {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.view())).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn recalculate_visit_handler<S>(
    State(service): State<Service<S>>,
    Path(visit_id): Path<String>,
    axum::Json(request): axum::Json<VisitRecalculateRequest>,
) -> Response
where
    S: BillingStore + 'static,
{
    let visit_id = VisitId(visit_id);
    match blocking(service, move |service| {
        service.recalculate_visit(&visit_id, request.insurance_type)
    })
    .await
    {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.view())).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn get_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| service.get(&id)).await {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.view())).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn validate_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| service.validate(&id)).await {
        Ok(report) => (StatusCode::OK, axum::Json(report)).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn finalize_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
    axum::Json(request): axum::Json<FinalizeRequest>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| {
        service.finalize(&id, request.confirmed_by)
    })
    .await
    {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.view())).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn reopen_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| service.reopen(&id)).await {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.view())).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn sent_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| service.mark_sent(&id)).await {
        Ok(receipt) => (StatusCode::OK, axum::Json(receipt.view())).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn delete_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| service.delete(&id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn applications_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| service.applications(&id)).await {
        Ok(applications) => (StatusCode::OK, axum::Json(applications)).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn visits_handler<S>(
    State(service): State<Service<S>>,
    Path(receipt_id): Path<String>,
) -> Response
where
    S: BillingStore + 'static,
{
    let id = ReceiptId(receipt_id);
    match blocking(service, move |service| {
        let receipt = service.get(&id)?;
        service.month_visit_listing(&receipt.key)
    })
    .await
    {
        Ok(listing) => (StatusCode::OK, axum::Json(listing)).into_response(),
        Err(response) => response,
    }
}

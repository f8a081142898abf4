//! Bulk import endpoints.

use crate::error::ApiError;
use crate::import::{ImportCoordinator, ImportRequest, ImportResult, PlanSummary};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

/// Validate and commit a batch of domain records.
///
/// Responds with the identifiers written per domain. Validation problems
/// are reported with 422, store timeouts with 504 and failed stage-groups
/// with 500 together with the results already committed.
#[openapi(tag = "Import")]
#[post("/import", format = "json", data = "<request>")]
pub async fn import(
    coordinator: &State<ImportCoordinator>,
    request: Json<ImportRequest>,
) -> Result<Json<ImportResult>, ApiError> {
    let result = coordinator.import(&request).await?;
    Ok(Json(result))
}

/// Validate a batch and return the units it would run, without writing.
#[openapi(tag = "Import")]
#[post("/import/plan", format = "json", data = "<request>")]
pub async fn plan_import(
    coordinator: &State<ImportCoordinator>,
    request: Json<ImportRequest>,
) -> Result<Json<PlanSummary>, ApiError> {
    let plan = coordinator.prepare(&request)?;
    Ok(Json(plan.summary()))
}

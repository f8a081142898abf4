//! Readiness endpoint.
//!
//! The coordinator is only managed once its stage topology verified, so a
//! response here means imports can be accepted.

use crate::import::ImportCoordinator;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Number of stage-groups each import runs through.
    pub stage_groups: usize,
    /// Names of the stages, in commit order.
    pub stages: Vec<String>,
    pub max_concurrency: usize,
    pub timeout_ms: u64,
}

/// Report the import pipeline the server is running with.
#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check(coordinator: &State<ImportCoordinator>) -> Json<HealthResponse> {
    let groups = coordinator.stages().groups();
    let config = coordinator.config();

    Json(HealthResponse {
        status: "ok".to_string(),
        stage_groups: groups.len(),
        stages: groups
            .iter()
            .flat_map(|group| group.iter().map(|stage| stage.name.to_string()))
            .collect(),
        max_concurrency: config.max_concurrency,
        timeout_ms: config.timeout.as_millis() as u64,
    })
}

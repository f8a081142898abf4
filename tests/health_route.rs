use chain_import::routes::health::{HealthResponse, health_check};
use chain_import::store::MemoryStore;
use chain_import::test_support::TestRocketBuilder;
use rocket::http::Status;
use rocket::routes;
use std::sync::Arc;

#[test]
fn health_reports_the_running_pipeline() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![health_check])
        .manage_store(Arc::new(MemoryStore::new()))
        .blocking_client();

    let response = client.get("/api/v1/health").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: HealthResponse = response.into_json().expect("valid JSON payload");
    assert_eq!(payload.status, "ok");
    assert_eq!(payload.stage_groups, 3);
    assert_eq!(payload.stages.first().map(String::as_str), Some("blocks"));
    assert_eq!(payload.stages[1], "main");
    assert_eq!(payload.max_concurrency, 10);
    assert_eq!(payload.timeout_ms, 240_000);
}


use chain_import::config::ImportConfig;
use chain_import::import::{
    ConflictPolicy, DomainKey, DomainOptions, ImportCoordinator, ImportError, ImportRequest,
    MergeStrategy, SideEffects,
};
use chain_import::store::PgStore;
use chain_import::test_support::fixtures::{address, block, record, transaction};
use chain_import::test_support::{TestDatabase, TestDatabaseError};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

async fn test_database(test: &str) -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping {test}: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

fn coordinator(db: &TestDatabase) -> ImportCoordinator {
    let store = Arc::new(PgStore::new(db.pool().clone()));
    ImportCoordinator::new(store, ImportConfig::default(), SideEffects::disabled())
        .expect("default topology is valid")
}

#[tokio::test]
async fn imports_and_replaces_rows() {
    let Some(db) = test_database("imports_and_replaces_rows").await else {
        return;
    };
    let coordinator = coordinator(&db);

    let request = ImportRequest::new()
        .domain(DomainKey::Blocks, DomainOptions::records(vec![block(1), block(2)]))
        .domain(DomainKey::Addresses, DomainOptions::records(vec![address("0xaa")]))
        .domain(
            DomainKey::Transactions,
            DomainOptions::records(vec![transaction("0x01", 2, "0xaa")]),
        );

    let first = coordinator.import(&request).await.expect("first import");
    assert_eq!(first.get(DomainKey::Blocks), Some(&[json!(1), json!(2)][..]));
    assert_eq!(first.get(DomainKey::Transactions), Some(&[json!("0x01")][..]));

    let second = coordinator.import(&request).await.expect("second import");
    assert_eq!(first, second);

    let (count, refetch): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE refetch_needed) FROM blocks",
    )
    .fetch_one(db.pool())
    .await
    .expect("block count");
    assert_eq!((count, refetch), (2, 0));

    db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn skip_returns_only_inserted_rows() {
    let Some(db) = test_database("skip_returns_only_inserted_rows").await else {
        return;
    };
    let coordinator = coordinator(&db);

    let request = |numbers: &[i64]| {
        ImportRequest::new().domain(
            DomainKey::Blocks,
            DomainOptions::records(numbers.iter().copied().map(block).collect())
                .with_conflict_policy(ConflictPolicy::Skip),
        )
    };

    coordinator.import(&request(&[5])).await.expect("first import");
    let result = coordinator
        .import(&request(&[5, 6]))
        .await
        .expect("second import");

    assert_eq!(result.get(DomainKey::Blocks), Some(&[json!(6)][..]));

    db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn merge_keeps_the_greatest_nonce() {
    let Some(db) = test_database("merge_keeps_the_greatest_nonce").await else {
        return;
    };
    let coordinator = coordinator(&db);

    let request = |nonce: i64| {
        ImportRequest::new().domain(
            DomainKey::Addresses,
            DomainOptions::records(vec![record(json!({"hash": "0xaa", "nonce": nonce}))])
                .with_conflict_policy(ConflictPolicy::Merge(BTreeMap::from([(
                    "nonce".to_string(),
                    MergeStrategy::Greatest,
                )]))),
        )
    };

    coordinator.import(&request(7)).await.expect("first import");
    coordinator.import(&request(3)).await.expect("second import");

    let nonce: i64 = sqlx::query_scalar("SELECT nonce FROM addresses WHERE hash = '0xaa'")
        .fetch_one(db.pool())
        .await
        .expect("address row");
    assert_eq!(nonce, 7);

    db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn failed_stage_rolls_back_and_flags_blocks() {
    let Some(db) = test_database("failed_stage_rolls_back_and_flags_blocks").await else {
        return;
    };
    let coordinator = coordinator(&db);

    let request = ImportRequest::new()
        .domain(
            DomainKey::Blocks,
            DomainOptions::records(vec![record(json!({"number": 100, "hash": "0xabc"}))]),
        )
        .domain(
            DomainKey::Addresses,
            DomainOptions::records(vec![address("0xbb")]),
        )
        .domain(
            DomainKey::Transactions,
            DomainOptions::records(vec![record(
                json!({"hash": "0xdef", "block_number": 999}),
            )]),
        );

    let err = coordinator
        .import(&request)
        .await
        .expect_err("transaction references a missing block");
    assert!(matches!(err, ImportError::TransactionFailure { stage_index: 1, .. }));

    let refetch_needed: bool =
        sqlx::query_scalar("SELECT refetch_needed FROM blocks WHERE number = 100")
            .fetch_one(db.pool())
            .await
            .expect("block committed");
    assert!(refetch_needed);

    // Addresses share the failed unit, so they rolled back with it.
    let addresses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM addresses")
        .fetch_one(db.pool())
        .await
        .expect("address count");
    assert_eq!(addresses, 0);

    db.close().await.expect("failed to drop test database");
}

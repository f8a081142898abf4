//! Transaction executor.
//!
//! Runs the units of one stage-group as tokio tasks, at most
//! `max_concurrency` at a time. Each unit gets its own timeout; a panic in a
//! unit is caught at the task boundary and reported like any other failure.

use crate::import::error::{UnitError, UnitFailure};
use crate::import::result::ImportResult;
use crate::import::unit::TransactionalUnit;
use crate::store::ImportStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;

#[derive(Clone)]
pub struct TransactionExecutor {
    store: Arc<dyn ImportStore>,
    max_concurrency: usize,
}

impl TransactionExecutor {
    pub fn new(store: Arc<dyn ImportStore>, max_concurrency: usize) -> Self {
        Self {
            store,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ImportStore> {
        &self.store
    }

    /// Run every unit of a group and merge their results.
    ///
    /// Outcomes are collected in submission order and scanned left to right;
    /// the first failure is returned.
    pub async fn run_group(
        &self,
        call_id: u64,
        group_index: usize,
        units: Vec<TransactionalUnit>,
        timeout: Duration,
    ) -> Result<ImportResult, UnitError> {
        if units.is_empty() {
            return Ok(ImportResult::default());
        }

        log::debug!(
            "import {call_id}: group {group_index} running {} units",
            units.len()
        );

        let outcomes: Vec<Result<ImportResult, UnitError>> =
            stream::iter(units.into_iter().enumerate())
                .map(|(position, unit)| self.run_unit(call_id, position, unit, timeout))
                .buffered(self.max_concurrency)
                .collect()
                .await;

        let mut merged = ImportResult::default();
        for outcome in outcomes {
            merged.merge(outcome?);
        }
        Ok(merged)
    }

    async fn run_unit(
        &self,
        call_id: u64,
        position: usize,
        unit: TransactionalUnit,
        timeout: Duration,
    ) -> Result<ImportResult, UnitError> {
        let store = Arc::clone(&self.store);
        let stage = unit.stage;
        let rows = unit.row_count();

        let handle = tokio::spawn(async move {
            tokio::time::timeout(timeout, store.run_unit(&unit)).await
        });

        let failure = match handle.await {
            Ok(Ok(Ok(result))) => {
                log::trace!("import {call_id}: unit {position} ({stage}) committed {rows} rows");
                return Ok(result);
            }
            Ok(Ok(Err(err))) => UnitFailure::Store(err),
            Ok(Err(_elapsed)) => UnitFailure::Timeout(timeout),
            Err(join_err) => UnitFailure::Panicked(panic_message(join_err)),
        };

        log::warn!("import {call_id}: unit {position} ({stage}) failed: {failure}");
        Err(UnitError {
            stage,
            position,
            failure,
        })
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }

    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::domain::DomainKey;
    use crate::import::error::StoreError;
    use crate::import::request::ConflictPolicy;
    use crate::import::unit::{Operation, Timestamps};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn block_unit(stage: &'static str, number: i64) -> TransactionalUnit {
        TransactionalUnit::new(
            stage,
            vec![Operation::new(
                DomainKey::Blocks.descriptor(),
                ConflictPolicy::Replace,
                vec![
                    serde_json::from_value(json!({"number": number, "hash": "0x01"}))
                        .expect("row"),
                ],
                Timestamps::now(),
                Duration::from_secs(1),
            )],
        )
    }

    #[tokio::test]
    async fn merges_results_of_all_units() {
        let store = Arc::new(MemoryStore::new());
        let executor = TransactionExecutor::new(store, 2);

        let result = executor
            .run_group(
                1,
                0,
                vec![block_unit("a", 1), block_unit("b", 2), block_unit("c", 3)],
                Duration::from_secs(5),
            )
            .await
            .expect("group commits");

        assert_eq!(
            result.get(DomainKey::Blocks),
            Some(&[json!(1), json!(2), json!(3)][..])
        );
    }

    #[tokio::test]
    async fn first_failure_in_submission_order_wins() {
        let store = Arc::new(MemoryStore::new());
        store.delay_stage("slow", Duration::from_millis(50));
        store.fail_stage("b", StoreError::Query("boom".into()));
        store.panic_in_stage("c");
        let executor = TransactionExecutor::new(store, 4);

        let err = executor
            .run_group(
                1,
                0,
                vec![block_unit("slow", 1), block_unit("c", 2), block_unit("b", 3)],
                Duration::from_secs(5),
            )
            .await
            .expect_err("group fails");

        assert_eq!(err.position, 1);
        assert_eq!(err.stage, "c");
        assert!(matches!(err.failure, UnitFailure::Panicked(ref message) if message.contains("injected panic")));
    }

    #[tokio::test]
    async fn slow_units_time_out() {
        let store = Arc::new(MemoryStore::new());
        store.delay_stage("slow", Duration::from_secs(5));
        let executor = TransactionExecutor::new(store.clone(), 1);

        let err = executor
            .run_group(1, 0, vec![block_unit("slow", 1)], Duration::from_millis(20))
            .await
            .expect_err("timeout");

        assert_eq!(err.failure, UnitFailure::Timeout(Duration::from_millis(20)));
        assert!(store.rows(DomainKey::Blocks).is_empty());
    }
}

//! In-process store.
//!
//! Mirrors the Postgres store closely enough for pipeline tests and dry
//! runs: units apply atomically, foreign keys are enforced against the
//! rows already committed, and conflict policies behave like the generated
//! SQL. Faults can be injected per stage.

use crate::import::domain::DomainKey;
use crate::import::error::StoreError;
use crate::import::request::{ConflictPolicy, MergeStrategy};
use crate::import::result::ImportResult;
use crate::import::unit::{Operation, TransactionalUnit, compare_values};
use crate::import::validators::ChangeMap;
use crate::store::ImportStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

type Table = BTreeMap<String, ChangeMap>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitEventKind {
    Started,
    Committed,
    RolledBack,
}

/// Lifecycle record of one unit, in the order units reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEvent {
    pub stage: &'static str,
    pub kind: UnitEventKind,
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(StoreError),
    Panic,
    Delay(Duration),
}

#[derive(Default)]
struct State {
    tables: HashMap<DomainKey, Table>,
    events: Vec<UnitEvent>,
    refetch_requests: Vec<Vec<i64>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<HashMap<&'static str, Fault>>,
    refetch_fault: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every unit of `stage` fail with `error`.
    pub fn fail_stage(&self, stage: &'static str, error: StoreError) {
        self.faults.lock().insert(stage, Fault::Fail(error));
    }

    /// Make every unit of `stage` panic.
    pub fn panic_in_stage(&self, stage: &'static str) {
        self.faults.lock().insert(stage, Fault::Panic);
    }

    /// Hold every unit of `stage` for `delay` before it touches any row.
    pub fn delay_stage(&self, stage: &'static str, delay: Duration) {
        self.faults.lock().insert(stage, Fault::Delay(delay));
    }

    pub fn fail_refetch(&self, error: StoreError) {
        *self.refetch_fault.lock() = Some(error);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
        *self.refetch_fault.lock() = None;
    }

    /// Committed rows of `domain`, ordered by key.
    pub fn rows(&self, domain: DomainKey) -> Vec<ChangeMap> {
        self.state
            .lock()
            .tables
            .get(&domain)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed row of `domain` with the given conflict target values.
    pub fn row(&self, domain: DomainKey, key: &[Value]) -> Option<ChangeMap> {
        self.state
            .lock()
            .tables
            .get(&domain)
            .and_then(|table| table.get(&table_key(key)))
            .cloned()
    }

    pub fn events(&self) -> Vec<UnitEvent> {
        self.state.lock().events.clone()
    }

    /// Block numbers passed to each `mark_blocks_for_refetch` call.
    pub fn refetch_requests(&self) -> Vec<Vec<i64>> {
        self.state.lock().refetch_requests.clone()
    }

    fn record(&self, stage: &'static str, kind: UnitEventKind) {
        self.state.lock().events.push(UnitEvent { stage, kind });
    }
}

#[rocket::async_trait]
impl ImportStore for MemoryStore {
    async fn run_unit(&self, unit: &TransactionalUnit) -> Result<ImportResult, StoreError> {
        self.record(unit.stage, UnitEventKind::Started);

        let fault = self.faults.lock().get(unit.stage).cloned();
        match fault {
            Some(Fault::Fail(error)) => {
                self.record(unit.stage, UnitEventKind::RolledBack);
                return Err(error);
            }
            Some(Fault::Panic) => panic!("injected panic in stage {}", unit.stage),
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let mut state = self.state.lock();
        let mut working = state.tables.clone();
        let mut result = ImportResult::default();

        for operation in &unit.operations {
            match apply(&mut working, operation) {
                Ok(identifiers) => result.extend(operation.domain, identifiers),
                Err(error) => {
                    state.events.push(UnitEvent {
                        stage: unit.stage,
                        kind: UnitEventKind::RolledBack,
                    });
                    return Err(error);
                }
            }
        }

        state.tables = working;
        state.events.push(UnitEvent {
            stage: unit.stage,
            kind: UnitEventKind::Committed,
        });
        Ok(result)
    }

    async fn mark_blocks_for_refetch(
        &self,
        numbers: &[i64],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.refetch_requests.push(numbers.to_vec());

        if let Some(error) = self.refetch_fault.lock().clone() {
            return Err(error);
        }

        let updated_at = Value::String(crate::import::unit::format_timestamp(at));
        let mut flagged = 0;
        if let Some(blocks) = state.tables.get_mut(&DomainKey::ROOT) {
            for number in numbers {
                if let Some(block) = blocks.get_mut(&table_key(&[Value::from(*number)])) {
                    block.insert("refetch_needed".to_string(), Value::Bool(true));
                    block.insert("updated_at".to_string(), updated_at.clone());
                    flagged += 1;
                }
            }
        }
        Ok(flagged)
    }
}

fn table_key(key: &[Value]) -> String {
    Value::Array(key.to_vec()).to_string()
}

fn apply(
    tables: &mut HashMap<DomainKey, Table>,
    operation: &Operation,
) -> Result<Vec<Value>, StoreError> {
    let descriptor = operation.domain.descriptor();
    let mut identifiers = Vec::with_capacity(operation.rows.len());

    for row in operation.stamped_rows() {
        for fk in descriptor.references {
            let Some(value) = row.get(fk.column).filter(|value| !value.is_null()) else {
                continue;
            };
            let present = tables
                .get(&fk.references)
                .is_some_and(|table| table.contains_key(&table_key(std::slice::from_ref(value))));
            if !present {
                return Err(StoreError::ConstraintViolation {
                    target: operation.target.to_string(),
                    message: format!(
                        "{} = {} is not present in {}",
                        fk.column,
                        value,
                        fk.references.descriptor().target
                    ),
                });
            }
        }

        let key = table_key(&operation.key_of(&row));
        let identifier = operation.identifier(&row);
        let table = tables.entry(operation.domain).or_default();

        match table.get_mut(&key) {
            None => {
                table.insert(key, row);
                identifiers.push(identifier);
            }
            Some(existing) => match &operation.conflict_policy {
                ConflictPolicy::Skip => {}
                ConflictPolicy::Replace => {
                    existing.extend(row.into_iter().filter(|(column, _)| column != "inserted_at"));
                    identifiers.push(identifier);
                }
                ConflictPolicy::Merge(strategies) => {
                    for (column, strategy) in strategies {
                        if let Some(incoming) = row.get(column) {
                            let current = existing.get(column).cloned().unwrap_or(Value::Null);
                            existing.insert(column.clone(), merge(*strategy, current, incoming.clone()));
                        }
                    }
                    if let Some(updated_at) = row.get("updated_at") {
                        existing.insert("updated_at".to_string(), updated_at.clone());
                    }
                    identifiers.push(identifier);
                }
            },
        }
    }

    Ok(identifiers)
}

fn merge(strategy: MergeStrategy, current: Value, incoming: Value) -> Value {
    match (strategy, current.is_null(), incoming.is_null()) {
        (MergeStrategy::Overwrite, _, _) => incoming,
        (MergeStrategy::KeepExisting, true, _) => incoming,
        (MergeStrategy::KeepExisting, false, _) => current,
        (MergeStrategy::Coalesce, _, true) => current,
        (MergeStrategy::Coalesce, _, false) => incoming,
        (MergeStrategy::Greatest | MergeStrategy::Least, true, _) => incoming,
        (MergeStrategy::Greatest | MergeStrategy::Least, _, true) => current,
        (MergeStrategy::Greatest, false, false) => {
            if compare_values(&incoming, &current) == Ordering::Greater {
                incoming
            } else {
                current
            }
        }
        (MergeStrategy::Least, false, false) => {
            if compare_values(&incoming, &current) == Ordering::Less {
                incoming
            } else {
                current
            }
        }
    }
}

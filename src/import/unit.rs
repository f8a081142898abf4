//! Transactional units and import plans.
//!
//! A [`TransactionalUnit`] is an ordered list of upsert [`Operation`]s that a
//! store commits or rolls back atomically. An [`ImportPlan`] holds the units
//! of one call, grouped into stage-groups that execute in order.

use crate::import::domain::{DomainKey, RunnerDescriptor};
use crate::import::request::ConflictPolicy;
use crate::import::validators::ChangeMap;
use chrono::{DateTime, SecondsFormat, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;

/// Timestamp pair stamped on every row written by one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct Timestamps {
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            inserted_at: now,
            updated_at: now,
        }
    }

    /// Copy `row` with `inserted_at`/`updated_at` filled in unless present.
    pub fn stamp(&self, row: &ChangeMap) -> ChangeMap {
        let mut stamped = row.clone();
        stamped
            .entry("inserted_at".to_string())
            .or_insert_with(|| Value::String(format_timestamp(self.inserted_at)));
        stamped
            .entry("updated_at".to_string())
            .or_insert_with(|| Value::String(format_timestamp(self.updated_at)));
        stamped
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One insert-or-upsert statement against a target collection.
#[derive(Debug, Clone)]
pub struct Operation {
    pub domain: DomainKey,
    pub target: &'static str,
    pub conflict_target: &'static [&'static str],
    pub conflict_policy: ConflictPolicy,
    pub rows: Vec<ChangeMap>,
    pub timestamps: Timestamps,
    /// Statement timeout for this operation.
    pub timeout: Duration,
}

impl Operation {
    pub fn new(
        descriptor: &'static RunnerDescriptor,
        conflict_policy: ConflictPolicy,
        rows: Vec<ChangeMap>,
        timestamps: Timestamps,
        timeout: Duration,
    ) -> Self {
        Self {
            domain: descriptor.key,
            target: descriptor.target,
            conflict_target: descriptor.conflict_target,
            conflict_policy,
            rows,
            timestamps,
            timeout,
        }
    }

    /// Rows with the call's timestamps applied.
    pub fn stamped_rows(&self) -> Vec<ChangeMap> {
        self.rows
            .iter()
            .map(|row| self.timestamps.stamp(row))
            .collect()
    }

    /// Identifier reported for a row: the scalar key for single-column
    /// targets, an object of key columns otherwise.
    pub fn identifier(&self, row: &ChangeMap) -> Value {
        match self.conflict_target {
            [column] => row.get(*column).cloned().unwrap_or(Value::Null),
            columns => Value::Object(
                columns
                    .iter()
                    .map(|column| {
                        (
                            column.to_string(),
                            row.get(*column).cloned().unwrap_or(Value::Null),
                        )
                    })
                    .collect(),
            ),
        }
    }

    /// Conflict target values of a row, in target order.
    pub fn key_of(&self, row: &ChangeMap) -> Vec<Value> {
        self.conflict_target
            .iter()
            .map(|column| row.get(*column).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Operations committed or rolled back together.
#[derive(Debug, Clone)]
pub struct TransactionalUnit {
    /// Name of the stage that produced this unit.
    pub stage: &'static str,
    pub operations: Vec<Operation>,
}

impl TransactionalUnit {
    pub fn new(stage: &'static str, operations: Vec<Operation>) -> Self {
        Self { stage, operations }
    }

    pub fn row_count(&self) -> usize {
        self.operations.iter().map(|op| op.rows.len()).sum()
    }
}

/// Units of one stage-group. Units inside a group have no mutual ordering.
#[derive(Debug, Clone, Default)]
pub struct PlannedGroup {
    pub units: Vec<TransactionalUnit>,
}

/// Built but not yet executed import.
///
/// Returned by [`crate::import::ImportCoordinator::prepare`] so callers can
/// add their own units before handing it to
/// [`crate::import::ImportCoordinator::execute`].
#[derive(Debug, Clone)]
pub struct ImportPlan {
    /// Correlation id used in every log line of this call.
    pub call_id: u64,
    pub groups: Vec<PlannedGroup>,
    /// Domains reported in the result, even when nothing was written.
    pub domains: Vec<DomainKey>,
    /// Root entity keys (block numbers) submitted in this call.
    pub root_keys: Vec<i64>,
    pub timestamps: Timestamps,
    pub timeout: Duration,
    pub broadcast: bool,
}

impl ImportPlan {
    /// Add a unit to an existing stage-group, or to a new trailing group
    /// when `group` is past the end.
    pub fn push_unit(&mut self, group: usize, unit: TransactionalUnit) {
        if group >= self.groups.len() {
            self.groups.push(PlannedGroup::default());
            let last = self.groups.len() - 1;
            self.groups[last].units.push(unit);
        } else {
            self.groups[group].units.push(unit);
        }
    }

    pub fn unit_count(&self) -> usize {
        self.groups.iter().map(|group| group.units.len()).sum()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            call_id: self.call_id,
            timestamps: self.timestamps,
            timeout_ms: self.timeout.as_millis() as u64,
            groups: self
                .groups
                .iter()
                .enumerate()
                .map(|(index, group)| GroupSummary {
                    index,
                    units: group
                        .units
                        .iter()
                        .map(|unit| UnitSummary {
                            stage: unit.stage.to_string(),
                            operations: unit
                                .operations
                                .iter()
                                .map(|op| OperationSummary {
                                    domain: op.domain,
                                    target: op.target.to_string(),
                                    conflict_policy: op.conflict_policy.clone(),
                                    rows: op.rows.len(),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Serializable view of an [`ImportPlan`].
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PlanSummary {
    pub call_id: u64,
    pub timestamps: Timestamps,
    pub timeout_ms: u64,
    pub groups: Vec<GroupSummary>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct GroupSummary {
    pub index: usize,
    pub units: Vec<UnitSummary>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct UnitSummary {
    pub stage: String,
    pub operations: Vec<OperationSummary>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct OperationSummary {
    pub domain: DomainKey,
    pub target: String,
    pub conflict_policy: ConflictPolicy,
    pub rows: usize,
}

/// Total order over JSON scalars used for key sorting and merge
/// comparisons. Numbers (including numeric strings) compare numerically,
/// null sorts first.
///
/// Integers and plain decimal strings compare digit by digit, so keys and
/// balances beyond `f64` precision keep their order.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    if let (Some(l), Some(r)) = (numeric(left), numeric(right)) {
        return l.compare(&r);
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        _ => left.to_string().cmp(&right.to_string()),
    }
}

enum Numeric {
    /// Sign plus integral digits without leading zeros and fractional
    /// digits without trailing zeros.
    Exact {
        negative: bool,
        integral: String,
        fractional: String,
    },
    Float(f64),
}

impl Numeric {
    fn compare(&self, other: &Numeric) -> Ordering {
        match (self, other) {
            (
                Numeric::Exact {
                    negative: l_neg,
                    integral: l_int,
                    fractional: l_frac,
                },
                Numeric::Exact {
                    negative: r_neg,
                    integral: r_int,
                    fractional: r_frac,
                },
            ) => match (l_neg, r_neg) {
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                (false, false) => compare_magnitude(l_int, l_frac, r_int, r_frac),
                (true, true) => compare_magnitude(r_int, r_frac, l_int, l_frac),
            },
            _ => self
                .as_f64()
                .partial_cmp(&other.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Numeric::Exact {
                negative,
                integral,
                fractional,
            } => {
                let magnitude: f64 = format!("0{integral}.{fractional}0").parse().unwrap_or(0.0);
                if *negative { -magnitude } else { magnitude }
            }
            Numeric::Float(value) => *value,
        }
    }
}

fn compare_magnitude(l_int: &str, l_frac: &str, r_int: &str, r_frac: &str) -> Ordering {
    l_int
        .len()
        .cmp(&r_int.len())
        .then_with(|| l_int.cmp(r_int))
        .then_with(|| l_frac.cmp(r_frac))
}

fn numeric(value: &Value) -> Option<Numeric> {
    match value {
        Value::Number(number) => exact_decimal(&number.to_string())
            .or_else(|| number.as_f64().map(Numeric::Float)),
        Value::String(text) if !text.starts_with("0x") => {
            let text = text.trim();
            exact_decimal(text).or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .map(Numeric::Float)
            })
        }
        _ => None,
    }
}

/// Parse `-?digits(.digits)?` without going through floating point.
fn exact_decimal(text: &str) -> Option<Numeric> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (integral, fractional) = unsigned.split_once('.').unwrap_or((unsigned, ""));

    let digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if integral.is_empty() || !digits(integral) || !digits(fractional) {
        return None;
    }
    if unsigned.contains('.') && fractional.is_empty() {
        return None;
    }

    let integral = integral.trim_start_matches('0').to_string();
    let fractional = fractional.trim_end_matches('0').to_string();
    let is_zero = integral.is_empty() && fractional.is_empty();

    Some(Numeric::Exact {
        negative: negative && !is_zero,
        integral,
        fractional,
    })
}

/// Lexicographic [`compare_values`] over key tuples.
pub fn compare_keys(left: &[Value], right: &[Value]) -> Ordering {
    left.iter()
        .zip(right)
        .map(|(l, r)| compare_values(l, r))
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| left.len().cmp(&right.len()))
}

//! Change-record construction.
//!
//! Runs each selected domain's validator over its raw records. A domain is
//! all-or-nothing: one bad record rejects the whole domain. Problems from
//! every domain are collected before failing so the caller sees all of them
//! in one round trip.

use crate::import::domain::{CHUNK_SIZE_OPTION, DefaultConflict, DomainKey, RunnerDescriptor};
use crate::import::error::{DomainErrors, ImportError, RecordError};
use crate::import::request::{ConflictPolicy, DomainOptions};
use crate::import::validators::{ChangeMap, ValidatorRegistry};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Resolved per-domain settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSettings {
    pub conflict_policy: ConflictPolicy,
    pub timeout: Duration,
    pub chunk_size: Option<usize>,
}

/// A domain whose records all passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedDomain {
    pub key: DomainKey,
    pub changes: Vec<ChangeMap>,
    pub settings: DomainSettings,
}

/// Validated change records of every selected domain.
pub type ChangeSets = BTreeMap<DomainKey, ValidatedDomain>;

impl From<&DefaultConflict> for ConflictPolicy {
    fn from(default: &DefaultConflict) -> Self {
        match default {
            DefaultConflict::Skip => ConflictPolicy::Skip,
            DefaultConflict::Replace => ConflictPolicy::Replace,
            DefaultConflict::Merge(columns) => ConflictPolicy::Merge(
                columns
                    .iter()
                    .map(|(column, strategy)| (column.to_string(), *strategy))
                    .collect(),
            ),
        }
    }
}

/// Validate every selected domain, aggregating failures across domains.
///
/// Domains are independent, so they are validated on the rayon pool.
pub fn build_change_sets(
    validators: &ValidatorRegistry,
    selected: &[(DomainKey, &DomainOptions)],
) -> Result<ChangeSets, ImportError> {
    let outcomes: Vec<Result<ValidatedDomain, DomainErrors>> = selected
        .par_iter()
        .map(|(key, options)| validate_domain(validators, key.descriptor(), options))
        .collect();

    let mut change_sets = ChangeSets::new();
    let mut failures = Vec::new();

    for outcome in outcomes {
        match outcome {
            Ok(domain) => {
                change_sets.insert(domain.key, domain);
            }
            Err(errors) => failures.push(errors),
        }
    }

    if failures.is_empty() {
        Ok(change_sets)
    } else {
        failures.sort_by_key(|failure| failure.domain);
        Err(ImportError::ValidationError(failures))
    }
}

fn validate_domain(
    validators: &ValidatorRegistry,
    descriptor: &RunnerDescriptor,
    options: &DomainOptions,
) -> Result<ValidatedDomain, DomainErrors> {
    let records = options.records.as_deref().unwrap_or_default();
    let mut errors = Vec::new();

    let settings = resolve_settings(descriptor, options, &mut errors);

    let validator_name = options
        .validator_name
        .as_deref()
        .unwrap_or(descriptor.default_validator);

    let mut changes = Vec::with_capacity(records.len());

    match validators.get(validator_name) {
        None => errors.push(RecordError::option(
            "validator_name",
            format!("unknown validator '{validator_name}'"),
        )),
        Some(validator) => {
            if let Err(reason) = validator.check_set(descriptor, records) {
                errors.push(RecordError::domain(reason));
            } else {
                for (index, record) in records.iter().enumerate() {
                    match validator.validate(descriptor, record) {
                        Ok(change) => changes.push(change),
                        Err(field_errors) => errors.extend(field_errors.into_iter().map(|e| {
                            RecordError::field(index, &e.field, e.message)
                        })),
                    }
                }
            }
        }
    }

    if errors.is_empty() {
        log::trace!(
            "{}: validated {} records with '{}'",
            descriptor.key,
            changes.len(),
            validator_name
        );
        Ok(ValidatedDomain {
            key: descriptor.key,
            changes,
            settings,
        })
    } else {
        Err(DomainErrors {
            domain: descriptor.key,
            errors,
        })
    }
}

fn resolve_settings(
    descriptor: &RunnerDescriptor,
    options: &DomainOptions,
    errors: &mut Vec<RecordError>,
) -> DomainSettings {
    let conflict_policy = options
        .conflict_policy
        .clone()
        .unwrap_or_else(|| ConflictPolicy::from(&descriptor.default_conflict));

    if let ConflictPolicy::Merge(columns) = &conflict_policy {
        for column in columns.keys() {
            if descriptor.is_conflict_column(column) {
                errors.push(RecordError::option(
                    "conflict_policy",
                    format!("cannot merge conflict target column '{column}'"),
                ));
            } else if descriptor.field(column).is_none() {
                errors.push(RecordError::option(
                    "conflict_policy",
                    format!("cannot merge unknown column '{column}'"),
                ));
            }
        }
    }

    let chunk_size = match options.extra.get(CHUNK_SIZE_OPTION) {
        None => None,
        Some(value) => match value.as_u64() {
            Some(size) if size > 0 => Some(size as usize),
            _ => {
                errors.push(RecordError::option(
                    CHUNK_SIZE_OPTION,
                    "must be a positive integer",
                ));
                None
            }
        },
    };

    DomainSettings {
        conflict_policy,
        timeout: options
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(descriptor.default_timeout),
        chunk_size,
    }
}

/// Block numbers carried by a validated blocks domain.
pub fn root_keys(change_sets: &ChangeSets) -> Vec<i64> {
    change_sets
        .get(&DomainKey::ROOT)
        .map(|domain| {
            domain
                .changes
                .iter()
                .filter_map(|change| change.get("number").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

//! Import request shape.
//!
//! A request maps domain names to their records and options. Domain names
//! stay plain strings here so that unknown names can be reported alongside
//! unknown options instead of failing deserialization.

use crate::import::domain::DomainKey;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// One raw input record, as submitted.
pub type RawRecord = Map<String, Value>;

/// Batch of records for one or more domains.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ImportRequest {
    /// Per-domain records and options, keyed by domain name.
    #[serde(default)]
    pub domains: BTreeMap<String, DomainOptions>,
    /// Broadcast the merged result to subscribers after commit.
    #[serde(default)]
    pub broadcast: bool,
    /// Timeout applied to each transactional unit, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ImportRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain(mut self, key: DomainKey, options: DomainOptions) -> Self {
        self.domains.insert(key.as_str().to_string(), options);
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }
}

/// Records and options for a single domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DomainOptions {
    /// Raw records. Absent is an error, empty means the domain is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<RawRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_name: Option<String>,
    /// Statement timeout for this domain in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Runner-specific options (for example `chunk_size`) and anything
    /// unrecognized.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DomainOptions {
    pub fn records(records: Vec<RawRecord>) -> Self {
        Self {
            records: Some(records),
            ..Self::default()
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = Some(policy);
        self
    }

    pub fn with_validator(mut self, name: impl Into<String>) -> Self {
        self.validator_name = Some(name.into());
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// What to do when a row with the same unique key already exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the existing row untouched.
    Skip,
    /// Overwrite every submitted column except `inserted_at`.
    Replace,
    /// Combine column by column; unlisted columns keep their stored value.
    Merge(BTreeMap<String, MergeStrategy>),
}

/// Column-level resolution used by [`ConflictPolicy::Merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Overwrite,
    KeepExisting,
    Greatest,
    Least,
    /// Take the submitted value unless it is null.
    Coalesce,
}

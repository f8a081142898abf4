//! Import result merging.
//!
//! Tracks the identifiers written per domain. Results from units and
//! stage-groups are merged additively.

use crate::import::domain::DomainKey;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Identifiers inserted or upserted per domain.
///
/// Single-column identifiers are stored as scalars (`100`, `"0xdef"`);
/// composite ones as objects keyed by column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ImportResult(BTreeMap<DomainKey, Vec<Value>>);

impl ImportResult {
    /// An empty result that still reports every given domain.
    pub fn with_domains(domains: impl IntoIterator<Item = DomainKey>) -> Self {
        Self(domains.into_iter().map(|key| (key, Vec::new())).collect())
    }

    pub fn extend(&mut self, domain: DomainKey, identifiers: impl IntoIterator<Item = Value>) {
        self.0.entry(domain).or_default().extend(identifiers);
    }

    /// Merge another result into this one by appending identifiers.
    pub fn merge(&mut self, other: ImportResult) {
        for (domain, identifiers) in other.0 {
            self.extend(domain, identifiers);
        }
    }

    pub fn get(&self, domain: DomainKey) -> Option<&[Value]> {
        self.0.get(&domain).map(Vec::as_slice)
    }

    pub fn domains(&self) -> impl Iterator<Item = DomainKey> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DomainKey, &[Value])> {
        self.0.iter().map(|(domain, ids)| (*domain, ids.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Identifier counts per domain, for logging.
    pub fn counts(&self) -> BTreeMap<DomainKey, usize> {
        self.0
            .iter()
            .map(|(domain, ids)| (*domain, ids.len()))
            .collect()
    }
}

//! Stage topology.
//!
//! Stages are grouped into stage-groups. Groups commit strictly one after
//! another; the stages inside a group have no dependency on each other and
//! their units run in parallel. Every registered domain is owned by exactly
//! one stage.

use crate::import::domain::DomainKey;
use crate::import::runner::{ChangeSets, ValidatedDomain};
use crate::import::unit::{Operation, PlannedGroup, Timestamps, TransactionalUnit, compare_keys};
use crate::import::validators::ChangeMap;
use serde_json::Value;
use thiserror::Error;

/// Named set of runners converted together.
#[derive(Debug)]
pub struct Stage {
    pub name: &'static str,
    /// Owned domains, in operation order.
    pub runners: &'static [DomainKey],
    /// One unit per runner instead of a single unit for the whole stage.
    pub split: bool,
}

/// Default topology: blocks, then the main entities, then everything that
/// hangs off transactions.
pub static STAGE_GROUPS: &[&[Stage]] = &[
    &[Stage {
        name: "blocks",
        runners: &[DomainKey::Blocks],
        split: false,
    }],
    &[Stage {
        name: "main",
        runners: &[
            DomainKey::Addresses,
            DomainKey::Tokens,
            DomainKey::Transactions,
        ],
        split: false,
    }],
    &[
        Stage {
            name: "logs",
            runners: &[DomainKey::Logs],
            split: false,
        },
        Stage {
            name: "token_transfers",
            runners: &[DomainKey::TokenTransfers],
            split: false,
        },
        Stage {
            name: "internal_transactions",
            runners: &[DomainKey::InternalTransactions],
            split: false,
        },
        Stage {
            name: "balances",
            runners: &[
                DomainKey::AddressCoinBalances,
                DomainKey::AddressTokenBalances,
            ],
            split: true,
        },
        Stage {
            name: "block_relations",
            runners: &[DomainKey::BlockSecondDegreeRelations],
            split: false,
        },
    ],
];

/// Topology defects found by [`StageGraph::verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("domain {0} is not owned by any stage")]
    Unowned(DomainKey),
    #[error("domain {domain} is owned by both {first} and {second}")]
    OwnedTwice {
        domain: DomainKey,
        first: &'static str,
        second: &'static str,
    },
    #[error("stage {stage} writes {domain} before {references} is committed")]
    ReferenceOrder {
        stage: &'static str,
        domain: DomainKey,
        references: DomainKey,
    },
}

/// Where a domain sits in the topology.
#[derive(Debug, Clone, Copy)]
struct Slot {
    group: usize,
    stage: &'static Stage,
    position: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct StageGraph {
    groups: &'static [&'static [Stage]],
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::new(STAGE_GROUPS)
    }
}

impl StageGraph {
    pub fn new(groups: &'static [&'static [Stage]]) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &'static [&'static [Stage]] {
        self.groups
    }

    /// Check that every domain is owned exactly once and that references
    /// point at domains committed earlier.
    ///
    /// A reference is satisfied by an earlier group, or by an earlier
    /// runner of the same unsplit stage (same transaction).
    pub fn verify(&self) -> Result<(), RegistryError> {
        let mut slots: Vec<(DomainKey, Slot)> = Vec::new();

        for (group, stages) in self.groups.iter().copied().enumerate() {
            for stage in stages {
                for (position, domain) in stage.runners.iter().enumerate() {
                    if let Some((_, existing)) = slots.iter().find(|(key, _)| key == domain) {
                        return Err(RegistryError::OwnedTwice {
                            domain: *domain,
                            first: existing.stage.name,
                            second: stage.name,
                        });
                    }
                    slots.push((
                        *domain,
                        Slot {
                            group,
                            stage,
                            position,
                        },
                    ));
                }
            }
        }

        let slot_of = |domain: DomainKey| {
            slots
                .iter()
                .find(|(key, _)| *key == domain)
                .map(|(_, slot)| *slot)
        };

        for domain in DomainKey::ALL {
            let slot = slot_of(domain).ok_or(RegistryError::Unowned(domain))?;

            for fk in domain.descriptor().references {
                let target = slot_of(fk.references).ok_or(RegistryError::Unowned(fk.references))?;

                let earlier_group = target.group < slot.group;
                let earlier_in_unit = std::ptr::eq(target.stage, slot.stage)
                    && !slot.stage.split
                    && target.position < slot.position;

                if !earlier_group && !earlier_in_unit {
                    return Err(RegistryError::ReferenceOrder {
                        stage: slot.stage.name,
                        domain,
                        references: fk.references,
                    });
                }
            }
        }

        Ok(())
    }

    /// Convert validated change sets into per-group units.
    ///
    /// # Panics
    ///
    /// Panics when a change set is left over after the last group, which
    /// means a domain is registered without a stage.
    pub fn build(&self, change_sets: ChangeSets, timestamps: Timestamps) -> Vec<PlannedGroup> {
        let mut remaining = change_sets;
        let mut planned = Vec::with_capacity(self.groups.len());

        for stages in self.groups.iter().copied() {
            let mut group = PlannedGroup::default();
            for stage in stages {
                let (units, rest) = stage.build(remaining, timestamps);
                group.units.extend(units);
                remaining = rest;
            }
            planned.push(group);
        }

        if !remaining.is_empty() {
            let leftover: Vec<DomainKey> = remaining.keys().copied().collect();
            panic!("change sets left unconsumed after the last stage group: {leftover:?}");
        }

        planned
    }
}

impl Stage {
    /// Take this stage's domains out of `remaining` and turn them into units.
    /// Returns the units together with the change sets still unconsumed.
    pub fn build(
        &self,
        mut remaining: ChangeSets,
        timestamps: Timestamps,
    ) -> (Vec<TransactionalUnit>, ChangeSets) {
        let mut operations_per_runner: Vec<Vec<Operation>> = Vec::new();

        for key in self.runners {
            let Some(domain) = remaining.remove(key) else {
                continue;
            };
            if domain.changes.is_empty() {
                continue;
            }
            operations_per_runner.push(operations(domain, timestamps));
        }

        let units = if operations_per_runner.is_empty() {
            Vec::new()
        } else if self.split {
            operations_per_runner
                .into_iter()
                .map(|operations| TransactionalUnit::new(self.name, operations))
                .collect()
        } else {
            vec![TransactionalUnit::new(
                self.name,
                operations_per_runner.into_iter().flatten().collect(),
            )]
        };

        (units, remaining)
    }
}

fn operations(domain: ValidatedDomain, timestamps: Timestamps) -> Vec<Operation> {
    let descriptor = domain.key.descriptor();
    let mut rows = ordered_rows(descriptor.conflict_target, domain.changes);

    if domain.key == DomainKey::ROOT {
        for row in &mut rows {
            row.insert("refetch_needed".to_string(), Value::Bool(false));
        }
    }

    let chunk_size = domain.settings.chunk_size.unwrap_or(rows.len()).max(1);

    rows.chunks(chunk_size)
        .map(|chunk| {
            Operation::new(
                descriptor,
                domain.settings.conflict_policy.clone(),
                chunk.to_vec(),
                timestamps,
                domain.settings.timeout,
            )
        })
        .collect()
}

/// Deduplicate on the conflict target keeping the last occurrence, then
/// sort by it so concurrent writers lock rows in the same order.
fn ordered_rows(conflict_target: &[&str], changes: Vec<ChangeMap>) -> Vec<ChangeMap> {
    let mut keyed: Vec<(Vec<Value>, ChangeMap)> = changes
        .into_iter()
        .rev()
        .map(|row| {
            let key = conflict_target
                .iter()
                .map(|column| row.get(*column).cloned().unwrap_or(Value::Null))
                .collect();
            (key, row)
        })
        .collect();

    keyed.sort_by(|(left, _), (right, _)| compare_keys(left, right));
    keyed.dedup_by(|(later, _), (earlier, _)| compare_keys(later, earlier).is_eq());

    keyed.into_iter().map(|(_, row)| row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::request::ConflictPolicy;
    use crate::import::runner::DomainSettings;
    use serde_json::json;
    use std::time::Duration;

    fn validated(key: DomainKey, rows: Vec<Value>, chunk_size: Option<usize>) -> ValidatedDomain {
        ValidatedDomain {
            key,
            changes: rows
                .into_iter()
                .map(|row| serde_json::from_value(row).expect("object row"))
                .collect(),
            settings: DomainSettings {
                conflict_policy: ConflictPolicy::Replace,
                timeout: Duration::from_secs(5),
                chunk_size,
            },
        }
    }

    fn sets(domains: Vec<ValidatedDomain>) -> ChangeSets {
        domains.into_iter().map(|d| (d.key, d)).collect()
    }

    #[test]
    fn default_topology_is_consistent() {
        assert_eq!(StageGraph::default().verify(), Ok(()));
    }

    #[test]
    fn detects_missing_owner() {
        static GROUPS: &[&[Stage]] = &[&[Stage {
            name: "blocks",
            runners: &[DomainKey::Blocks],
            split: false,
        }]];
        assert_eq!(
            StageGraph::new(GROUPS).verify(),
            Err(RegistryError::Unowned(DomainKey::Addresses))
        );
    }

    #[test]
    fn detects_double_ownership() {
        static GROUPS: &[&[Stage]] = &[&[
            Stage {
                name: "first",
                runners: &[DomainKey::Blocks],
                split: false,
            },
            Stage {
                name: "second",
                runners: &[DomainKey::Blocks],
                split: false,
            },
        ]];
        assert_eq!(
            StageGraph::new(GROUPS).verify(),
            Err(RegistryError::OwnedTwice {
                domain: DomainKey::Blocks,
                first: "first",
                second: "second",
            })
        );
    }

    #[test]
    fn detects_references_committed_too_late() {
        static GROUPS: &[&[Stage]] = &[
            &[Stage {
                name: "everything",
                runners: &[
                    DomainKey::Transactions,
                    DomainKey::Blocks,
                    DomainKey::Addresses,
                    DomainKey::Tokens,
                    DomainKey::Logs,
                    DomainKey::TokenTransfers,
                    DomainKey::InternalTransactions,
                    DomainKey::AddressCoinBalances,
                    DomainKey::AddressTokenBalances,
                    DomainKey::BlockSecondDegreeRelations,
                ],
                split: false,
            }],
        ];
        assert_eq!(
            StageGraph::new(GROUPS).verify(),
            Err(RegistryError::ReferenceOrder {
                stage: "everything",
                domain: DomainKey::Transactions,
                references: DomainKey::Blocks,
            })
        );
    }

    #[test]
    fn keys_beyond_f64_precision_stay_distinct() {
        let change_sets = sets(vec![validated(
            DomainKey::Blocks,
            vec![
                json!({"number": 9007199254740993_u64, "hash": "0x02"}),
                json!({"number": 9007199254740992_u64, "hash": "0x01"}),
                json!({"number": 9007199254740993_u64, "hash": "0x03"}),
            ],
            None,
        )]);

        let groups = StageGraph::default().build(change_sets, Timestamps::now());
        let rows = &groups[0].units[0].operations[0].rows;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["number"], json!(9007199254740992_u64));
        assert_eq!(rows[1]["number"], json!(9007199254740993_u64));
        assert_eq!(rows[1]["hash"], json!("0x03"));
    }

    #[test]
    fn main_stage_orders_operations_inside_one_unit() {
        let change_sets = sets(vec![
            validated(
                DomainKey::Transactions,
                vec![json!({"hash": "0xdef", "block_number": 100})],
                None,
            ),
            validated(DomainKey::Addresses, vec![json!({"hash": "0xaa"})], None),
        ]);

        let groups = StageGraph::default().build(change_sets, Timestamps::now());

        assert_eq!(groups.len(), 3);
        assert!(groups[0].units.is_empty());
        assert_eq!(groups[1].units.len(), 1);
        let domains: Vec<DomainKey> = groups[1].units[0]
            .operations
            .iter()
            .map(|op| op.domain)
            .collect();
        assert_eq!(domains, vec![DomainKey::Addresses, DomainKey::Transactions]);
    }

    #[test]
    fn balances_split_into_one_unit_per_runner() {
        let change_sets = sets(vec![
            validated(
                DomainKey::AddressCoinBalances,
                vec![json!({"address_hash": "0xaa", "block_number": 1})],
                None,
            ),
            validated(
                DomainKey::AddressTokenBalances,
                vec![json!({
                    "address_hash": "0xaa",
                    "token_contract_address_hash": "0xbb",
                    "block_number": 1
                })],
                None,
            ),
        ]);

        let groups = StageGraph::default().build(change_sets, Timestamps::now());

        assert_eq!(groups[2].units.len(), 2);
        assert!(groups[2].units.iter().all(|unit| unit.stage == "balances"));
    }

    #[test]
    fn rows_are_deduplicated_sorted_and_chunked() {
        let change_sets = sets(vec![validated(
            DomainKey::Blocks,
            vec![
                json!({"number": 3, "hash": "0x03"}),
                json!({"number": 1, "hash": "0x01"}),
                json!({"number": 3, "hash": "0x33"}),
                json!({"number": 2, "hash": "0x02"}),
            ],
            Some(2),
        )]);

        let groups = StageGraph::default().build(change_sets, Timestamps::now());
        let operations = &groups[0].units[0].operations;

        assert_eq!(operations.len(), 2);
        let numbers: Vec<Value> = operations
            .iter()
            .flat_map(|op| op.rows.iter().map(|row| row["number"].clone()))
            .collect();
        assert_eq!(numbers, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(operations[1].rows[0]["hash"], json!("0x33"));
        assert_eq!(operations[0].rows[0]["refetch_needed"], json!(false));
    }

    #[test]
    #[should_panic(expected = "left unconsumed")]
    fn leftover_change_sets_abort() {
        static GROUPS: &[&[Stage]] = &[&[Stage {
            name: "blocks",
            runners: &[DomainKey::Blocks],
            split: false,
        }]];
        let change_sets = sets(vec![validated(DomainKey::Addresses, vec![json!({"hash": "0xaa"})], None)]);

        StageGraph::new(GROUPS).build(change_sets, Timestamps::now());
    }
}

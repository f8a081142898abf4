//! Domain registry.
//!
//! Every importable record kind is a [`DomainKey`] variant, and every variant
//! owns exactly one static [`RunnerDescriptor`]. The descriptor table is the
//! whole runner registry: there is no runtime registration, so adding a kind
//! means adding a variant, a descriptor and a stage slot (see
//! [`crate::import::stage`]).

use crate::import::request::MergeStrategy;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Identifier naming one importable entity kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DomainKey {
    Blocks,
    Addresses,
    Tokens,
    Transactions,
    Logs,
    TokenTransfers,
    InternalTransactions,
    AddressCoinBalances,
    AddressTokenBalances,
    BlockSecondDegreeRelations,
}

impl DomainKey {
    /// Every registered domain, in registry order.
    pub const ALL: [DomainKey; 10] = [
        DomainKey::Blocks,
        DomainKey::Addresses,
        DomainKey::Tokens,
        DomainKey::Transactions,
        DomainKey::Logs,
        DomainKey::TokenTransfers,
        DomainKey::InternalTransactions,
        DomainKey::AddressCoinBalances,
        DomainKey::AddressTokenBalances,
        DomainKey::BlockSecondDegreeRelations,
    ];

    /// The root entity. Its keys are flagged for refetch when a call fails
    /// after it committed.
    pub const ROOT: DomainKey = DomainKey::Blocks;

    pub fn as_str(self) -> &'static str {
        self.descriptor().option_key
    }

    pub fn descriptor(self) -> &'static RunnerDescriptor {
        match self {
            DomainKey::Blocks => &BLOCKS,
            DomainKey::Addresses => &ADDRESSES,
            DomainKey::Tokens => &TOKENS,
            DomainKey::Transactions => &TRANSACTIONS,
            DomainKey::Logs => &LOGS,
            DomainKey::TokenTransfers => &TOKEN_TRANSFERS,
            DomainKey::InternalTransactions => &INTERNAL_TRANSACTIONS,
            DomainKey::AddressCoinBalances => &ADDRESS_COIN_BALANCES,
            DomainKey::AddressTokenBalances => &ADDRESS_TOKEN_BALANCES,
            DomainKey::BlockSecondDegreeRelations => &BLOCK_SECOND_DEGREE_RELATIONS,
        }
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown domain key: {0}")]
pub struct UnknownDomainKey(pub String);

impl FromStr for DomainKey {
    type Err = UnknownDomainKey;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DomainKey::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
            .ok_or_else(|| UnknownDomainKey(value.to_string()))
    }
}

/// Value shape accepted for a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Non-negative integer (block numbers, indexes, nonces).
    Integer,
    /// `0x`-prefixed hex string, normalized to lowercase.
    Hash,
    /// Arbitrary precision number, kept as its decimal string.
    Decimal,
    Boolean,
    Text,
    /// RFC 3339 timestamp, normalized to UTC.
    Timestamp,
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
    }
}

/// Single-column reference from one domain to the identifier of another.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: DomainKey,
}

const fn references(column: &'static str, references: DomainKey) -> ForeignKey {
    ForeignKey { column, references }
}

/// Conflict handling a runner applies when the request does not choose one.
#[derive(Debug, Clone, Copy)]
pub enum DefaultConflict {
    Skip,
    Replace,
    Merge(&'static [(&'static str, MergeStrategy)]),
}

/// Static description of one runner: where its records go and which
/// options it understands.
#[derive(Debug)]
pub struct RunnerDescriptor {
    pub key: DomainKey,
    /// Name of the domain in import requests.
    pub option_key: &'static str,
    /// Target collection (table) in the store.
    pub target: &'static str,
    /// Unique key columns; also the identifiers reported in results.
    pub conflict_target: &'static [&'static str],
    pub default_timeout: Duration,
    pub default_validator: &'static str,
    pub default_conflict: DefaultConflict,
    pub extra_recognized_options: &'static [&'static str],
    pub fields: &'static [FieldSpec],
    pub references: &'static [ForeignKey],
}

/// Options every runner accepts besides `records`.
pub const BASE_OPTIONS: [&str; 3] = ["conflict_policy", "validator_name", "timeout"];

/// Extra option splitting a bulk domain into several statements.
pub const CHUNK_SIZE_OPTION: &str = "chunk_size";

impl RunnerDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn recognizes_extra(&self, option: &str) -> bool {
        self.extra_recognized_options.contains(&option)
    }

    pub fn is_conflict_column(&self, column: &str) -> bool {
        self.conflict_target.contains(&column)
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CHANGESET: &str = "changeset";

use FieldKind::{Boolean, Decimal, Hash, Integer, Text, Timestamp};

static BLOCKS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::Blocks,
    option_key: "blocks",
    target: "blocks",
    conflict_target: &["number"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Replace,
    extra_recognized_options: &[],
    fields: &[
        required("number", Integer),
        required("hash", Hash),
        optional("parent_hash", Hash),
        optional("miner_hash", Hash),
        optional("timestamp", Timestamp),
        optional("gas_limit", Decimal),
        optional("gas_used", Decimal),
        optional("size", Integer),
        optional("consensus", Boolean),
    ],
    references: &[],
};

static ADDRESSES: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::Addresses,
    option_key: "addresses",
    target: "addresses",
    conflict_target: &["hash"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Merge(&[
        ("contract_code", MergeStrategy::Coalesce),
        ("fetched_coin_balance", MergeStrategy::Coalesce),
        ("fetched_coin_balance_block_number", MergeStrategy::Greatest),
        ("nonce", MergeStrategy::Greatest),
    ]),
    extra_recognized_options: &[],
    fields: &[
        required("hash", Hash),
        optional("fetched_coin_balance", Decimal),
        optional("fetched_coin_balance_block_number", Integer),
        optional("contract_code", Text),
        optional("nonce", Integer),
    ],
    references: &[],
};

static TOKENS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::Tokens,
    option_key: "tokens",
    target: "tokens",
    conflict_target: &["contract_address_hash"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Skip,
    extra_recognized_options: &[],
    fields: &[
        required("contract_address_hash", Hash),
        required("type", Text),
        optional("name", Text),
        optional("symbol", Text),
        optional("decimals", Integer),
        optional("total_supply", Decimal),
    ],
    references: &[references("contract_address_hash", DomainKey::Addresses)],
};

static TRANSACTIONS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::Transactions,
    option_key: "transactions",
    target: "transactions",
    conflict_target: &["hash"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Replace,
    extra_recognized_options: &[CHUNK_SIZE_OPTION],
    fields: &[
        required("hash", Hash),
        required("block_number", Integer),
        optional("block_hash", Hash),
        optional("index", Integer),
        optional("from_address_hash", Hash),
        optional("to_address_hash", Hash),
        optional("value", Decimal),
        optional("gas", Decimal),
        optional("gas_price", Decimal),
        optional("gas_used", Decimal),
        optional("nonce", Integer),
        optional("input", Text),
        optional("status", Integer),
    ],
    references: &[
        references("block_number", DomainKey::Blocks),
        references("from_address_hash", DomainKey::Addresses),
        references("to_address_hash", DomainKey::Addresses),
    ],
};

static LOGS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::Logs,
    option_key: "logs",
    target: "logs",
    conflict_target: &["transaction_hash", "index"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Replace,
    extra_recognized_options: &[CHUNK_SIZE_OPTION],
    fields: &[
        required("transaction_hash", Hash),
        required("index", Integer),
        required("block_number", Integer),
        optional("block_hash", Hash),
        optional("address_hash", Hash),
        optional("data", Text),
        optional("first_topic", Hash),
        optional("second_topic", Hash),
        optional("third_topic", Hash),
        optional("fourth_topic", Hash),
    ],
    references: &[
        references("transaction_hash", DomainKey::Transactions),
        references("block_number", DomainKey::Blocks),
    ],
};

static TOKEN_TRANSFERS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::TokenTransfers,
    option_key: "token_transfers",
    target: "token_transfers",
    conflict_target: &["transaction_hash", "log_index"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Replace,
    extra_recognized_options: &[CHUNK_SIZE_OPTION],
    fields: &[
        required("transaction_hash", Hash),
        required("log_index", Integer),
        required("block_number", Integer),
        required("token_contract_address_hash", Hash),
        optional("from_address_hash", Hash),
        optional("to_address_hash", Hash),
        optional("amount", Decimal),
        optional("token_id", Decimal),
    ],
    references: &[
        references("transaction_hash", DomainKey::Transactions),
        references("token_contract_address_hash", DomainKey::Tokens),
    ],
};

static INTERNAL_TRANSACTIONS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::InternalTransactions,
    option_key: "internal_transactions",
    target: "internal_transactions",
    conflict_target: &["transaction_hash", "index"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Replace,
    extra_recognized_options: &[CHUNK_SIZE_OPTION],
    fields: &[
        required("transaction_hash", Hash),
        required("index", Integer),
        required("block_number", Integer),
        required("type", Text),
        optional("call_type", Text),
        optional("from_address_hash", Hash),
        optional("to_address_hash", Hash),
        optional("value", Decimal),
        optional("gas", Decimal),
        optional("gas_used", Decimal),
        optional("error", Text),
    ],
    references: &[
        references("transaction_hash", DomainKey::Transactions),
        references("block_number", DomainKey::Blocks),
    ],
};

static ADDRESS_COIN_BALANCES: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::AddressCoinBalances,
    option_key: "address_coin_balances",
    target: "address_coin_balances",
    conflict_target: &["address_hash", "block_number"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Merge(&[
        ("value", MergeStrategy::Coalesce),
        ("value_fetched_at", MergeStrategy::Greatest),
    ]),
    extra_recognized_options: &[CHUNK_SIZE_OPTION],
    fields: &[
        required("address_hash", Hash),
        required("block_number", Integer),
        optional("value", Decimal),
        optional("value_fetched_at", Timestamp),
    ],
    references: &[
        references("address_hash", DomainKey::Addresses),
        references("block_number", DomainKey::Blocks),
    ],
};

static ADDRESS_TOKEN_BALANCES: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::AddressTokenBalances,
    option_key: "address_token_balances",
    target: "address_token_balances",
    conflict_target: &["address_hash", "token_contract_address_hash", "block_number"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Merge(&[
        ("value", MergeStrategy::Coalesce),
        ("value_fetched_at", MergeStrategy::Greatest),
    ]),
    extra_recognized_options: &[],
    fields: &[
        required("address_hash", Hash),
        required("token_contract_address_hash", Hash),
        required("block_number", Integer),
        optional("value", Decimal),
        optional("value_fetched_at", Timestamp),
    ],
    references: &[
        references("address_hash", DomainKey::Addresses),
        references("token_contract_address_hash", DomainKey::Tokens),
        references("block_number", DomainKey::Blocks),
    ],
};

static BLOCK_SECOND_DEGREE_RELATIONS: RunnerDescriptor = RunnerDescriptor {
    key: DomainKey::BlockSecondDegreeRelations,
    option_key: "block_second_degree_relations",
    target: "block_second_degree_relations",
    conflict_target: &["nephew_number", "uncle_hash"],
    default_timeout: DEFAULT_TIMEOUT,
    default_validator: CHANGESET,
    default_conflict: DefaultConflict::Skip,
    extra_recognized_options: &[],
    fields: &[
        required("nephew_number", Integer),
        required("uncle_hash", Hash),
        optional("index", Integer),
        optional("uncle_fetched_at", Timestamp),
    ],
    references: &[references("nephew_number", DomainKey::Blocks)],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_match_their_keys() {
        for key in DomainKey::ALL {
            let descriptor = key.descriptor();
            assert_eq!(descriptor.key, key);
            assert_eq!(key.as_str().parse::<DomainKey>(), Ok(key));
        }
    }

    #[test]
    fn conflict_targets_are_declared_required_fields() {
        for key in DomainKey::ALL {
            let descriptor = key.descriptor();
            for column in descriptor.conflict_target {
                let field = descriptor
                    .field(column)
                    .unwrap_or_else(|| panic!("{key}: conflict column {column} not declared"));
                assert!(field.required, "{key}: conflict column {column} must be required");
            }
        }
    }

    #[test]
    fn references_point_at_single_column_identifiers() {
        for key in DomainKey::ALL {
            for fk in key.descriptor().references {
                assert!(key.descriptor().field(fk.column).is_some());
                assert_eq!(fk.references.descriptor().conflict_target.len(), 1);
            }
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert_eq!(
            "receipts".parse::<DomainKey>(),
            Err(UnknownDomainKey("receipts".to_string()))
        );
    }
}

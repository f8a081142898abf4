//! Postgres store.
//!
//! Each operation becomes one `INSERT ... SELECT FROM jsonb_populate_recordset`
//! statement, so a whole chunk of rows travels as a single JSON parameter and
//! Postgres casts every column to the table's own types.

use crate::import::domain::DomainKey;
use crate::import::error::StoreError;
use crate::import::request::{ConflictPolicy, MergeStrategy};
use crate::import::result::ImportResult;
use crate::import::unit::{Operation, TransactionalUnit};
use crate::import::validators::ChangeMap;
use crate::store::ImportStore;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::postgres::PgPoolOptions;
use rocket_db_pools::sqlx::types::Json;
use rocket_db_pools::sqlx::{self, PgPool, Postgres, Transaction};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_operation(
        tx: &mut Transaction<'_, Postgres>,
        operation: &Operation,
    ) -> Result<Vec<Value>, StoreError> {
        if operation.rows.is_empty() {
            return Ok(Vec::new());
        }

        // SET does not take bind parameters
        let timeout_ms = operation.timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut **tx)
            .await?;

        let rows = operation.stamped_rows();
        let sql = upsert_sql(operation, &columns_of(&rows));

        let returned: Vec<Json<ChangeMap>> = sqlx::query_scalar(&sql)
            .bind(Json(&rows))
            .fetch_all(&mut **tx)
            .await?;

        log::trace!(
            "{}: upserted {} of {} rows",
            operation.target,
            returned.len(),
            rows.len()
        );

        Ok(returned
            .iter()
            .map(|Json(key)| operation.identifier(key))
            .collect())
    }
}

#[rocket::async_trait]
impl ImportStore for PgStore {
    async fn run_unit(&self, unit: &TransactionalUnit) -> Result<ImportResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut result = ImportResult::default();

        for operation in &unit.operations {
            let identifiers = Self::run_operation(&mut tx, operation).await?;
            result.extend(operation.domain, identifiers);
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn mark_blocks_for_refetch(
        &self,
        numbers: &[i64],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if numbers.is_empty() {
            return Ok(0);
        }

        let target = quote_ident(DomainKey::ROOT.descriptor().target);
        let updated = sqlx::query(&format!(
            "UPDATE {target} SET refetch_needed = TRUE, updated_at = $2 WHERE number = ANY($1)"
        ))
        .bind(numbers)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected())
    }
}

/// Union of the column names present in `rows`, sorted.
pub fn columns_of(rows: &[ChangeMap]) -> Vec<String> {
    rows.iter()
        .flat_map(|row| row.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Build the upsert statement for `operation`. `$1` is the JSON array of
/// rows; the statement returns one JSON object of key columns per written
/// row.
pub fn upsert_sql(operation: &Operation, columns: &[String]) -> String {
    let target = quote_ident(operation.target);
    let column_list = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_columns = operation
        .conflict_target
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let returning = operation
        .conflict_target
        .iter()
        .map(|column| format!("'{column}', t.{}", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");

    let on_conflict = match conflict_updates(operation, columns) {
        Some(updates) => format!("ON CONFLICT ({conflict_columns}) DO UPDATE SET {updates}"),
        None => format!("ON CONFLICT ({conflict_columns}) DO NOTHING"),
    };

    format!(
        "INSERT INTO {target} AS t ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{target}, $1) \
         {on_conflict} \
         RETURNING jsonb_build_object({returning})"
    )
}

fn conflict_updates(operation: &Operation, columns: &[String]) -> Option<String> {
    let updatable = columns.iter().filter(|column| {
        !operation.conflict_target.contains(&column.as_str()) && column.as_str() != "inserted_at"
    });

    let assignments: Vec<String> = match &operation.conflict_policy {
        ConflictPolicy::Skip => return None,
        ConflictPolicy::Replace => updatable
            .map(|column| {
                let column = quote_ident(column);
                format!("{column} = EXCLUDED.{column}")
            })
            .collect(),
        ConflictPolicy::Merge(strategies) => updatable
            .filter_map(|column| {
                if column == "updated_at" {
                    let column = quote_ident(column);
                    return Some(format!("{column} = EXCLUDED.{column}"));
                }
                let strategy = strategies.get(column)?;
                Some(merge_assignment(column, *strategy))
            })
            .collect(),
    };

    if assignments.is_empty() {
        None
    } else {
        Some(assignments.join(", "))
    }
}

fn merge_assignment(column: &str, strategy: MergeStrategy) -> String {
    let column = quote_ident(column);
    let value = match strategy {
        MergeStrategy::Overwrite => format!("EXCLUDED.{column}"),
        MergeStrategy::KeepExisting => format!("COALESCE(t.{column}, EXCLUDED.{column})"),
        MergeStrategy::Greatest => format!("GREATEST(t.{column}, EXCLUDED.{column})"),
        MergeStrategy::Least => format!("LEAST(t.{column}, EXCLUDED.{column})"),
        MergeStrategy::Coalesce => format!("COALESCE(EXCLUDED.{column}, t.{column})"),
    };
    format!("{column} = {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::unit::Timestamps;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn operation(key: DomainKey, policy: ConflictPolicy) -> Operation {
        Operation::new(
            key.descriptor(),
            policy,
            Vec::new(),
            Timestamps::now(),
            Duration::from_secs(1),
        )
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn replace_updates_everything_but_keys_and_inserted_at() {
        let sql = upsert_sql(
            &operation(DomainKey::Blocks, ConflictPolicy::Replace),
            &columns(&["hash", "inserted_at", "number", "updated_at"]),
        );

        assert_eq!(
            sql,
            "INSERT INTO \"blocks\" AS t (\"hash\", \"inserted_at\", \"number\", \"updated_at\") \
             SELECT \"hash\", \"inserted_at\", \"number\", \"updated_at\" \
             FROM jsonb_populate_recordset(NULL::\"blocks\", $1) \
             ON CONFLICT (\"number\") DO UPDATE SET \"hash\" = EXCLUDED.\"hash\", \
             \"updated_at\" = EXCLUDED.\"updated_at\" \
             RETURNING jsonb_build_object('number', t.\"number\")"
        );
    }

    #[test]
    fn skip_does_nothing_on_conflict() {
        let sql = upsert_sql(
            &operation(DomainKey::BlockSecondDegreeRelations, ConflictPolicy::Skip),
            &columns(&["nephew_number", "uncle_hash"]),
        );

        assert!(sql.contains("ON CONFLICT (\"nephew_number\", \"uncle_hash\") DO NOTHING"));
        assert!(sql.ends_with(
            "RETURNING jsonb_build_object('nephew_number', t.\"nephew_number\", 'uncle_hash', t.\"uncle_hash\")"
        ));
    }

    #[test]
    fn merge_only_touches_listed_submitted_columns() {
        let strategies = BTreeMap::from([
            ("nonce".to_string(), MergeStrategy::Greatest),
            ("contract_code".to_string(), MergeStrategy::Coalesce),
        ]);
        let sql = upsert_sql(
            &operation(DomainKey::Addresses, ConflictPolicy::Merge(strategies)),
            &columns(&["fetched_coin_balance", "hash", "nonce", "updated_at"]),
        );

        assert!(sql.contains(
            "DO UPDATE SET \"nonce\" = GREATEST(t.\"nonce\", EXCLUDED.\"nonce\"), \
             \"updated_at\" = EXCLUDED.\"updated_at\""
        ));
        assert!(!sql.contains("contract_code"));
        assert!(!sql.contains("\"fetched_coin_balance\" ="));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("type"), "\"type\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn columns_are_the_union_of_rows() {
        let rows: Vec<ChangeMap> = vec![
            serde_json::from_value(serde_json::json!({"number": 1, "hash": "0x1"})).expect("row"),
            serde_json::from_value(serde_json::json!({"number": 2, "size": 10})).expect("row"),
        ];
        assert_eq!(columns_of(&rows), columns(&["hash", "number", "size"]));
    }
}

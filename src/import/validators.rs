//! Record validators.
//!
//! A validator turns one raw record into a normalized change map, or
//! explains why it cannot. Validators are looked up by name, so a request
//! may pick a stricter (or custom) validator per domain with
//! `validator_name`.

use crate::import::domain::{FieldKind, FieldSpec, RunnerDescriptor};
use crate::import::request::RawRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Normalized column -> value map for one record.
pub type ChangeMap = BTreeMap<String, Value>;

/// Field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub trait Validator: Send + Sync {
    /// Reject a whole record set regardless of field validity.
    ///
    /// Returning `Err(reason)` fails the domain exactly like a field error.
    fn check_set(
        &self,
        _descriptor: &RunnerDescriptor,
        _records: &[RawRecord],
    ) -> Result<(), String> {
        Ok(())
    }

    fn validate(
        &self,
        descriptor: &RunnerDescriptor,
        record: &RawRecord,
    ) -> Result<ChangeMap, Vec<FieldError>>;
}

pub const CHANGESET_VALIDATOR: &str = "changeset";
pub const STRICT_VALIDATOR: &str = "strict";

/// Casts the descriptor's declared fields.
///
/// Undeclared fields are dropped, or rejected when `strict` is set.
pub struct SchemaValidator {
    strict: bool,
}

impl SchemaValidator {
    pub fn changeset() -> Self {
        Self { strict: false }
    }

    pub fn strict() -> Self {
        Self { strict: true }
    }
}

impl Validator for SchemaValidator {
    fn validate(
        &self,
        descriptor: &RunnerDescriptor,
        record: &RawRecord,
    ) -> Result<ChangeMap, Vec<FieldError>> {
        let mut changes = ChangeMap::new();
        let mut errors = Vec::new();

        for spec in descriptor.fields {
            match record.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    errors.push(FieldError::new(spec.name, "can't be blank"));
                }
                None => {}
                Some(Value::Null) => {
                    changes.insert(spec.name.to_string(), Value::Null);
                }
                Some(value) => match cast(spec, value) {
                    Ok(cast) => {
                        changes.insert(spec.name.to_string(), cast);
                    }
                    Err(message) => errors.push(FieldError::new(spec.name, message)),
                },
            }
        }

        if self.strict {
            for name in record.keys() {
                if descriptor.field(name).is_none() {
                    errors.push(FieldError::new(name, "is not a recognized field"));
                }
            }
        }

        if errors.is_empty() {
            Ok(changes)
        } else {
            Err(errors)
        }
    }
}

fn cast(spec: &FieldSpec, value: &Value) -> Result<Value, String> {
    match spec.kind {
        FieldKind::Integer => cast_integer(value),
        FieldKind::Hash => cast_hash(value),
        FieldKind::Decimal => cast_decimal(value),
        FieldKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err("must be a boolean".to_string()),
        },
        FieldKind::Text => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err("must be a string".to_string()),
        },
        FieldKind::Timestamp => cast_timestamp(value),
        FieldKind::Json => Ok(value.clone()),
    }
}

fn cast_integer(value: &Value) -> Result<Value, String> {
    let parsed = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };

    match parsed {
        Some(number) if number >= 0 => Ok(Value::from(number)),
        Some(_) => Err("must be greater than or equal to 0".to_string()),
        None => Err("must be an integer".to_string()),
    }
}

fn cast_hash(value: &Value) -> Result<Value, String> {
    let Value::String(text) = value else {
        return Err("must be a 0x-prefixed hex string".to_string());
    };

    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .filter(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()));

    match digits {
        Some(digits) => Ok(Value::String(format!("0x{}", digits.to_ascii_lowercase()))),
        None => Err("must be a 0x-prefixed hex string".to_string()),
    }
}

fn cast_decimal(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(number) => Ok(Value::String(number.to_string())),
        Value::String(text) if is_decimal(text.trim()) => Ok(Value::String(text.trim().to_string())),
        _ => Err("must be a decimal number".to_string()),
    }
}

fn is_decimal(text: &str) -> bool {
    let unsigned = text.strip_prefix('-').unwrap_or(text);
    let mut parts = unsigned.splitn(2, '.');
    let integral = parts.next().unwrap_or_default();
    let fractional = parts.next();

    !integral.is_empty()
        && integral.chars().all(|c| c.is_ascii_digit())
        && fractional.is_none_or(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

fn cast_timestamp(value: &Value) -> Result<Value, String> {
    let Value::String(text) = value else {
        return Err("must be an RFC 3339 timestamp".to_string());
    };

    DateTime::parse_from_rfc3339(text)
        .map(|parsed| {
            Value::String(
                parsed
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            )
        })
        .map_err(|_| "must be an RFC 3339 timestamp".to_string())
}

/// Named validators available to runners.
#[derive(Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    /// Registry holding the built-in `changeset` and `strict` validators.
    pub fn new() -> Self {
        let mut registry = Self {
            validators: HashMap::new(),
        };
        registry.register(CHANGESET_VALIDATOR, SchemaValidator::changeset());
        registry.register(STRICT_VALIDATOR, SchemaValidator::strict());
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, validator: impl Validator + 'static) {
        self.validators.insert(name.into(), Arc::new(validator));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Validator>> {
        self.validators.get(name).cloned()
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::domain::DomainKey;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn changeset_normalizes_and_drops_undeclared_fields() {
        let descriptor = DomainKey::Blocks.descriptor();
        let changes = SchemaValidator::changeset()
            .validate(
                descriptor,
                &record(json!({
                    "number": "100",
                    "hash": "0xABC",
                    "gas_used": 21000,
                    "timestamp": "2024-01-01T02:00:00+02:00",
                    "uncles": []
                })),
            )
            .expect("valid block");

        assert_eq!(changes["number"], json!(100));
        assert_eq!(changes["hash"], json!("0xabc"));
        assert_eq!(changes["gas_used"], json!("21000"));
        assert_eq!(changes["timestamp"], json!("2024-01-01T00:00:00.000000Z"));
        assert!(!changes.contains_key("uncles"));
    }

    #[test]
    fn strict_rejects_undeclared_fields() {
        let descriptor = DomainKey::Blocks.descriptor();
        let errors = SchemaValidator::strict()
            .validate(
                descriptor,
                &record(json!({"number": 1, "hash": "0x01", "uncles": []})),
            )
            .expect_err("undeclared field");

        assert_eq!(
            errors,
            vec![FieldError::new("uncles", "is not a recognized field")]
        );
    }

    #[test]
    fn reports_every_bad_field() {
        let descriptor = DomainKey::Transactions.descriptor();
        let errors = SchemaValidator::changeset()
            .validate(
                descriptor,
                &record(json!({"hash": "not-hex", "block_number": -4, "value": "1.2.3"})),
            )
            .expect_err("invalid transaction");

        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["hash", "block_number", "value"]);
    }

    #[test]
    fn required_fields_cannot_be_null() {
        let descriptor = DomainKey::Blocks.descriptor();
        let errors = SchemaValidator::changeset()
            .validate(descriptor, &record(json!({"number": null, "hash": "0x1"})))
            .expect_err("null number");
        assert_eq!(errors, vec![FieldError::new("number", "can't be blank")]);
    }

    #[test]
    fn decimal_grammar() {
        assert!(is_decimal("0"));
        assert!(is_decimal("-12.50"));
        assert!(!is_decimal("12."));
        assert!(!is_decimal(".5"));
        assert!(!is_decimal("1e9"));
    }

    #[test]
    fn registry_resolves_builtins() {
        let registry = ValidatorRegistry::new();
        assert!(registry.get(CHANGESET_VALIDATOR).is_some());
        assert!(registry.get(STRICT_VALIDATOR).is_some());
        assert!(registry.get("nope").is_none());
    }
}

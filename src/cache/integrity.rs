//! Integrity Validator
//!
//! Structural checks on decoded payloads. A payload that fails validation is
//! never handed to a caller; the manager deletes the entry and reports a miss.

use serde_json::Value;

use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::error::{Error, Result};

/// Cross-check between a declared count field and a list field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountCheck {
    pub count_field: String,
    pub list_field: String,
}

/// Shape expected of a decoded payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadSchema {
    /// Top-level fields that must be present
    pub required_fields: Vec<String>,
    /// Top-level list fields that must be non-empty
    pub non_empty_lists: Vec<String>,
    /// Declared counts that must match list lengths
    pub count_checks: Vec<CountCheck>,
}

impl PayloadSchema {
    /// Schema that accepts any JSON value
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Schema of a parsed corpus: `musicas` list with matching `totalMusicas`
    pub fn corpus() -> Self {
        Self::permissive()
            .require("musicas")
            .require("totalMusicas")
            .non_empty("musicas")
            .count_of("totalMusicas", "musicas")
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn non_empty(mut self, field: impl Into<String>) -> Self {
        self.non_empty_lists.push(field.into());
        self
    }

    pub fn count_of(mut self, count_field: impl Into<String>, list_field: impl Into<String>) -> Self {
        self.count_checks.push(CountCheck {
            count_field: count_field.into(),
            list_field: list_field.into(),
        });
        self
    }

    /// Whether `value` conforms
    pub fn is_valid(&self, value: &Value) -> bool {
        self.check(value).is_ok()
    }

    /// Validate `value`, naming the first violated rule
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        if self.required_fields.is_empty()
            && self.non_empty_lists.is_empty()
            && self.count_checks.is_empty()
        {
            return Ok(());
        }

        let object = value
            .as_object()
            .ok_or_else(|| "payload is not an object".to_string())?;

        for field in &self.required_fields {
            match object.get(field) {
                None | Some(Value::Null) => return Err(format!("missing field `{}`", field)),
                Some(_) => {}
            }
        }

        for field in &self.non_empty_lists {
            match object.get(field) {
                Some(Value::Array(items)) if !items.is_empty() => {}
                Some(Value::Array(_)) => return Err(format!("list `{}` is empty", field)),
                _ => return Err(format!("`{}` is not a list", field)),
            }
        }

        for check in &self.count_checks {
            let declared = object
                .get(&check.count_field)
                .and_then(Value::as_u64)
                .ok_or_else(|| format!("`{}` is not a count", check.count_field))?;
            let actual = object
                .get(&check.list_field)
                .and_then(Value::as_array)
                .map(Vec::len)
                .ok_or_else(|| format!("`{}` is not a list", check.list_field))?;
            if declared != actual as u64 {
                return Err(format!(
                    "`{}` declares {} but `{}` holds {}",
                    check.count_field, declared, check.list_field, actual
                ));
            }
        }

        Ok(())
    }
}

/// Validates records against the key they were read under, and payloads
/// against a schema
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    schema: PayloadSchema,
}

impl IntegrityValidator {
    pub fn new(schema: PayloadSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &PayloadSchema {
        &self.schema
    }

    /// Record-level checks that do not need the payload decoded
    pub fn validate_record(&self, requested: &CacheKey, entry: &CacheEntry) -> Result<()> {
        if &entry.key != requested {
            return Err(Error::IntegrityViolation {
                key: requested.to_string(),
                reason: format!("record is stored under foreign key {}", entry.key),
            });
        }
        if entry.version.is_empty() {
            return Err(Error::IntegrityViolation {
                key: requested.to_string(),
                reason: "empty version".into(),
            });
        }
        Ok(())
    }

    /// Decode a raw serialized payload and check its shape
    pub fn validate_payload(&self, key: &CacheKey, raw: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| Error::IntegrityViolation {
            key: key.to_string(),
            reason: format!("payload is not valid JSON: {}", e),
        })?;
        self.schema
            .check(&value)
            .map_err(|reason| Error::IntegrityViolation {
                key: key.to_string(),
                reason,
            })?;
        Ok(value)
    }
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self::new(PayloadSchema::corpus())
    }
}

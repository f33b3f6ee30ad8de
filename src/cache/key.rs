//! Cache Key & Version Codec
//!
//! Keys are a pure function of `(logical type, normalized filter)`. Two filters
//! that differ only in list ordering, or in fields that are absent versus
//! explicitly null, map to the same key.
//!
//! Versions are short fingerprints over a bounded sample of the payload. They
//! detect shape drift between releases and are advisory only.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of leading list elements sampled for a version fingerprint
pub const VERSION_SAMPLE_SIZE: usize = 10;

/// Bytes of SHA-256 kept in a cache key (128 bits)
const KEY_HASH_BYTES: usize = 16;

/// Bytes of SHA-256 kept in a version fingerprint
const VERSION_HASH_BYTES: usize = 8;

/// Longest logical-type prefix carried verbatim in a key
const MAX_SLUG_LEN: usize = 48;

/// Domain separator so key hashes never collide with other SHA-256 uses
const KEY_DOMAIN: &[u8] = b"corpus-cache/key/v1";

// =============================================================================
// Filter Descriptor
// =============================================================================

/// Structured subset selection applied to a logical type
///
/// Fields are named values: lists (selected sub-entities), scalars, or nested
/// objects such as a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterDescriptor {
    fields: BTreeMap<String, Value>,
}

impl FilterDescriptor {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self {
                fields: map.into_iter().collect(),
            }),
            Value::Null => Ok(Self::default()),
            other => Err(Error::Config(format!(
                "filter descriptor must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Add a list-valued field
    pub fn with_list<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let list = values.into_iter().map(Into::into).collect();
        self.fields.insert(name.into(), Value::Array(list));
        self
    }

    /// Add a scalar field
    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add an optional scalar; `None` is recorded as null
    pub fn with_optional<V: Into<Value>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        let value = value.map(Into::into).unwrap_or(Value::Null);
        self.with_scalar(name, value)
    }

    /// Add an inclusive date range; open ends are null
    pub fn with_date_range(
        self,
        name: impl Into<String>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Self {
        let mut range = Map::new();
        range.insert("from".into(), date_value(from));
        range.insert("to".into(), date_value(to));
        self.with_scalar(name, Value::Object(range))
    }

    /// Raw value of a field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Canonical form, or `None` when nothing is actually selected
    ///
    /// Lists are sorted and deduplicated, object keys are ordered, and null
    /// or empty fields are dropped.
    pub fn normalized(&self) -> Option<Value> {
        let mut out = Map::new();
        for (name, value) in &self.fields {
            if let Some(v) = normalize_value(value) {
                out.insert(name.clone(), v);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Value::Object(out))
        }
    }

    /// Whether this filter selects a subset (rather than the full dataset)
    pub fn is_effective(&self) -> bool {
        self.normalized().is_some()
    }
}

fn date_value(date: Option<NaiveDate>) -> Value {
    date.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

fn normalize_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().filter_map(normalize_value).collect();
            if normalized.is_empty() {
                return None;
            }
            normalized.sort_by_cached_key(canonical_string);
            normalized.dedup();
            Some(Value::Array(normalized))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                if let Some(v) = normalize_value(&map[k]) {
                    out.insert(k.clone(), v);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        scalar => Some(scalar.clone()),
    }
}

/// Deterministic JSON rendering with object keys in sorted order
fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// Cache Key
// =============================================================================

/// Storage key for one `(logical type, filter)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an existing key string (e.g. one read back from the store)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the storage key for a logical type and optional filter
///
/// The key is `<slug>_<128-bit hex>`: the slug keeps keys readable and
/// filesystem-safe, the hash covers the full type and the normalized filter.
pub fn derive_key(logical_type: &str, filter: Option<&FilterDescriptor>) -> CacheKey {
    let normalized = filter.and_then(FilterDescriptor::normalized);

    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update([0u8]);
    hasher.update(logical_type.as_bytes());
    hasher.update([0u8]);
    match &normalized {
        Some(v) => hasher.update(canonical_string(v).as_bytes()),
        None => hasher.update(b"*"),
    }
    let digest = hasher.finalize();

    CacheKey(format!(
        "{}_{}",
        type_slug(logical_type),
        hex::encode(&digest[..KEY_HASH_BYTES])
    ))
}

/// Filesystem-safe rendering of a logical type
pub fn type_slug(logical_type: &str) -> String {
    let slug: String = logical_type
        .chars()
        .take(MAX_SLUG_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}

// =============================================================================
// Version Fingerprint
// =============================================================================

/// Fingerprint a payload from a bounded structural sample
///
/// Objects contribute their field names, scalar values, and the first
/// [`VERSION_SAMPLE_SIZE`] elements of every list; a top-level list
/// contributes its first elements. Payloads that agree on the sample share a
/// version.
pub fn derive_version(payload: &Value) -> String {
    let sample = match payload {
        Value::Object(map) => {
            let mut sampled = Map::new();
            for (k, v) in map {
                let v = match v {
                    Value::Array(items) => Value::Array(sample_prefix(items)),
                    Value::Object(inner) => {
                        Value::Array(inner.keys().cloned().map(Value::String).collect())
                    }
                    scalar => scalar.clone(),
                };
                sampled.insert(k.clone(), v);
            }
            Value::Object(sampled)
        }
        Value::Array(items) => Value::Array(sample_prefix(items)),
        scalar => scalar.clone(),
    };

    let digest = Sha256::digest(canonical_string(&sample).as_bytes());
    hex::encode(&digest[..VERSION_HASH_BYTES])
}

fn sample_prefix(items: &[Value]) -> Vec<Value> {
    items.iter().take(VERSION_SAMPLE_SIZE).cloned().collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_list_order() {
        let a = FilterDescriptor::new().with_list("artistas", ["b", "a", "c"]);
        let b = FilterDescriptor::new().with_list("artistas", ["c", "b", "a"]);
        assert_eq!(derive_key("gaucho", Some(&a)), derive_key("gaucho", Some(&b)));
    }

    #[test]
    fn test_key_absent_equals_null() {
        let a = FilterDescriptor::new()
            .with_list("artistas", ["x"])
            .with_optional("anoInicio", None::<i64>);
        let b = FilterDescriptor::new().with_list("artistas", ["x"]);
        assert_eq!(derive_key("gaucho", Some(&a)), derive_key("gaucho", Some(&b)));
    }

    #[test]
    fn test_empty_filter_is_unfiltered() {
        let empty = FilterDescriptor::new()
            .with_list("artistas", Vec::<String>::new())
            .with_optional("regiao", None::<String>);
        assert!(!empty.is_effective());
        assert_eq!(derive_key("gaucho", Some(&empty)), derive_key("gaucho", None));
    }

    #[test]
    fn test_key_distinguishes_filters_and_types() {
        let a = FilterDescriptor::new().with_list("artistas", ["a"]);
        let b = FilterDescriptor::new().with_list("artistas", ["b"]);
        let c = FilterDescriptor::new().with_list("musicas", ["a"]);
        let keys = [
            derive_key("gaucho", Some(&a)),
            derive_key("gaucho", Some(&b)),
            derive_key("gaucho", Some(&c)),
            derive_key("gaucho", None),
            derive_key("nordestino", Some(&a)),
        ];
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "collision between {} and {}", i, j);
            }
        }
    }

    #[test]
    fn test_key_format() {
        let key = derive_key("Corpus Gaúcho", None);
        let (slug, hash) = key.as_str().rsplit_once('_').unwrap();
        assert!(slug.starts_with("corpus_ga"));
        assert_eq!(hash.len(), KEY_HASH_BYTES * 2);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn test_date_range_normalization() {
        let from = NaiveDate::from_ymd_opt(1990, 1, 1);
        let a = FilterDescriptor::new().with_date_range("periodo", from, None);
        let b = FilterDescriptor::from_json(json!({"periodo": {"to": null, "from": "1990-01-01"}}))
            .unwrap();
        assert_eq!(derive_key("gaucho", Some(&a)), derive_key("gaucho", Some(&b)));
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(FilterDescriptor::from_json(json!([1, 2])).is_err());
        assert!(FilterDescriptor::from_json(Value::Null).unwrap().normalized().is_none());
    }

    #[test]
    fn test_version_samples_prefix_only() {
        let base: Vec<Value> = (0..50).map(|i| json!({"id": i})).collect();
        let mut tail_changed = base.clone();
        tail_changed[40] = json!({"id": "changed"});
        let mut head_changed = base.clone();
        head_changed[0] = json!({"id": "changed"});

        let v1 = derive_version(&json!({"musicas": base, "totalMusicas": 50}));
        let v2 = derive_version(&json!({"musicas": tail_changed, "totalMusicas": 50}));
        let v3 = derive_version(&json!({"musicas": head_changed, "totalMusicas": 50}));

        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert_eq!(v1.len(), VERSION_HASH_BYTES * 2);
    }

    #[test]
    fn test_version_is_deterministic() {
        let payload = json!({"b": [1, 2], "a": "x"});
        assert_eq!(derive_version(&payload), derive_version(&payload.clone()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_key_invariant_under_permutation(
            mut items in prop::collection::vec("[a-z]{1,8}", 1..12),
            seed in any::<u64>(),
        ) {
            let original = FilterDescriptor::new().with_list("artistas", items.clone());
            // Deterministic shuffle driven by the seed
            let len = items.len();
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                items.swap(i, j);
            }
            let permuted = FilterDescriptor::new().with_list("artistas", items);
            prop_assert_eq!(
                derive_key("gaucho", Some(&original)),
                derive_key("gaucho", Some(&permuted))
            );
        }

        #[test]
        fn prop_distinct_selections_distinct_keys(
            a in prop::collection::btree_set("[a-z]{1,6}", 1..6),
            b in prop::collection::btree_set("[a-z]{1,6}", 1..6),
        ) {
            prop_assume!(a != b);
            let fa = FilterDescriptor::new().with_list("artistas", a);
            let fb = FilterDescriptor::new().with_list("artistas", b);
            prop_assert_ne!(derive_key("gaucho", Some(&fa)), derive_key("gaucho", Some(&fb)));
        }
    }
}

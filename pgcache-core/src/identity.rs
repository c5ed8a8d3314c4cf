//! Cache keys, invalidation tags and call signatures.
//!
//! A [`CacheKey`] identifies one memoized call, a [`Tag`] identifies a group
//! of keys that are dropped together. Both are plain strings on the wire so
//! they can live in any key/value store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic memoization identity of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Invalidation group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Derive the invalidation tag for a method, optionally narrowed to a table.
///
/// `tag_for("OrderService", "get_order", None)` is `OrderService:get_order`;
/// with `Some("orders")` it becomes `OrderService:get_order:orders`.
pub fn tag_for(class: &str, method: &str, discriminator: Option<&str>) -> Tag {
    match discriminator {
        Some(d) => Tag(format!("{}:{}:{}", class, method, d)),
        None => Tag(format!("{}:{}", class, method)),
    }
}

/// Compute the cache key of a call.
///
/// The key is `{class}:{method}:{digest}` where the digest is the SHA-256 of
/// the canonical JSON encoding of `[class, method, args]`. Object keys are
/// sorted during encoding, so the result does not depend on map insertion
/// order, process, or call order.
pub fn signature(class: &str, method: &str, args: &Value) -> CacheKey {
    let mut canonical = String::new();
    write_canonical(
        &Value::Array(vec![
            Value::String(class.to_string()),
            Value::String(method.to_string()),
            args.clone(),
        ]),
        &mut canonical,
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    CacheKey(format!("{}:{}:{}", class, method, digest))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a string cannot fail.
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_tag_for_shapes() {
        assert_eq!(tag_for("Svc", "list", None).as_str(), "Svc:list");
        assert_eq!(
            tag_for("Svc", "list", Some("orders")).as_str(),
            "Svc:list:orders"
        );
    }

    #[test]
    fn test_signature_has_readable_head() {
        let key = signature("OrderService", "get_order", &json!([7]));
        assert!(key.as_str().starts_with("OrderService:get_order:"));
        // 64 hex chars of SHA-256 after the head
        let digest = key.as_str().rsplit(':').next().unwrap();
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_signature_ignores_object_key_order() {
        let mut a = serde_json::Map::new();
        a.insert("b".into(), json!(2));
        a.insert("a".into(), json!(1));
        let mut b = serde_json::Map::new();
        b.insert("a".into(), json!(1));
        b.insert("b".into(), json!(2));

        assert_eq!(
            signature("S", "m", &Value::Object(a)),
            signature("S", "m", &Value::Object(b))
        );
    }

    #[test]
    fn test_signature_separates_class_and_method() {
        let args = json!([1]);
        assert_ne!(signature("S", "a", &args), signature("S", "b", &args));
        assert_ne!(signature("S", "a", &args), signature("T", "a", &args));
    }

    #[test]
    fn test_signature_distinguishes_string_from_number() {
        assert_ne!(
            signature("S", "m", &json!(["7"])),
            signature("S", "m", &json!([7]))
        );
    }

    proptest! {
        #[test]
        fn prop_signature_deterministic(args in proptest::collection::vec(any::<i64>(), 0..6)) {
            let value = json!(args);
            prop_assert_eq!(signature("S", "m", &value), signature("S", "m", &value.clone()));
        }

        #[test]
        fn prop_signature_distinct_args_distinct_keys(
            a in proptest::collection::vec(any::<i64>(), 0..6),
            b in proptest::collection::vec(any::<i64>(), 0..6),
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(signature("S", "m", &json!(a)), signature("S", "m", &json!(b)));
        }
    }
}

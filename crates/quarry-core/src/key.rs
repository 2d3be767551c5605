//! Cache key derivation.
//!
//! A cache key is `endpoint(args)` where `args` is rendered as canonical JSON:
//! object keys sorted at every depth, no whitespace. Equal arguments always
//! render to the same text regardless of how the caller built them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of a query cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Signature of a key serializer: `(endpoint name, arguments) -> key`.
pub type SerializeQueryArgs = Arc<dyn Fn(&str, &Value) -> CacheKey + Send + Sync>;

/// Maps endpoint arguments to cache keys.
#[derive(Clone)]
pub struct KeyCodec {
    serialize: SerializeQueryArgs,
}

impl KeyCodec {
    /// Use a caller-supplied serializer instead of the canonical one.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &Value) -> CacheKey + Send + Sync + 'static,
    {
        Self {
            serialize: Arc::new(f),
        }
    }

    pub fn key(&self, endpoint: &str, args: &Value) -> CacheKey {
        (self.serialize)(endpoint, args)
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self {
            serialize: Arc::new(default_serialize_query_args),
        }
    }
}

impl fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCodec").finish_non_exhaustive()
    }
}

/// The canonical key serializer.
pub fn default_serialize_query_args(endpoint: &str, args: &Value) -> CacheKey {
    let mut out = String::with_capacity(endpoint.len() + 16);
    out.push_str(endpoint);
    out.push('(');
    write_canonical(args, &mut out);
    out.push(')');
    CacheKey(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Value's Display escapes the key the same way serde_json does
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
    use test_case::test_case;

    #[test_case(json!(null), "getCount(null)" ; "null args")]
    #[test_case(json!(1), "getCount(1)" ; "number")]
    #[test_case(json!("a\"b"), r#"getCount("a\"b")"# ; "escaped string")]
    #[test_case(json!({"b": 1, "a": [2, {"d": 3, "c": 4}]}), r#"getCount({"a":[2,{"c":4,"d":3}],"b":1})"# ; "nested object")]
    fn test_default_key_shape(args: Value, expected: &str) {
        assert_eq!(default_serialize_query_args("getCount", &args).as_str(), expected);
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"page": 2, "filter": {"tag": "x", "author": 7}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"filter": {"author": 7, "tag": "x"}, "page": 2}"#).unwrap();
        assert_eq!(
            default_serialize_query_args("list", &a),
            default_serialize_query_args("list", &b)
        );
    }

    #[test]
    fn test_distinct_endpoints_do_not_collide() {
        let args = json!({"id": 1});
        assert_ne!(
            default_serialize_query_args("getUser", &args),
            default_serialize_query_args("getPost", &args)
        );
    }

    #[test]
    fn test_custom_codec() {
        let codec = KeyCodec::custom(|endpoint, args| {
            CacheKey::new(format!("{endpoint}/{}", args["id"]))
        });
        assert_eq!(codec.key("getUser", &json!({"id": 5, "x": 1})).as_str(), "getUser/5");
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{0,6}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-d]{1,2}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_keys_equal_iff_args_equal(a in arb_json(), b in arb_json()) {
            let ka = default_serialize_query_args("e", &a);
            let kb = default_serialize_query_args("e", &b);
            prop_assert_eq!(ka == kb, a == b);
        }
    }
}

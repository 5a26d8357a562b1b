//! Per-index data fixups applied between extract and load.
//!
//! Each transformer is a pure function over one decoded JSON object. Lookup
//! miss falls back to the identity transformer. None of these may fail on
//! missing fields -- the shapes they reach into are all optional.

use serde_json::Value;

pub trait Transformer: Send + Sync {
    fn transform(&self, value: Value) -> Value;
}

pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn transform(&self, value: Value) -> Value {
        value
    }
}

/// Drops `pubKeyBitmap` at the top level, and `reserved` inside every
/// `epochStartShardsData[*].pendingMiniBlockHeaders[*]`.
pub struct BlocksTransformer;

impl Transformer for BlocksTransformer {
    fn transform(&self, mut value: Value) -> Value {
        if let Some(obj) = value.as_object_mut() {
            obj.remove("pubKeyBitmap");

            if let Some(shards) = obj.get_mut("epochStartShardsData").and_then(Value::as_array_mut) {
                for shard in shards {
                    if let Some(headers) = shard
                        .get_mut("pendingMiniBlockHeaders")
                        .and_then(Value::as_array_mut)
                    {
                        for header in headers {
                            if let Some(header_obj) = header.as_object_mut() {
                                header_obj.remove("reserved");
                            }
                        }
                    }
                }
            }
        }
        value
    }
}

/// Drops every top-level field whose name begins with `nft_` or `api_`.
pub struct TokensTransformer;

impl Transformer for TokensTransformer {
    fn transform(&self, mut value: Value) -> Value {
        if let Some(obj) = value.as_object_mut() {
            obj.retain(|key, _| !key.starts_with("nft_") && !key.starts_with("api_"));
        }
        value
    }
}

/// Replaces null elements of `events[*].topics` and `events[*].additionalData`
/// with empty strings, since the warehouse rejects nulls inside repeated
/// fields.
pub struct LogsTransformer;

impl Transformer for LogsTransformer {
    fn transform(&self, mut value: Value) -> Value {
        if let Some(events) = value
            .as_object_mut()
            .and_then(|obj| obj.get_mut("events"))
            .and_then(Value::as_array_mut)
        {
            for event in events {
                if let Some(event_obj) = event.as_object_mut() {
                    normalize_repeated_field(event_obj, "topics");
                    normalize_repeated_field(event_obj, "additionalData");
                }
            }
        }
        value
    }
}

fn normalize_repeated_field(obj: &mut serde_json::Map<String, Value>, field: &str) {
    if let Some(array) = obj.get_mut(field).and_then(Value::as_array_mut) {
        for element in array.iter_mut() {
            if element.is_null() {
                *element = Value::String(String::new());
            }
        }
    }
}

/// Registry keyed by index name. Lookup miss returns the identity
/// transformer, so unknown indices round-trip unmodified.
pub struct TransformerRegistry {
    identity: IdentityTransformer,
    by_index: std::collections::HashMap<&'static str, Box<dyn Transformer>>,
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        let mut by_index: std::collections::HashMap<&'static str, Box<dyn Transformer>> =
            std::collections::HashMap::new();
        by_index.insert("blocks", Box::new(BlocksTransformer));
        by_index.insert("tokens", Box::new(TokensTransformer));
        by_index.insert("logs", Box::new(LogsTransformer));

        Self {
            identity: IdentityTransformer,
            by_index,
        }
    }
}

impl TransformerRegistry {
    pub fn get(&self, index_name: &str) -> &dyn Transformer {
        match self.by_index.get(index_name) {
            Some(transformer) => transformer.as_ref(),
            None => &self.identity,
        }
    }
}

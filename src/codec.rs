//! Encoding and decoding of values exchanged with the job store.
//!
//! Every value the engine touches is a self-describing [`serde_json::Value`]
//! tree. Primitives and containers map to their natural JSON shapes; any
//! richer type is encoded as a *typed object*: a JSON map carrying
//! `"@module"` and `"@class"` discriminators alongside the object's fields.
//! [`OutputReference`](crate::reference::OutputReference) and the blob
//! marker used by the multi-store router are both typed objects.
//!
//! Decoding is driven by an [`ObjectRegistry`]: each registered
//! `(module, class)` pair owns a hook that validates and normalizes the
//! tagged map. Tagged maps for unregistered classes pass through untouched
//! as opaque mappings.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// JSON object type used for keyword arguments, metadata, and typed-object
/// fields throughout the crate.
pub type JsonMap = serde_json::Map<String, Value>;

/// Key carrying the module discriminator of a typed object.
pub const MODULE_KEY: &str = "@module";
/// Key carrying the class discriminator of a typed object.
pub const CLASS_KEY: &str = "@class";
/// Module id under which the engine's own typed objects are registered.
pub const ENGINE_MODULE: &str = "jobflow";

/// Errors raised while encoding or decoding value trees.
#[derive(Debug, Error, Diagnostic)]
pub enum SerializationError {
    /// A value could not be converted into a JSON tree.
    #[error("value of type {type_name} could not be encoded: {source}")]
    #[diagnostic(
        code(jobflow::codec::encode),
        help("Job inputs and outputs must serialize to a JSON tree.")
    )]
    Encode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A tagged map did not match the shape its registered class requires.
    #[error("malformed {class} object: {reason}")]
    #[diagnostic(code(jobflow::codec::decode))]
    Decode { class: String, reason: String },
}

/// Encode any serializable value into the engine's tree format.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, SerializationError> {
    serde_json::to_value(value).map_err(|source| SerializationError::Encode {
        type_name: std::any::type_name::<T>(),
        source,
    })
}

/// Read the `(@module, @class)` discriminators of a tagged map, if present.
pub fn class_of(value: &Value) -> Option<(&str, &str)> {
    let map = value.as_object()?;
    let module = map.get(MODULE_KEY)?.as_str()?;
    let class = map.get(CLASS_KEY)?.as_str()?;
    Some((module, class))
}

/// Whether `value` is a typed object with the given discriminators.
pub fn is_class(value: &Value, module: &str, class: &str) -> bool {
    class_of(value) == Some((module, class))
}

type DecodeHook = Arc<dyn Fn(&JsonMap) -> Result<Value, SerializationError> + Send + Sync>;

/// Registry mapping typed-object discriminators to decode hooks.
///
/// A hook receives the tagged map (with already-decoded children) and
/// returns the re-hydrated value, normally the same map after shape
/// validation. Unknown `(module, class)` pairs are not an error; they
/// decode as opaque mappings.
#[derive(Clone, Default)]
pub struct ObjectRegistry {
    hooks: FxHashMap<(String, String), DecodeHook>,
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("classes", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObjectRegistry {
    /// An empty registry with no recognized classes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the engine's own typed objects:
    /// `OutputReference` and the blob marker.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ENGINE_MODULE, crate::reference::REFERENCE_CLASS, |map| {
            crate::reference::OutputReference::validate_wire(map)?;
            Ok(Value::Object(map.clone()))
        });
        registry.register(ENGINE_MODULE, crate::store::BLOB_CLASS, |map| {
            crate::store::BlobMarker::validate_wire(map)?;
            Ok(Value::Object(map.clone()))
        });
        registry
    }

    /// Register a decode hook for a `(module, class)` pair.
    pub fn register<F>(&mut self, module: &str, class: &str, hook: F)
    where
        F: Fn(&JsonMap) -> Result<Value, SerializationError> + Send + Sync + 'static,
    {
        self.hooks
            .insert((module.to_string(), class.to_string()), Arc::new(hook));
    }

    /// Whether the registry recognizes the given discriminators.
    #[must_use]
    pub fn is_registered(&self, module: &str, class: &str) -> bool {
        self.hooks
            .contains_key(&(module.to_string(), class.to_string()))
    }

    /// Walk a tree and apply decode hooks to every registered tagged map.
    ///
    /// Children are decoded before their enclosing object so hooks always
    /// see fully decoded fields. Unregistered tagged maps and all other
    /// values are returned unchanged.
    pub fn decode_tree(&self, tree: &Value) -> Result<Value, SerializationError> {
        match tree {
            Value::Object(map) => {
                let mut decoded = JsonMap::new();
                for (k, v) in map {
                    decoded.insert(k.clone(), self.decode_tree(v)?);
                }
                let decoded = Value::Object(decoded);
                if let Some((module, class)) = class_of(&decoded) {
                    if let Some(hook) = self.hooks.get(&(module.to_string(), class.to_string())) {
                        let map = decoded
                            .as_object()
                            .cloned()
                            .unwrap_or_default();
                        return hook(&map);
                    }
                }
                Ok(decoded)
            }
            Value::Array(items) => {
                let decoded = items
                    .iter()
                    .map(|v| self.decode_tree(v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(decoded))
            }
            other => Ok(other.clone()),
        }
    }
}

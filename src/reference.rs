//! Late-bound references to job outputs and their resolution machinery.
//!
//! An [`OutputReference`] is a lazy handle `(uuid, path)` into the output of
//! a job that may not have run yet. Building one never evaluates anything:
//! [`attr`](OutputReference::attr) and [`index`](OutputReference::index)
//! each return a *new* reference with the access appended to the path.
//! References embed themselves into argument trees in their typed-object
//! wire form, which is how the engine derives the job dependency graph and
//! how the resolver finds them again at run time.
//!
//! Resolution queries the [`JobStore`](crate::store::JobStore) for the
//! referenced output (highest index wins), applies the recorded path, and
//! splices the value back into the tree. Within one resolution pass each
//! uuid is fetched at most once.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{self, JsonMap, SerializationError, CLASS_KEY, ENGINE_MODULE, MODULE_KEY};
use crate::store::{GetOutputError, JobStore, Load, StoreError, Which};
use crate::utils::find::find_key_value;

/// Class discriminator of a reference in its wire form.
pub const REFERENCE_CLASS: &str = "OutputReference";

/// What resolution does when a referenced output cannot be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Fail with [`ReferenceResolutionError::MissingOutput`].
    #[default]
    Error,
    /// Substitute `null` for the unresolved reference.
    None,
    /// Leave the reference in place, unresolved.
    Pass,
}

/// One recorded access on a reference: an attribute lookup or an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathComponent {
    /// Key lookup on a mapping, recorded as `["a", name]` on the wire.
    Attr(String),
    /// Positional lookup on a sequence, recorded as `["i", index]`.
    Index(usize),
}

impl Serialize for PathComponent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathComponent::Attr(name) => ("a", name).serialize(serializer),
            PathComponent::Index(idx) => ("i", idx).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PathComponent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, value): (String, Value) = Deserialize::deserialize(deserializer)?;
        match tag.as_str() {
            "a" => value
                .as_str()
                .map(|s| PathComponent::Attr(s.to_string()))
                .ok_or_else(|| serde::de::Error::custom("attribute access requires a string")),
            "i" => value
                .as_u64()
                .map(|i| PathComponent::Index(i as usize))
                .ok_or_else(|| serde::de::Error::custom("index access requires an integer")),
            other => Err(serde::de::Error::custom(format!(
                "unrecognised path component tag '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for PathComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathComponent::Attr(name) => write!(f, ".{name}"),
            PathComponent::Index(idx) => write!(f, "[{idx}]"),
        }
    }
}

/// A lazy handle into the (possibly not yet computed) output of a job.
///
/// Equality and hashing are structural over the uuid and path; the optional
/// source-store routing hints do not participate.
///
/// # Examples
///
/// ```
/// use jobflow::reference::OutputReference;
/// use uuid::Uuid;
///
/// let uuid = Uuid::new_v4();
/// let reference = OutputReference::new(uuid).attr("x").index(1);
/// assert_eq!(reference.to_string(), format!("OutputReference({uuid}, .x, [1])"));
/// ```
#[derive(Debug, Clone)]
pub struct OutputReference {
    uuid: Uuid,
    attributes: Vec<PathComponent>,
    source_stores: Vec<String>,
}

impl PartialEq for OutputReference {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.attributes == other.attributes
    }
}

impl Eq for OutputReference {}

impl std::hash::Hash for OutputReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
        self.attributes.hash(state);
    }
}

impl std::fmt::Display for OutputReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutputReference({}", self.uuid)?;
        for component in &self.attributes {
            write!(f, ", {component}")?;
        }
        write!(f, ")")
    }
}

impl OutputReference {
    /// A reference to the whole output of the job with the given uuid.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            attributes: Vec::new(),
            source_stores: Vec::new(),
        }
    }

    /// A reference with an explicit access path.
    #[must_use]
    pub fn with_path(uuid: Uuid, attributes: Vec<PathComponent>) -> Self {
        Self {
            uuid,
            attributes,
            source_stores: Vec::new(),
        }
    }

    /// A new reference with an attribute access appended. No evaluation.
    #[must_use]
    pub fn attr(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.attributes.push(PathComponent::Attr(name.into()));
        next
    }

    /// A new reference with an index access appended. No evaluation.
    #[must_use]
    pub fn index(&self, idx: usize) -> Self {
        let mut next = self.clone();
        next.attributes.push(PathComponent::Index(idx));
        next
    }

    /// A copy of this reference routed through the named auxiliary stores
    /// when its output is loaded.
    #[must_use]
    pub fn with_source_stores(mut self, stores: impl IntoIterator<Item = String>) -> Self {
        self.source_stores = stores.into_iter().collect();
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn path(&self) -> &[PathComponent] {
        &self.attributes
    }

    pub fn source_stores(&self) -> &[String] {
        &self.source_stores
    }

    /// Point this reference at a different job.
    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    /// The typed-object wire form of this reference.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = JsonMap::new();
        map.insert(MODULE_KEY.into(), Value::String(ENGINE_MODULE.into()));
        map.insert(CLASS_KEY.into(), Value::String(REFERENCE_CLASS.into()));
        map.insert("uuid".into(), Value::String(self.uuid.to_string()));
        map.insert(
            "attributes".into(),
            Value::Array(
                self.attributes
                    .iter()
                    .map(|c| match c {
                        PathComponent::Attr(name) => {
                            Value::Array(vec![Value::String("a".into()), Value::String(name.clone())])
                        }
                        PathComponent::Index(idx) => {
                            Value::Array(vec![Value::String("i".into()), Value::from(*idx)])
                        }
                    })
                    .collect(),
            ),
        );
        if !self.source_stores.is_empty() {
            map.insert(
                "source_stores".into(),
                Value::Array(
                    self.source_stores
                        .iter()
                        .map(|s| Value::String(s.clone()))
                        .collect(),
                ),
            );
        }
        Value::Object(map)
    }

    /// Whether a tree node is a reference in wire form.
    #[must_use]
    pub fn is_reference(value: &Value) -> bool {
        codec::is_class(value, ENGINE_MODULE, REFERENCE_CLASS)
    }

    /// Rehydrate a reference from its wire form.
    pub fn from_value(value: &Value) -> Result<Self, SerializationError> {
        serde_json::from_value(value.clone()).map_err(|e| SerializationError::Decode {
            class: REFERENCE_CLASS.into(),
            reason: e.to_string(),
        })
    }

    /// Validate the shape of a tagged map claiming to be a reference.
    pub fn validate_wire(map: &JsonMap) -> Result<(), SerializationError> {
        Self::from_value(&Value::Object(map.clone())).map(|_| ())
    }

    /// Resolve this single reference against a store.
    ///
    /// Prefer [`resolve_references`] when resolving several references at
    /// once; it fetches each uuid only once.
    pub async fn resolve(
        &self,
        store: &JobStore,
        cache: &mut ResolutionCache,
        on_missing: OnMissing,
    ) -> Result<Value, ReferenceResolutionError> {
        let resolved = resolve_references(std::slice::from_ref(self), store, cache, on_missing).await?;
        Ok(resolved
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .unwrap_or(Value::Null))
    }
}

#[derive(Deserialize)]
struct ReferenceWire {
    #[serde(rename = "@module")]
    module: String,
    #[serde(rename = "@class")]
    class: String,
    uuid: Uuid,
    #[serde(default)]
    attributes: Vec<PathComponent>,
    #[serde(default)]
    source_stores: Vec<String>,
}

impl Serialize for OutputReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OutputReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ReferenceWire::deserialize(deserializer)?;
        if wire.module != ENGINE_MODULE || wire.class != REFERENCE_CLASS {
            return Err(serde::de::Error::custom(format!(
                "expected an {ENGINE_MODULE}/{REFERENCE_CLASS} object, found {}/{}",
                wire.module, wire.class
            )));
        }
        Ok(OutputReference {
            uuid: wire.uuid,
            attributes: wire.attributes,
            source_stores: wire.source_stores,
        })
    }
}

/// Errors raised while resolving references against a store.
#[derive(Debug, Error, Diagnostic)]
pub enum ReferenceResolutionError {
    /// The referenced uuid has no output in the store or cache.
    #[error("could not resolve {reference}: no output for {uuid} in store or cache")]
    #[diagnostic(
        code(jobflow::reference::missing_output),
        help("The referenced job has not run yet or its output was removed.")
    )]
    MissingOutput { uuid: Uuid, reference: String },

    /// A path component could not be applied to the stored value.
    #[error("path step {step} of {reference} does not apply to the stored output")]
    #[diagnostic(
        code(jobflow::reference::path),
        help("Check that the referenced job's output has the accessed shape.")
    )]
    PathStep {
        uuid: Uuid,
        reference: String,
        step: usize,
    },

    /// A stored output refers back to its own uuid.
    #[error("reference cycle detected while resolving output of {uuid}")]
    #[diagnostic(code(jobflow::reference::cycle))]
    Cycle { uuid: Uuid },

    /// The underlying store failed.
    #[error(transparent)]
    #[diagnostic(code(jobflow::reference::store))]
    Store(#[from] StoreError),

    /// A reference in the tree could not be rehydrated.
    #[error(transparent)]
    #[diagnostic(code(jobflow::reference::serialization))]
    Serialization(#[from] SerializationError),
}

/// Per-call cache of fetched outputs, keyed by uuid.
pub type ResolutionCache = FxHashMap<Uuid, Value>;

/// Extract every reference reachable inside a tree.
///
/// Total over nested maps, sequences, and typed-object fields: any node in
/// wire form is reported, wherever it sits.
pub fn find_and_get_references(tree: &Value) -> Vec<OutputReference> {
    if OutputReference::is_reference(tree) {
        return OutputReference::from_value(tree).into_iter().collect();
    }
    let class_marker = Value::String(REFERENCE_CLASS.into());
    find_key_value(tree, CLASS_KEY, &class_marker)
        .into_iter()
        .filter_map(|path| crate::utils::find::get_at(tree, &path))
        .filter(|node| OutputReference::is_reference(node))
        .filter_map(|node| OutputReference::from_value(node).ok())
        .collect()
}

/// Replace every reference in a tree using a caller-supplied resolver.
///
/// The resolver is consulted once per distinct reference; repeated
/// occurrences reuse the memoized value. Traversal order is unspecified.
pub fn resolve_refs_with<F>(tree: &Value, resolver: &mut F) -> Result<Value, ReferenceResolutionError>
where
    F: FnMut(&OutputReference) -> Result<Value, ReferenceResolutionError>,
{
    let mut memo: FxHashMap<OutputReference, Value> = FxHashMap::default();
    substitute(tree, resolver, &mut memo)
}

fn substitute<F>(
    tree: &Value,
    resolver: &mut F,
    memo: &mut FxHashMap<OutputReference, Value>,
) -> Result<Value, ReferenceResolutionError>
where
    F: FnMut(&OutputReference) -> Result<Value, ReferenceResolutionError>,
{
    if OutputReference::is_reference(tree) {
        let reference = OutputReference::from_value(tree)?;
        if let Some(hit) = memo.get(&reference) {
            return Ok(hit.clone());
        }
        let value = resolver(&reference)?;
        memo.insert(reference, value.clone());
        return Ok(value);
    }
    match tree {
        Value::Object(map) => {
            let mut out = JsonMap::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, resolver, memo)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| substitute(v, resolver, memo))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

/// Apply a reference's recorded path to a fetched output value.
pub fn apply_path(
    reference: &OutputReference,
    value: &Value,
) -> Result<Value, ReferenceResolutionError> {
    let mut current = value;
    for (step, component) in reference.path().iter().enumerate() {
        let next = match component {
            PathComponent::Attr(name) => current.get(name.as_str()),
            PathComponent::Index(idx) => current.get(*idx),
        };
        current = next.ok_or_else(|| ReferenceResolutionError::PathStep {
            uuid: reference.uuid(),
            reference: reference.to_string(),
            step,
        })?;
    }
    Ok(current.clone())
}

/// Resolve a batch of references, fetching each distinct uuid only once.
///
/// Returns a map from reference to resolved value. Under
/// [`OnMissing::None`] missing outputs resolve to `null`; under
/// [`OnMissing::Pass`] the reference resolves to its own wire form,
/// leaving it in place when substituted back into a tree.
pub async fn resolve_references(
    references: &[OutputReference],
    store: &JobStore,
    cache: &mut ResolutionCache,
    on_missing: OnMissing,
) -> Result<FxHashMap<OutputReference, Value>, ReferenceResolutionError> {
    let mut by_uuid: FxHashMap<Uuid, Vec<&OutputReference>> = FxHashMap::default();
    for reference in references {
        by_uuid.entry(reference.uuid()).or_default().push(reference);
    }

    let mut resolved: FxHashMap<OutputReference, Value> = FxHashMap::default();
    for (uuid, group) in by_uuid {
        if !cache.contains_key(&uuid) {
            match store.get_output(uuid, Which::Last, &load_for(&group)).await {
                Ok(output) => {
                    cache.insert(uuid, output);
                }
                Err(GetOutputError::NotFound(_)) => {}
                Err(GetOutputError::Cycle { uuid }) => {
                    return Err(ReferenceResolutionError::Cycle { uuid })
                }
                Err(GetOutputError::Store(e)) => return Err(e.into()),
                Err(GetOutputError::Serialization(e)) => return Err(e.into()),
            }
        }

        match cache.get(&uuid) {
            Some(output) => {
                for reference in group {
                    resolved.insert(reference.clone(), apply_path(reference, output)?);
                }
            }
            None => match on_missing {
                OnMissing::Error => {
                    let reference = group[0];
                    return Err(ReferenceResolutionError::MissingOutput {
                        uuid,
                        reference: reference.to_string(),
                    });
                }
                OnMissing::None => {
                    for reference in group {
                        resolved.insert(reference.clone(), Value::Null);
                    }
                }
                OnMissing::Pass => {
                    for reference in group {
                        resolved.insert(reference.clone(), reference.to_value());
                    }
                }
            },
        }
    }
    Ok(resolved)
}

/// Resolve every reference inside a tree against a store.
///
/// The returned tree is the input with each reference replaced according
/// to `on_missing`. Trees without references are returned unchanged.
pub async fn find_and_resolve_references(
    tree: &Value,
    store: &JobStore,
    cache: &mut ResolutionCache,
    on_missing: OnMissing,
) -> Result<Value, ReferenceResolutionError> {
    let references = find_and_get_references(tree);
    if references.is_empty() {
        return Ok(tree.clone());
    }
    let resolved = resolve_references(&references, store, cache, on_missing).await?;
    resolve_refs_with(tree, &mut |reference| {
        resolved
            .get(reference)
            .cloned()
            .ok_or_else(|| ReferenceResolutionError::MissingOutput {
                uuid: reference.uuid(),
                reference: reference.to_string(),
            })
    })
}

fn load_for(group: &[&OutputReference]) -> Load {
    let mut stores: Vec<String> = Vec::new();
    for reference in group {
        if reference.source_stores().is_empty() {
            return Load::All;
        }
        for name in reference.source_stores() {
            if !stores.contains(name) {
                stores.push(name.clone());
            }
        }
    }
    Load::Stores(stores)
}

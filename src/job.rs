//! Deferred function calls: the atomic unit of work.
//!
//! A [`Job`] is a suspended invocation of a [`JobFunction`]: the callable,
//! its positional and keyword arguments (which may contain
//! [`OutputReference`]s arbitrarily nested inside maps and sequences), and
//! the configuration governing how the scheduler treats it. Jobs are built
//! by user code, composed into [`Flow`](crate::flow::Flow)s, and run only
//! by the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::codec::JsonMap;
use crate::reference::{
    find_and_get_references, find_and_resolve_references, OnMissing, OutputReference,
    ReferenceResolutionError, ResolutionCache,
};
use crate::response::Response;
use crate::schema::{OutputSchema, SchemaViolationError};
use crate::store::{JobStore, SaveRequest, StoreError};

/// What a job body hands back to the engine.
#[derive(Debug, Clone)]
pub enum JobReturns {
    /// A plain output value; wrapped as `Response { output, .. }`.
    Value(Value),
    /// A full response, used verbatim.
    Response(Response),
}

impl From<Value> for JobReturns {
    fn from(value: Value) -> Self {
        JobReturns::Value(value)
    }
}

impl From<Response> for JobReturns {
    fn from(response: Response) -> Self {
        JobReturns::Response(response)
    }
}

/// Errors a job body may raise.
///
/// These are recorded against the raising job; they do not abort the rest
/// of the flow.
#[derive(Debug, Error, Diagnostic)]
pub enum JobFunctionError {
    /// An expected argument is absent or null.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(jobflow::job::missing_input),
        help("Check the arguments the job was constructed with.")
    )]
    MissingInput { what: &'static str },

    /// An argument is present but unusable.
    #[error("invalid input: {0}")]
    #[diagnostic(code(jobflow::job::invalid_input))]
    InvalidInput(String),

    /// JSON (de)serialization inside the body failed.
    #[error(transparent)]
    #[diagnostic(code(jobflow::job::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Any other failure of the body.
    #[error("{0}")]
    #[diagnostic(code(jobflow::job::failed))]
    Failed(String),
}

/// The callable behind a job.
///
/// Implementations receive fully resolved arguments (unless the job's
/// config disables resolution) and return either a plain value or a
/// [`Response`] carrying directives.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use jobflow::job::{JobFunction, JobFunctionError, JobReturns};
/// use jobflow::codec::JsonMap;
/// use serde_json::{json, Value};
///
/// struct Add;
///
/// #[async_trait]
/// impl JobFunction for Add {
///     async fn call(&self, args: &[Value], _kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
///         let total: f64 = args.iter().filter_map(Value::as_f64).sum();
///         Ok(json!(total).into())
///     }
/// }
/// ```
#[async_trait]
pub trait JobFunction: Send + Sync {
    async fn call(&self, args: &[Value], kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError>;
}

/// Per-job configuration for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobConfig {
    /// Resolve references in the arguments before invoking the body. When
    /// false, reference wire maps are passed through to the body.
    pub resolve_references: bool,
    /// What to do when an argument reference cannot be resolved.
    pub on_missing_references: OnMissing,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            resolve_references: true,
            on_missing_references: OnMissing::Error,
        }
    }
}

/// Errors raised while running one job.
#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolution(#[from] ReferenceResolutionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Function(#[from] JobFunctionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaViolationError),

    /// Persisting the output failed. Treated as fatal by the scheduler.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// A deferred function call with identity `(uuid, index)`.
#[derive(Clone)]
pub struct Job {
    uuid: Uuid,
    index: u32,
    name: String,
    function_name: String,
    function: Arc<dyn JobFunction>,
    args: Vec<Value>,
    kwargs: JsonMap,
    config: JobConfig,
    output_schema: Option<OutputSchema>,
    store_names: FxHashMap<String, String>,
    metadata: JsonMap,
    hosts: Vec<Uuid>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("uuid", &self.uuid)
            .field("index", &self.index)
            .field("name", &self.name)
            .field("function", &self.function_name)
            .finish()
    }
}

impl Job {
    /// A new job around a callable. The name doubles as the stable display
    /// name of the function.
    #[must_use]
    pub fn new(name: impl Into<String>, function: impl JobFunction + 'static) -> Self {
        let name = name.into();
        Self {
            uuid: Uuid::new_v4(),
            index: 1,
            function_name: name.clone(),
            name,
            function: Arc::new(function),
            args: Vec::new(),
            kwargs: JsonMap::new(),
            config: JobConfig::default(),
            output_schema: None,
            store_names: FxHashMap::default(),
            metadata: JsonMap::new(),
            hosts: Vec::new(),
        }
    }

    /// Positional arguments. May contain references anywhere inside.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Keyword arguments. May contain references anywhere inside.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: JsonMap) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Add one keyword argument.
    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Override the display name without changing the function name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Route the output subtree under `key` to the named auxiliary store.
    #[must_use]
    pub fn with_store_name(mut self, key: impl Into<String>, store: impl Into<String>) -> Self {
        self.store_names.insert(key.into(), store.into());
        self
    }

    /// Opaque annotations persisted alongside the output.
    #[must_use]
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn output_schema(&self) -> Option<&OutputSchema> {
        self.output_schema.as_ref()
    }

    pub fn store_names(&self) -> &FxHashMap<String, String> {
        &self.store_names
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }

    /// Enclosing flow uuids, outermost first, innermost last.
    pub fn hosts(&self) -> &[Uuid] {
        &self.hosts
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &JsonMap {
        &self.kwargs
    }

    /// A reference to this job's future output.
    #[must_use]
    pub fn output(&self) -> OutputReference {
        OutputReference::new(self.uuid)
    }

    /// Replace this job's uuid. Valid only before the job is scheduled; the
    /// derived [`output`](Self::output) reference follows automatically.
    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    pub(crate) fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    pub(crate) fn prepend_hosts(&mut self, hosts: &[Uuid]) {
        let mut combined = hosts.to_vec();
        combined.extend(self.hosts.iter().copied());
        self.hosts = combined;
    }

    pub(crate) fn merge_metadata(&mut self, metadata: &JsonMap) {
        for (k, v) in metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }

    pub(crate) fn inherit_schema(&mut self, schema: Option<&OutputSchema>) {
        if self.output_schema.is_none() {
            self.output_schema = schema.cloned();
        }
    }

    /// Every reference reachable in the positional and keyword arguments.
    #[must_use]
    pub fn input_references(&self) -> Vec<OutputReference> {
        let mut references = Vec::new();
        for arg in &self.args {
            references.extend(find_and_get_references(arg));
        }
        for value in self.kwargs.values() {
            references.extend(find_and_get_references(value));
        }
        references
    }

    /// Distinct uuids of the jobs this one depends on.
    #[must_use]
    pub fn input_uuids(&self) -> FxHashSet<Uuid> {
        self.input_references()
            .iter()
            .map(OutputReference::uuid)
            .collect()
    }

    /// Recursively rewrite keyword arguments matching a predicate.
    ///
    /// The predicate sees `(key, value)` for every entry of every nested
    /// mapping inside the kwargs; `apply` mutates matching values in place.
    /// Not used by the engine itself.
    pub fn update_kwargs<M, A>(&mut self, matches: M, apply: A)
    where
        M: Fn(&str, &Value) -> bool,
        A: Fn(&mut Value),
    {
        fn walk<M, A>(map: &mut JsonMap, matches: &M, apply: &A)
        where
            M: Fn(&str, &Value) -> bool,
            A: Fn(&mut Value),
        {
            for (key, value) in map.iter_mut() {
                if matches(key, value) {
                    apply(value);
                } else if let Value::Object(inner) = value {
                    walk(inner, matches, apply);
                }
            }
        }
        walk(&mut self.kwargs, &matches, &apply);
    }

    /// Append (or prepend) a string to the display name.
    pub fn append_name(&mut self, part: &str, prepend: bool) {
        if prepend {
            self.name = format!("{part}{}", self.name);
        } else {
            self.name.push_str(part);
        }
    }

    /// Run the job against a store.
    ///
    /// Resolves argument references, invokes the callable, normalizes the
    /// return into a [`Response`], validates the output schema, and
    /// persists the output. Driven by the scheduler; user code never calls
    /// this directly.
    pub async fn run(&self, store: &JobStore) -> Result<Response, JobError> {
        info!(name = %self.name, uuid = %self.uuid, index = self.index, "starting job");

        let (args, kwargs) = if self.config.resolve_references {
            self.resolve_arguments(store).await?
        } else {
            (self.args.clone(), self.kwargs.clone())
        };

        let returns = self.function.call(&args, &kwargs).await?;
        let response = Response::from_returns(returns, self.output_schema.as_ref())?;

        let mut request = SaveRequest::new(
            self.uuid,
            self.index,
            response.output.clone().unwrap_or(Value::Null),
            self.name.clone(),
        );
        request.metadata = self.metadata.clone();
        request.hosts = self.hosts.clone();
        request.store_names = self.store_names.clone();
        request.stored_data = response.stored_data.clone();
        store.save(request).await?;

        info!(name = %self.name, uuid = %self.uuid, index = self.index, "finished job");
        Ok(response)
    }

    async fn resolve_arguments(
        &self,
        store: &JobStore,
    ) -> Result<(Vec<Value>, JsonMap), ReferenceResolutionError> {
        let mut cache = ResolutionCache::default();
        let on_missing = self.config.on_missing_references;
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            args.push(find_and_resolve_references(arg, store, &mut cache, on_missing).await?);
        }
        let mut kwargs = JsonMap::new();
        for (key, value) in &self.kwargs {
            kwargs.insert(
                key.clone(),
                find_and_resolve_references(value, store, &mut cache, on_missing).await?,
            );
        }
        Ok((args, kwargs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl JobFunction for Noop {
        async fn call(
            &self,
            _args: &[Value],
            _kwargs: &JsonMap,
        ) -> Result<JobReturns, JobFunctionError> {
            Ok(Value::Null.into())
        }
    }

    #[test]
    fn test_output_reference_follows_uuid() {
        let mut job = Job::new("noop", Noop);
        assert_eq!(job.output().uuid(), job.uuid());
        let new_uuid = Uuid::new_v4();
        job.set_uuid(new_uuid);
        assert_eq!(job.output().uuid(), new_uuid);
    }

    #[test]
    fn test_input_references_cover_args_and_kwargs() {
        let upstream = Job::new("noop", Noop);
        let other = Job::new("noop", Noop);
        let job = Job::new("noop", Noop)
            .with_args(vec![json!([1, upstream.output().to_value()])])
            .with_kwarg("data", json!({"deep": other.output().attr("x").to_value()}));
        let uuids = job.input_uuids();
        assert_eq!(uuids.len(), 2);
        assert!(uuids.contains(&upstream.uuid()));
        assert!(uuids.contains(&other.uuid()));
    }

    #[test]
    fn test_update_kwargs_recursive() {
        let mut job = Job::new("noop", Noop)
            .with_kwarg("number", json!(5))
            .with_kwarg("nested", json!({"number": 7, "other": 1}));
        job.update_kwargs(
            |key, _| key == "number",
            |value| *value = json!(10),
        );
        assert_eq!(job.kwargs()["number"], json!(10));
        assert_eq!(job.kwargs()["nested"]["number"], json!(10));
        assert_eq!(job.kwargs()["nested"]["other"], json!(1));
    }

    #[test]
    fn test_append_name() {
        let mut job = Job::new("relax", Noop);
        job.append_name(" 2", false);
        assert_eq!(job.name(), "relax 2");
        job.append_name("pre ", true);
        assert_eq!(job.name(), "pre relax 2");
    }
}

//! ```text
//! Job ─┬─► Flow::add ─► Manager::run ─► Job::run ─► Response
//!      │                │               │            │
//!      │                │               │            ├─► output ─► JobStore (main + aux blobs)
//!      │                │               │            └─► replace / detour / addition / stop
//!      │                │               └─► reference resolution (JobStore lookups)
//!      │                └─► topological order + dynamic rewrite
//!      │
//!      └─► .output() ─► OutputReference (late-bound, path-building)
//! ```
//!
//! Jobflow is a workflow engine for deferred, data-dependent computations:
//! ordinary functions become [`Job`](job::Job)s whose arguments may
//! reference outputs of jobs that have not run yet, jobs compose into
//! acyclic [`Flow`](flow::Flow)s, and a [`Manager`](manager::Manager)
//! executes the flow against a persistent multi-store
//! [`JobStore`](store::JobStore), applying any dynamic directives a job
//! returns.

pub mod codec;
pub mod flow;
pub mod job;
pub mod manager;
pub mod reference;
pub mod response;
pub mod schema;
pub mod store;
pub mod utils;

pub use codec::{JsonMap, ObjectRegistry, SerializationError};
pub use flow::{Flow, FlowNode, GraphConstructionError};
pub use job::{Job, JobConfig, JobError, JobFunction, JobFunctionError, JobReturns};
pub use manager::{
    run_locally, FlowOutcome, FlowReport, JobFailure, JobState, Manager, ManagerConfig,
    ManagerError, UnresolvableGraphError,
};
pub use reference::{OnMissing, OutputReference, PathComponent, ReferenceResolutionError};
pub use response::Response;
pub use schema::{OutputSchema, SchemaViolationError, ValueKind};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use store::{
    BlobMarker, Criteria, DocumentStore, GetOutputError, JobStore, Load, MemoryStore,
    OutputNotFoundError, SaveRequest, Sort, SortOrder, StoreError, Which,
};

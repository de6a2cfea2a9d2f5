//! Topological flow execution with dynamic graph rewrite.
//!
//! The [`Manager`] drives a [`Flow`] to termination: it repeatedly picks
//! ready jobs (all in-flow upstream jobs finished), resolves their input
//! references against the [`JobStore`], invokes the body, persists the
//! response output, and applies any graph-mutation directives. Directive
//! flows (`replace`, then `detour`, then `addition`) are executed
//! depth-first, to completion, before any downstream job of the mutating
//! job is considered; that ordering is what makes uuid shadowing by a
//! higher index observable to downstream references.
//!
//! The reference model is strictly sequential (`max_concurrency == 1`).
//! Larger limits run mutually independent ready jobs concurrently in
//! launch order; responses and graph mutation are always applied serially.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::codec::JsonMap;
use crate::flow::{Flow, GraphConstructionError};
use crate::job::{Job, JobError, JobFunction, JobFunctionError, JobReturns};
use crate::reference::OnMissing;
use crate::response::Response;
use crate::store::{JobStore, StoreError};

/// Execution settings for a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on concurrently running jobs. `1` is the strictly
    /// sequential reference model.
    pub max_concurrency: usize,
    /// Fail the run if any job finished `Failed` or `Cancelled`.
    pub ensure_success: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            ensure_success: false,
        }
    }
}

/// Terminal state of one uuid after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Done,
    Cancelled,
    Failed { reason: String },
}

/// Per-uuid outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct FlowReport {
    states: FxHashMap<Uuid, JobState>,
}

impl FlowReport {
    #[must_use]
    pub fn state_of(&self, uuid: Uuid) -> Option<&JobState> {
        self.states.get(&uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Uuid, &JobState)> {
        self.states.iter().map(|(uuid, state)| (*uuid, state))
    }

    /// Whether every attempted job completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.states.values().all(|s| matches!(s, JobState::Done))
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, JobState::Failed { .. }))
            .count()
    }

    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, JobState::Cancelled))
            .count()
    }
}

/// Everything a run produced: each job's responses keyed by
/// `uuid → index`, plus the per-uuid status report.
#[derive(Debug, Clone, Default)]
pub struct FlowOutcome {
    pub responses: FxHashMap<Uuid, BTreeMap<u32, Response>>,
    pub report: FlowReport,
}

impl FlowOutcome {
    /// The response of the highest completed index of a uuid.
    #[must_use]
    pub fn response(&self, uuid: Uuid) -> Option<&Response> {
        self.responses
            .get(&uuid)
            .and_then(|by_index| by_index.values().next_back())
    }
}

/// Runtime deadlock: no job is ready but unfinished jobs remain.
#[derive(Debug, Error, Diagnostic)]
#[error("no job is ready but {} remain unfinished", .remaining.len())]
#[diagnostic(
    code(jobflow::manager::unresolvable_graph),
    help("A job depends on an output that is neither in the flow nor in the store.")
)]
pub struct UnresolvableGraphError {
    pub remaining: Vec<Uuid>,
}

/// An unrecovered error raised from one job body, with its identity.
#[derive(Debug, Error, Diagnostic)]
#[error("job '{name}' ({uuid}, index {index}) failed: {source}")]
#[diagnostic(code(jobflow::manager::job_failure))]
pub struct JobFailure {
    pub uuid: Uuid,
    pub index: u32,
    pub name: String,
    #[source]
    pub source: JobError,
}

/// Errors that abort a whole run.
#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Unresolvable(#[from] UnresolvableGraphError),

    /// A directive carried a flow the graph cannot absorb.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphConstructionError),

    /// Persistence failed; the store is the engine's backbone, so this is
    /// not attributed to a single job.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// `ensure_success` was requested and the run was not clean.
    #[error("flow did not finish successfully: {failed} failed, {cancelled} cancelled")]
    #[diagnostic(code(jobflow::manager::ensure_success))]
    EnsureSuccess { failed: usize, cancelled: usize },

    /// A worker task panicked or was aborted.
    #[error("job task join error: {0}")]
    #[diagnostic(code(jobflow::manager::join))]
    Join(#[from] JoinError),
}

#[derive(Default)]
struct RunState {
    done: FxHashMap<Uuid, u32>,
    /// Uuids whose downstream must not start: `stop_children` roots plus
    /// the jobs skipped because of them.
    stopped: FxHashSet<Uuid>,
    cancelled: FxHashSet<Uuid>,
    failed: FxHashMap<Uuid, String>,
    responses: FxHashMap<Uuid, BTreeMap<u32, Response>>,
    stop: bool,
}

/// Executes flows against a job store.
pub struct Manager {
    store: JobStore,
    config: ManagerConfig,
}

impl Manager {
    #[must_use]
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            config: ManagerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run a flow to termination.
    ///
    /// Job-body failures (including argument resolution and schema
    /// violations) are recorded against the raising job and cancel its
    /// downstream; persistence failures and invalid directives abort the
    /// run.
    #[instrument(skip(self, flow), fields(flow_name = %flow.name()))]
    pub async fn run(&self, flow: Flow) -> Result<FlowOutcome, ManagerError> {
        info!("started executing flow");
        let jobs = flow.into_scheduled();
        let mut state = RunState::default();
        self.run_scope(jobs, &mut state).await?;
        info!("finished executing flow");

        let mut states: FxHashMap<Uuid, JobState> = FxHashMap::default();
        for uuid in &state.cancelled {
            states.insert(*uuid, JobState::Cancelled);
        }
        for uuid in state.done.keys() {
            states.insert(*uuid, JobState::Done);
        }
        for (uuid, reason) in &state.failed {
            states.insert(
                *uuid,
                JobState::Failed {
                    reason: reason.clone(),
                },
            );
        }
        let report = FlowReport { states };

        if self.config.ensure_success && !report.is_success() {
            return Err(ManagerError::EnsureSuccess {
                failed: report.failed_count(),
                cancelled: report.cancelled_count(),
            });
        }
        Ok(FlowOutcome {
            responses: state.responses,
            report,
        })
    }

    /// Run one scope (the root flow or a directive flow) to completion.
    fn run_scope<'a>(
        &'a self,
        mut pending: Vec<(Job, FxHashSet<Uuid>)>,
        state: &'a mut RunState,
    ) -> BoxFuture<'a, Result<(), ManagerError>> {
        Box::pin(async move {
            while !pending.is_empty() {
                if state.stop {
                    for (job, _) in pending.drain(..) {
                        debug!(name = %job.name(), uuid = %job.uuid(), "flow stopped, skipping job");
                        state.cancelled.insert(job.uuid());
                    }
                    break;
                }

                sweep_cancellations(&mut pending, state);
                if pending.is_empty() {
                    break;
                }

                let ready: Vec<usize> = pending
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| {
                        let (job, parents) = entry;
                        parents.iter().all(|p| {
                            state.done.contains_key(p)
                                || (state.failed.contains_key(p)
                                    && job.config().on_missing_references != OnMissing::Error)
                        })
                    })
                    .map(|(i, _)| i)
                    .take(self.config.max_concurrency.max(1))
                    .collect();

                if ready.is_empty() {
                    return Err(UnresolvableGraphError {
                        remaining: pending.iter().map(|(job, _)| job.uuid()).collect(),
                    }
                    .into());
                }

                let mut wave: Vec<Job> = Vec::with_capacity(ready.len());
                for i in ready.iter().rev() {
                    let (job, _) = pending.remove(*i);
                    wave.push(job);
                }
                wave.reverse();

                let mut handles = Vec::with_capacity(wave.len());
                for job in wave {
                    let store = self.store.clone();
                    handles.push(tokio::spawn(async move {
                        let result = job.run(&store).await;
                        (job, result)
                    }));
                }
                let mut results = Vec::with_capacity(handles.len());
                for handle in handles {
                    results.push(handle.await?);
                }

                for (job, result) in results {
                    let uuid = job.uuid();
                    let index = job.index();
                    match result {
                        Err(JobError::Store(e)) => return Err(e.into()),
                        Err(source) => {
                            let failure = JobFailure {
                                uuid,
                                index,
                                name: job.name().to_string(),
                                source,
                            };
                            warn!(%failure, "job failed");
                            state.failed.insert(uuid, failure.to_string());
                        }
                        Ok(response) => {
                            state
                                .responses
                                .entry(uuid)
                                .or_default()
                                .insert(index, response.clone());
                            if response.stop_children {
                                debug!(name = %job.name(), %uuid, "stopping children");
                                state.stopped.insert(uuid);
                            }
                            state.done.insert(uuid, index);
                            if response.stop_jobflow {
                                info!(name = %job.name(), %uuid, "job requested flow stop");
                                state.stop = true;
                                continue;
                            }
                            if state.stop {
                                continue;
                            }
                            if let Some(replace) = response.replace {
                                debug!(%uuid, "applying replace directive");
                                let prepared = prepare_replace(replace, &job)?;
                                self.run_scope(prepared.into_scheduled(), &mut *state)
                                    .await?;
                            }
                            if state.stop {
                                continue;
                            }
                            if let Some(detour) = response.detour {
                                debug!(%uuid, "applying detour directive");
                                let prepared = prepare_detour(detour, &job)?;
                                self.run_scope(prepared.into_scheduled(), &mut *state)
                                    .await?;
                            }
                            if state.stop {
                                continue;
                            }
                            if let Some(addition) = response.addition {
                                debug!(%uuid, "applying addition directive");
                                self.run_scope(addition.into_scheduled(), &mut *state)
                                    .await?;
                            }
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

/// Move every pending job with a stopped, cancelled, or (under strict
/// missing-reference handling) failed upstream into the cancelled set,
/// transitively.
fn sweep_cancellations(pending: &mut Vec<(Job, FxHashSet<Uuid>)>, state: &mut RunState) {
    loop {
        let mut changed = false;
        pending.retain(|(job, parents)| {
            let upstream_stopped = parents
                .iter()
                .any(|p| state.stopped.contains(p) || state.cancelled.contains(p));
            let upstream_failed = job.config().on_missing_references == OnMissing::Error
                && parents.iter().any(|p| state.failed.contains_key(p));
            if upstream_stopped || upstream_failed {
                warn!(
                    name = %job.name(),
                    uuid = %job.uuid(),
                    "skipping job: upstream stopped, cancelled, or failed"
                );
                state.cancelled.insert(job.uuid());
                if upstream_stopped {
                    state.stopped.insert(job.uuid());
                }
                changed = true;
                false
            } else {
                true
            }
        });
        if !changed {
            break;
        }
    }
}

/// Internal passthrough that persists a replacement flow's resolved output
/// projection under the replaced job's uuid.
struct StoreInputs;

#[async_trait]
impl JobFunction for StoreInputs {
    async fn call(&self, args: &[Value], _kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
        Ok(args.first().cloned().unwrap_or(Value::Null).into())
    }
}

/// Prepare a replace directive for execution.
///
/// A flow with an output projection gets a passthrough job appended that
/// carries the current job's uuid at `index + 1`, so the projection becomes
/// the uuid's newest output. A projection-less flow must consist of exactly
/// one job, which adopts the uuid directly (self-replace).
fn prepare_replace(mut flow: Flow, current: &Job) -> Result<Flow, GraphConstructionError> {
    if flow.output().is_some() {
        append_passthrough(&mut flow, current)?;
        Ok(flow)
    } else if let Some(job) = flow.single_job_mut() {
        job.set_uuid(current.uuid());
        job.set_index(current.index() + 1);
        job.merge_metadata(current.metadata());
        job.inherit_schema(current.output_schema());
        Ok(flow)
    } else {
        Err(GraphConstructionError::InvalidReplacement {
            uuid: current.uuid(),
        })
    }
}

/// Prepare a detour directive: with a projection the detour shadows the
/// current uuid exactly like a replace; without one it simply runs before
/// the downstream jobs.
fn prepare_detour(mut flow: Flow, current: &Job) -> Result<Flow, GraphConstructionError> {
    if flow.output().is_some() {
        append_passthrough(&mut flow, current)?;
    }
    Ok(flow)
}

fn append_passthrough(flow: &mut Flow, current: &Job) -> Result<(), GraphConstructionError> {
    let projection = flow.output().cloned().unwrap_or(Value::Null);
    let mut passthrough = Job::new("store_inputs", StoreInputs).with_args(vec![projection]);
    passthrough.set_uuid(current.uuid());
    passthrough.set_index(current.index() + 1);
    passthrough.merge_metadata(current.metadata());
    passthrough.inherit_schema(current.output_schema());
    flow.add(passthrough)
}

/// Run a flow locally.
///
/// Uses an in-memory [`JobStore`] when none is supplied. Returns every
/// job's responses keyed `uuid → index → response` alongside the status
/// report.
pub async fn run_locally(flow: Flow, store: Option<JobStore>) -> Result<FlowOutcome, ManagerError> {
    let store = store.unwrap_or_else(JobStore::memory);
    store.connect().await?;
    Manager::new(store).run(flow).await
}

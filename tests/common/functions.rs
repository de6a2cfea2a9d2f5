#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use jobflow::codec::JsonMap;
use jobflow::flow::Flow;
use jobflow::job::{Job, JobFunction, JobFunctionError, JobReturns};
use jobflow::response::Response;

/// Shared record of job invocations, for asserting execution order.
#[derive(Clone, Default)]
pub struct RunLog(Arc<Mutex<Vec<String>>>);

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, label: &str) {
        self.0.lock().push(label.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == label)
    }
}

/// Sums its integer positional arguments.
pub struct Add;

#[async_trait]
impl JobFunction for Add {
    async fn call(&self, args: &[Value], _kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
        let total: i64 = args
            .iter()
            .map(|v| {
                v.as_i64()
                    .ok_or(JobFunctionError::MissingInput { what: "integer" })
            })
            .sum::<Result<i64, _>>()?;
        Ok(json!(total).into())
    }
}

/// Returns a fixed value.
pub struct Constant(pub Value);

#[async_trait]
impl JobFunction for Constant {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        Ok(self.0.clone().into())
    }
}

/// Doubles its first integer argument.
pub struct Double;

#[async_trait]
impl JobFunction for Double {
    async fn call(&self, args: &[Value], _kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
        let n = args
            .first()
            .and_then(Value::as_i64)
            .ok_or(JobFunctionError::MissingInput { what: "integer" })?;
        Ok(json!(n * 2).into())
    }
}

/// Sums the numbers in its first (sequence) argument.
pub struct SumSequence;

#[async_trait]
impl JobFunction for SumSequence {
    async fn call(&self, args: &[Value], _kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
        let items = args
            .first()
            .and_then(Value::as_array)
            .ok_or(JobFunctionError::MissingInput { what: "sequence" })?;
        let total: f64 = items.iter().filter_map(Value::as_f64).sum();
        Ok(json!(total).into())
    }
}

/// Returns its first argument untouched.
pub struct Identity;

#[async_trait]
impl JobFunction for Identity {
    async fn call(&self, args: &[Value], _kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
        Ok(args.first().cloned().unwrap_or(Value::Null).into())
    }
}

/// Always fails with the given message.
pub struct Failing(pub &'static str);

#[async_trait]
impl JobFunction for Failing {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        Err(JobFunctionError::Failed(self.0.to_string()))
    }
}

/// Records its label before returning a fixed value.
pub struct Recorded {
    pub label: &'static str,
    pub log: RunLog,
    pub value: Value,
}

impl Recorded {
    pub fn new(label: &'static str, log: &RunLog, value: Value) -> Self {
        Self {
            label,
            log: log.clone(),
            value,
        }
    }
}

#[async_trait]
impl JobFunction for Recorded {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        self.log.record(self.label);
        Ok(self.value.clone().into())
    }
}

/// Records its label, then sums the numbers in its first argument.
pub struct RecordedSum {
    pub label: &'static str,
    pub log: RunLog,
}

#[async_trait]
impl JobFunction for RecordedSum {
    async fn call(&self, args: &[Value], kwargs: &JsonMap) -> Result<JobReturns, JobFunctionError> {
        self.log.record(self.label);
        SumSequence.call(args, kwargs).await
    }
}

/// Replaces itself with a single job computing the given value.
pub struct ReplaceWithConstant(pub Value);

#[async_trait]
impl JobFunction for ReplaceWithConstant {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        let job = Job::new("constant", Constant(self.0.clone()));
        let flow = Flow::from_jobs("replacement", [job])
            .map_err(|e| JobFunctionError::Failed(e.to_string()))?;
        Ok(Response::new().with_replace(flow).into())
    }
}

/// Replaces itself with a flow whose output projection doubles the value.
pub struct ReplaceWithFlow(pub i64);

#[async_trait]
impl JobFunction for ReplaceWithFlow {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        let seed = Job::new("constant", Constant(json!(self.0)));
        let doubled = Job::new("double", Double).with_args(vec![seed.output().to_value()]);
        let projection = doubled.output().to_value();
        let flow = Flow::from_jobs("replacement", [seed, doubled])
            .map_err(|e| JobFunctionError::Failed(e.to_string()))?
            .with_output(projection);
        Ok(Response::new().with_replace(flow).into())
    }
}

/// Emits an output and cancels all downstream jobs.
pub struct StopChildren(pub Value);

#[async_trait]
impl JobFunction for StopChildren {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        Ok(Response::from_value(self.0.clone())
            .with_stop_children()
            .into())
    }
}

/// Emits an output and halts the whole flow.
pub struct StopJobflow(pub Value);

#[async_trait]
impl JobFunction for StopJobflow {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        Ok(Response::from_value(self.0.clone())
            .with_stop_jobflow()
            .into())
    }
}

/// Emits an output and detours to a flow producing `detour_value`, which
/// downstream references then observe instead of `own`.
pub struct DetourTo {
    pub own: Value,
    pub detour_value: Value,
}

#[async_trait]
impl JobFunction for DetourTo {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        let job = Job::new("constant", Constant(self.detour_value.clone()));
        let projection = job.output().to_value();
        let flow = Flow::from_jobs("detour", [job])
            .map_err(|e| JobFunctionError::Failed(e.to_string()))?
            .with_output(projection);
        Ok(Response::from_value(self.own.clone())
            .with_detour(flow)
            .into())
    }
}

/// Emits an output and appends an extra recorded job to the flow.
pub struct AppendAddition {
    pub own: Value,
    pub label: &'static str,
    pub log: RunLog,
}

#[async_trait]
impl JobFunction for AppendAddition {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        let job = Job::new(
            self.label,
            Recorded::new(self.label, &self.log, json!("appended")),
        );
        let flow = Flow::from_jobs("addition", [job])
            .map_err(|e| JobFunctionError::Failed(e.to_string()))?;
        Ok(Response::from_value(self.own.clone())
            .with_addition(flow)
            .into())
    }
}

/// Returns `{"big": <payload>, "small": 1}` for multi-store routing tests.
pub struct BigSmall(pub Value);

#[async_trait]
impl JobFunction for BigSmall {
    async fn call(
        &self,
        _args: &[Value],
        _kwargs: &JsonMap,
    ) -> Result<JobReturns, JobFunctionError> {
        Ok(json!({"big": self.0, "small": 1}).into())
    }
}

//! The handshake between a job body and the scheduler.
//!
//! Every job run produces a [`Response`]: the output value to persist plus
//! optional graph-mutation directives. A plain return value is wrapped as
//! `Response { output, .. }`; returning a `Response` directly gives the job
//! control over the rest of the flow: replacing itself, detouring around
//! its downstream, appending new work, or stopping execution.

use serde_json::Value;

use crate::flow::Flow;
use crate::job::JobReturns;
use crate::schema::{OutputSchema, SchemaViolationError};

/// The outcome of running one job.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// The job output, persisted under `(uuid, index)`.
    pub output: Option<Value>,
    /// A flow to run *before* this job's downstream; downstream references
    /// to this job observe the detour's output.
    pub detour: Option<Flow>,
    /// A flow to append to the running graph; existing wiring is untouched.
    pub addition: Option<Flow>,
    /// A flow that substitutes this job under its uuid.
    pub replace: Option<Flow>,
    /// Side-channel value persisted alongside the output for auditing.
    pub stored_data: Option<Value>,
    /// Cancel every downstream job of this one.
    pub stop_children: bool,
    /// Halt the whole flow after this job's output is persisted.
    pub stop_jobflow: bool,
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A response carrying only an output value.
    #[must_use]
    pub fn from_value(output: impl Into<Value>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_detour(mut self, detour: Flow) -> Self {
        self.detour = Some(detour);
        self
    }

    #[must_use]
    pub fn with_addition(mut self, addition: Flow) -> Self {
        self.addition = Some(addition);
        self
    }

    #[must_use]
    pub fn with_replace(mut self, replace: Flow) -> Self {
        self.replace = Some(replace);
        self
    }

    #[must_use]
    pub fn with_stored_data(mut self, stored_data: impl Into<Value>) -> Self {
        self.stored_data = Some(stored_data.into());
        self
    }

    #[must_use]
    pub fn with_stop_children(mut self) -> Self {
        self.stop_children = true;
        self
    }

    #[must_use]
    pub fn with_stop_jobflow(mut self) -> Self {
        self.stop_jobflow = true;
        self
    }

    /// Whether this response mutates the running graph.
    #[must_use]
    pub fn has_directives(&self) -> bool {
        self.detour.is_some() || self.addition.is_some() || self.replace.is_some()
    }

    /// Normalize a job's return value into a response, enforcing the job's
    /// output schema.
    ///
    /// The schema is not applied when the response carries a `replace`
    /// directive: the replacement will produce the output that ultimately
    /// lives under this job's uuid, and is validated when it runs.
    pub fn from_returns(
        returns: JobReturns,
        schema: Option<&OutputSchema>,
    ) -> Result<Self, SchemaViolationError> {
        let response = match returns {
            JobReturns::Response(response) => response,
            JobReturns::Value(value) => Response::from_value(value),
        };
        if response.replace.is_none() {
            if let Some(schema) = schema {
                match &response.output {
                    Some(output) => schema.validate(output)?,
                    None => {
                        return Err(SchemaViolationError::NoOutput {
                            schema: schema.name().to_string(),
                        })
                    }
                }
            }
        }
        Ok(response)
    }
}

impl From<Value> for Response {
    fn from(output: Value) -> Self {
        Response::from_value(output)
    }
}

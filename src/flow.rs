//! Composition of jobs into acyclic flows.
//!
//! A [`Flow`] is an ordered collection of [`Job`]s and sub-flows with an
//! optional symbolic output projection. Children are exclusively owned:
//! adding a child that already sits inside another flow is an error, as is
//! any addition that would introduce a dependency cycle. The dependency
//! graph is derived entirely from the references embedded in each job's
//! arguments; edges pointing at uuids outside the flow are "prior" outputs
//! that must already exist in the job store at run time.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::job::Job;

/// Errors raised while assembling a flow or preparing graph surgery.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphConstructionError {
    /// The child is already owned by another flow.
    #[error("child {uuid} already belongs to a flow")]
    #[diagnostic(
        code(jobflow::flow::already_parented),
        help("A job or sub-flow can be added to exactly one flow.")
    )]
    AlreadyParented { uuid: Uuid },

    /// A job with this uuid is already present.
    #[error("a job with uuid {uuid} is already part of this flow")]
    #[diagnostic(code(jobflow::flow::duplicate_job))]
    DuplicateJob { uuid: Uuid },

    /// Adding the child would create a dependency cycle.
    #[error("adding this child would create a dependency cycle through {uuid}")]
    #[diagnostic(code(jobflow::flow::dependency_cycle))]
    DependencyCycle { uuid: Uuid },

    /// A job's arguments reference its own output.
    #[error("job {uuid} references its own output")]
    #[diagnostic(code(jobflow::flow::self_reference))]
    SelfReference { uuid: Uuid },

    /// A replace directive carried a flow that cannot stand in for a job.
    #[error("replacement flow for job {uuid} needs an output projection or a single job")]
    #[diagnostic(
        code(jobflow::flow::invalid_replacement),
        help("Give the replacement flow an output projection, or replace with one job.")
    )]
    InvalidReplacement { uuid: Uuid },
}

/// A child of a flow: either a job or a nested flow.
#[derive(Debug, Clone)]
pub enum FlowNode {
    Job(Box<Job>),
    Flow(Flow),
}

impl From<Job> for FlowNode {
    fn from(job: Job) -> Self {
        FlowNode::Job(Box::new(job))
    }
}

impl From<Flow> for FlowNode {
    fn from(flow: Flow) -> Self {
        FlowNode::Flow(flow)
    }
}

impl FlowNode {
    fn hosts(&self) -> &[Uuid] {
        match self {
            FlowNode::Job(job) => job.hosts(),
            FlowNode::Flow(flow) => &flow.hosts,
        }
    }

    fn prepend_hosts(&mut self, prefix: &[Uuid]) {
        match self {
            FlowNode::Job(job) => job.prepend_hosts(prefix),
            FlowNode::Flow(flow) => {
                let mut combined = prefix.to_vec();
                combined.extend(flow.hosts.iter().copied());
                flow.hosts = combined;
                for child in &mut flow.children {
                    child.prepend_hosts(prefix);
                }
            }
        }
    }
}

/// An ordered, acyclic composition of jobs and sub-flows.
///
/// # Examples
///
/// ```
/// # use async_trait::async_trait;
/// # use jobflow::codec::JsonMap;
/// # use jobflow::job::{Job, JobFunction, JobFunctionError, JobReturns};
/// # use serde_json::{json, Value};
/// use jobflow::flow::Flow;
///
/// # struct Add;
/// # #[async_trait]
/// # impl JobFunction for Add {
/// #     async fn call(&self, args: &[Value], _: &JsonMap) -> Result<JobReturns, JobFunctionError> {
/// #         Ok(json!(args.iter().filter_map(Value::as_f64).sum::<f64>()).into())
/// #     }
/// # }
/// let first = Job::new("add", Add).with_args(vec![json!(1), json!(5)]);
/// let second = Job::new("add", Add).with_args(vec![first.output().to_value(), json!(3)]);
///
/// let mut flow = Flow::new("two step add");
/// flow.add(first).unwrap();
/// flow.add(second).unwrap();
/// assert_eq!(flow.job_count(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Flow {
    uuid: Uuid,
    name: String,
    children: Vec<FlowNode>,
    output: Option<Value>,
    hosts: Vec<Uuid>,
}

impl Flow {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            children: Vec::new(),
            output: None,
            hosts: Vec::new(),
        }
    }

    /// Build a flow from jobs in order.
    pub fn from_jobs(
        name: impl Into<String>,
        jobs: impl IntoIterator<Item = Job>,
    ) -> Result<Self, GraphConstructionError> {
        let mut flow = Self::new(name);
        for job in jobs {
            flow.add(job)?;
        }
        Ok(flow)
    }

    /// Set the symbolic output projection: an arbitrary tree of values and
    /// references describing what this flow produces when nested inside
    /// another flow. Never persisted.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Enclosing flow uuids, outermost first. Empty for a root flow.
    pub fn hosts(&self) -> &[Uuid] {
        &self.hosts
    }

    /// Append a job or sub-flow.
    ///
    /// Fails if the child already has a parent, duplicates a uuid already
    /// present, references its own output, or would introduce a dependency
    /// cycle.
    pub fn add(&mut self, child: impl Into<FlowNode>) -> Result<(), GraphConstructionError> {
        let mut child = child.into();

        if !child.hosts().is_empty() {
            let uuid = match &child {
                FlowNode::Job(job) => job.uuid(),
                FlowNode::Flow(flow) => flow.uuid,
            };
            return Err(GraphConstructionError::AlreadyParented { uuid });
        }

        let existing = self.all_uuids();
        let mut candidate_jobs: Vec<&Job> = Vec::new();
        collect_jobs(std::slice::from_ref(&child), &mut candidate_jobs);
        for job in &candidate_jobs {
            if existing.contains(&job.uuid()) {
                return Err(GraphConstructionError::DuplicateJob { uuid: job.uuid() });
            }
            if job.input_uuids().contains(&job.uuid()) {
                return Err(GraphConstructionError::SelfReference { uuid: job.uuid() });
            }
        }

        // Cycle check over the combined internal dependency graph.
        let mut nodes: Vec<(Uuid, FxHashSet<Uuid>)> = Vec::new();
        let mut internal: FxHashSet<Uuid> = existing.clone();
        internal.extend(candidate_jobs.iter().map(|j| j.uuid()));
        for job in self.jobs().into_iter().chain(candidate_jobs) {
            let deps: FxHashSet<Uuid> = job
                .input_uuids()
                .into_iter()
                .filter(|u| internal.contains(u))
                .collect();
            nodes.push((job.uuid(), deps));
        }
        if let Some(uuid) = find_cycle(&nodes) {
            return Err(GraphConstructionError::DependencyCycle { uuid });
        }

        let mut chain = self.hosts.clone();
        chain.push(self.uuid);
        child.prepend_hosts(&chain);
        self.children.push(child);
        Ok(())
    }

    /// All transitively contained jobs, depth-first in insertion order.
    #[must_use]
    pub fn jobs(&self) -> Vec<&Job> {
        let mut out = Vec::new();
        collect_jobs(&self.children, &mut out);
        out
    }

    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs().len()
    }

    /// Uuids of all transitively contained jobs.
    #[must_use]
    pub fn all_uuids(&self) -> FxHashSet<Uuid> {
        self.jobs().iter().map(|j| j.uuid()).collect()
    }

    /// Jobs in a valid topological order, each paired with the uuids of its
    /// upstream jobs *within this flow*.
    ///
    /// Mutually independent jobs keep their insertion order. References to
    /// uuids outside the flow do not appear as upstream entries; they are
    /// prior outputs checked at resolution time.
    #[must_use]
    pub fn iterflow(&self) -> Vec<(&Job, FxHashSet<Uuid>)> {
        let jobs = self.jobs();
        let internal: FxHashSet<Uuid> = jobs.iter().map(|j| j.uuid()).collect();
        let parents: Vec<FxHashSet<Uuid>> = jobs
            .iter()
            .map(|job| {
                job.input_uuids()
                    .into_iter()
                    .filter(|u| internal.contains(u))
                    .collect()
            })
            .collect();

        let mut emitted: FxHashSet<Uuid> = FxHashSet::default();
        let mut done = vec![false; jobs.len()];
        let mut order: Vec<(&Job, FxHashSet<Uuid>)> = Vec::with_capacity(jobs.len());
        while order.len() < jobs.len() {
            let next = jobs.iter().enumerate().position(|(i, _)| {
                !done[i] && parents[i].iter().all(|u| emitted.contains(u))
            });
            // A stuck scan is impossible for flows assembled through `add`,
            // which rejects cycles.
            let Some(i) = next else { break };
            done[i] = true;
            emitted.insert(jobs[i].uuid());
            order.push((jobs[i], parents[i].clone()));
        }
        order
    }

    /// Consume the flow into owned jobs in topological order, paired with
    /// their in-flow upstream uuids.
    pub(crate) fn into_scheduled(self) -> Vec<(Job, FxHashSet<Uuid>)> {
        let plan: Vec<(Uuid, FxHashSet<Uuid>)> = self
            .iterflow()
            .into_iter()
            .map(|(job, parents)| (job.uuid(), parents))
            .collect();
        let mut by_uuid: FxHashMap<Uuid, Job> = FxHashMap::default();
        take_jobs(self.children, &mut by_uuid);
        plan.into_iter()
            .filter_map(|(uuid, parents)| by_uuid.remove(&uuid).map(|job| (job, parents)))
            .collect()
    }

    /// Mutable access to the flow's single job, if it contains exactly one
    /// job and no sub-flows. Used when a replace directive substitutes a
    /// lone job under the replaced job's uuid.
    pub(crate) fn single_job_mut(&mut self) -> Option<&mut Job> {
        match self.children.as_mut_slice() {
            [FlowNode::Job(job)] => Some(job.as_mut()),
            _ => None,
        }
    }
}

fn collect_jobs<'a>(children: &'a [FlowNode], out: &mut Vec<&'a Job>) {
    for child in children {
        match child {
            FlowNode::Job(job) => out.push(job.as_ref()),
            FlowNode::Flow(flow) => collect_jobs(&flow.children, out),
        }
    }
}

fn take_jobs(children: Vec<FlowNode>, out: &mut FxHashMap<Uuid, Job>) {
    for child in children {
        match child {
            FlowNode::Job(job) => {
                out.insert(job.uuid(), *job);
            }
            FlowNode::Flow(flow) => take_jobs(flow.children, out),
        }
    }
}

/// Three-color DFS over the internal dependency edges; returns a uuid on a
/// cycle, if any.
fn find_cycle(nodes: &[(Uuid, FxHashSet<Uuid>)]) -> Option<Uuid> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let deps: FxHashMap<Uuid, &FxHashSet<Uuid>> =
        nodes.iter().map(|(u, d)| (*u, d)).collect();
    let mut colors: FxHashMap<Uuid, Color> =
        nodes.iter().map(|(u, _)| (*u, Color::White)).collect();

    fn visit(
        uuid: Uuid,
        deps: &FxHashMap<Uuid, &FxHashSet<Uuid>>,
        colors: &mut FxHashMap<Uuid, Color>,
    ) -> Option<Uuid> {
        colors.insert(uuid, Color::Grey);
        if let Some(parents) = deps.get(&uuid) {
            for parent in parents.iter() {
                match colors.get(parent) {
                    Some(Color::Grey) => return Some(*parent),
                    Some(Color::White) => {
                        if let Some(found) = visit(*parent, deps, colors) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
        }
        colors.insert(uuid, Color::Black);
        None
    }

    for (uuid, _) in nodes {
        if colors.get(uuid) == Some(&Color::White) {
            if let Some(found) = visit(*uuid, &deps, &mut colors) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonMap;
    use crate::job::{JobFunction, JobFunctionError, JobReturns};
    use async_trait::async_trait;
    use serde_json::{json, Value};

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
    fn test_iterflow_respects_dependencies() {
        let a = Job::new("a", Noop);
        let c = Job::new("c", Noop).with_args(vec![a.output().to_value()]);
        let b = Job::new("b", Noop);
        let (a_uuid, b_uuid, c_uuid) = (a.uuid(), b.uuid(), c.uuid());

        // c inserted before b, but depends on a; independent jobs keep
        // insertion order.
        let flow = Flow::from_jobs("f", [a, c, b]).unwrap();
        let order: Vec<Uuid> = flow.iterflow().iter().map(|(j, _)| j.uuid()).collect();
        assert_eq!(order, vec![a_uuid, c_uuid, b_uuid]);

        let parents: Vec<_> = flow.iterflow()[1].1.iter().copied().collect();
        assert_eq!(parents, vec![a_uuid]);
    }

    #[test]
    fn test_add_rejects_parented_child() {
        let job = Job::new("a", Noop);
        let mut first = Flow::new("first");
        first.add(job).unwrap();

        // The job now carries `first` on its host stack; a copy of it
        // cannot be claimed by another flow.
        let parented = first.jobs()[0].clone();
        let mut second = Flow::new("second");
        assert!(matches!(
            second.add(parented),
            Err(GraphConstructionError::AlreadyParented { .. })
        ));
    }

    #[test]
    fn test_add_rejects_cycle() {
        let mut a = Job::new("a", Noop);
        let b = Job::new("b", Noop).with_args(vec![a.output().to_value()]);
        // Close the loop: a depends on b.
        a = a.with_args(vec![b.output().to_value()]);

        let mut flow = Flow::new("cyclic");
        flow.add(a).unwrap();
        assert!(matches!(
            flow.add(b),
            Err(GraphConstructionError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_add_rejects_self_reference() {
        let mut job = Job::new("a", Noop);
        let own = job.output().to_value();
        job = job.with_args(vec![own]);
        let mut flow = Flow::new("bad");
        assert!(matches!(
            flow.add(job),
            Err(GraphConstructionError::SelfReference { .. })
        ));
    }

    #[test]
    fn test_nested_flow_hosts() {
        let job = Job::new("a", Noop);
        let mut inner = Flow::new("inner");
        inner.add(job).unwrap();
        let inner_uuid = inner.uuid();

        let mut outer = Flow::new("outer");
        let outer_uuid = outer.uuid();
        outer.add(inner).unwrap();

        let jobs = outer.jobs();
        assert_eq!(jobs[0].hosts(), &[outer_uuid, inner_uuid]);
    }

    #[test]
    fn test_prior_uuid_not_listed_as_parent() {
        let prior = Job::new("prior", Noop);
        let job = Job::new("a", Noop).with_args(vec![prior.output().to_value()]);
        let flow = Flow::from_jobs("f", [job]).unwrap();
        let (_, parents) = &flow.iterflow()[0];
        assert!(parents.is_empty());
    }
}

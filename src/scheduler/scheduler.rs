use crate::automaton::{decode_payload, encode_message, AutomatonPart, HandlerError, MutationContext, MutationError};
use crate::payloads::{
    ExecJobRecord, ExecNodeRecord, OperationRecord, ReqAbortOperation, ReqExecNodeHeartbeat, ReqGetOperation,
    ReqRegisterExecNode, ReqStartOperation, Resources, RspExecNodeHeartbeat, RspGetOperation, SchedulerSnapshot,
    StartedJob,
};
use crate::scheduler::fair_share::{build_tree_snapshot, OperationElement, RunningJobRef};
use crate::scheduler::job_scheduler::FairShareTreeJobScheduler;
use crate::scheduler::resources::{dominates, JobResources};
use crate::scheduler::scheduling_context::{NodeDescriptor, RunningJob, SchedulingContext};
use crate::scheduler::tag_filter::{SchedulingTagFilter, SchedulingTagFilterRegistry};
use crate::scheduler::SchedulerConfig;
use std::collections::{BTreeMap, BTreeSet};

pub const REGISTER_EXEC_NODE: &str = "scheduler.register_exec_node";
pub const START_OPERATION: &str = "scheduler.start_operation";
pub const ABORT_OPERATION: &str = "scheduler.abort_operation";
pub const EXEC_NODE_HEARTBEAT: &str = "scheduler.exec_node_heartbeat";
pub const GET_OPERATION: &str = "scheduler.get_operation";

const DEFAULT_POOL: &str = "default";

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("No such exec node {0}")]
    NoSuchExecNode(String),
    #[error("Operation {0} already exists")]
    OperationAlreadyExists(String),
    #[error("No such operation {0}")]
    NoSuchOperation(String),
    #[error("Invalid spec for operation {operation_id}: {reason}")]
    InvalidOperationSpec {
        operation_id: String,
        reason: &'static str,
    },
    #[error("Exec node {0} reports resource limits out of bounds")]
    InvalidResourceLimits(String),
}

pub const NO_SUCH_EXEC_NODE: u32 = 2001;
pub const OPERATION_ALREADY_EXISTS: u32 = 2002;
pub const NO_SUCH_OPERATION: u32 = 2003;
pub const INVALID_OPERATION_SPEC: u32 = 2004;
pub const INVALID_RESOURCE_LIMITS: u32 = 2005;

impl SchedulerError {
    pub fn code(&self) -> u32 {
        match self {
            SchedulerError::NoSuchExecNode(_) => NO_SUCH_EXEC_NODE,
            SchedulerError::OperationAlreadyExists(_) => OPERATION_ALREADY_EXISTS,
            SchedulerError::NoSuchOperation(_) => NO_SUCH_OPERATION,
            SchedulerError::InvalidOperationSpec { .. } => INVALID_OPERATION_SPEC,
            SchedulerError::InvalidResourceLimits(_) => INVALID_RESOURCE_LIMITS,
        }
    }
}

impl From<SchedulerError> for HandlerError {
    fn from(e: SchedulerError) -> Self {
        HandlerError::Rejected(MutationError::new(e.code(), e.to_string()))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperationState {
    Running,
    Completed,
    Aborted,
}

impl OperationState {
    fn to_u32(self) -> u32 {
        match self {
            OperationState::Running => 1,
            OperationState::Completed => 2,
            OperationState::Aborted => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(OperationState::Running),
            2 => Some(OperationState::Completed),
            3 => Some(OperationState::Aborted),
            _ => None,
        }
    }
}

/// Job state as an exec node reports it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReportedJobState {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ReportedJobState {
    pub fn to_u32(self) -> u32 {
        match self {
            ReportedJobState::Running => 1,
            ReportedJobState::Completed => 2,
            ReportedJobState::Failed => 3,
            ReportedJobState::Aborted => 4,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ReportedJobState::Running),
            2 => Some(ReportedJobState::Completed),
            3 => Some(ReportedJobState::Failed),
            4 => Some(ReportedJobState::Aborted),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ExecJobState {
    /// Handed to the node, not yet confirmed running.
    Created,
    Running,
}

#[derive(Clone, Debug)]
struct ExecNode {
    tags: BTreeSet<String>,
    resource_limits: JobResources,
    overcommit_since: Option<u64>,
    last_preemptive_scheduling: Option<u64>,
}

#[derive(Clone, Debug)]
struct Operation {
    pool: String,
    weight: f64,
    tag_filter: SchedulingTagFilter,
    task_resources: JobResources,
    task_count: u32,
    /// Tasks below this index were handed out at least once.
    next_task_index: u32,
    requeued_tasks: BTreeSet<u32>,
    completed_tasks: u32,
    state: OperationState,
    starving_since: Option<u64>,
}

impl Operation {
    fn pending_task_count(&self) -> u32 {
        self.task_count - self.next_task_index + self.requeued_tasks.len() as u32
    }

    /// Requeued tasks go first, lowest index first.
    fn take_pending_task(&mut self) -> Option<u32> {
        if let Some(index) = self.requeued_tasks.iter().next().copied() {
            self.requeued_tasks.remove(&index);
            return Some(index);
        }
        if self.next_task_index < self.task_count {
            self.next_task_index += 1;
            return Some(self.next_task_index - 1);
        }
        None
    }

    fn drop_pending_tasks(&mut self) {
        self.requeued_tasks.clear();
        self.next_task_index = self.task_count;
    }
}

fn check_resource_limits(node_id: &str, limits: Option<&Resources>) -> Result<(), SchedulerError> {
    if JobResources::from(limits).is_in_bounds() {
        Ok(())
    } else {
        Err(SchedulerError::InvalidResourceLimits(node_id.to_string()))
    }
}

fn check_operation_spec(request: &ReqStartOperation, config: &SchedulerConfig) -> Result<(), SchedulerError> {
    let invalid = |reason: &'static str| SchedulerError::InvalidOperationSpec {
        operation_id: request.operation_id.clone(),
        reason,
    };
    if !(request.weight.is_finite() && request.weight > 0.0) {
        return Err(invalid("weight must be positive"));
    }
    if request.task_count == 0 {
        return Err(invalid("task count must be positive"));
    }
    if request.task_count > config.max_tasks_per_operation {
        return Err(invalid("too many tasks"));
    }
    let task_resources = JobResources::from(request.task_resources.as_ref());
    if task_resources == JobResources::zero() || !task_resources.is_in_bounds() {
        return Err(invalid("task resources must be non-zero and within bounds"));
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct ExecJob {
    operation_id: String,
    node_id: String,
    task_index: u32,
    resources: JobResources,
    state: ExecJobState,
    start_time: u64,
}

/// Automaton part that places operation tasks onto exec nodes. All scheduling happens while
/// applying a node's heartbeat mutation, so every replica makes identical decisions.
pub struct Scheduler {
    logger: slog::Logger,
    job_scheduler: FairShareTreeJobScheduler,
    config: SchedulerConfig,
    tag_filters: SchedulingTagFilterRegistry,
    nodes: BTreeMap<String, ExecNode>,
    operations: BTreeMap<String, Operation>,
    jobs: BTreeMap<String, ExecJob>,
    next_job_seq: u64,
}

impl Scheduler {
    pub fn new(logger: slog::Logger, config: SchedulerConfig) -> Self {
        Scheduler {
            job_scheduler: FairShareTreeJobScheduler::new(logger.clone(), config.clone()),
            logger,
            config,
            tag_filters: SchedulingTagFilterRegistry::new(),
            nodes: BTreeMap::new(),
            operations: BTreeMap::new(),
            jobs: BTreeMap::new(),
            next_job_seq: 1,
        }
    }

    fn register_exec_node(&mut self, request: ReqRegisterExecNode) -> Result<(), SchedulerError> {
        check_resource_limits(&request.node_id, request.resource_limits.as_ref())?;
        let resource_limits = JobResources::from(request.resource_limits.as_ref());
        let tags: BTreeSet<String> = request.tags.into_iter().collect();
        slog::info!(self.logger, "Registering exec node"; "NodeId" => &request.node_id, "Limits" => ?resource_limits);
        match self.nodes.get_mut(&request.node_id) {
            Some(node) => {
                node.tags = tags;
                node.resource_limits = resource_limits;
            }
            None => {
                self.nodes.insert(
                    request.node_id,
                    ExecNode {
                        tags,
                        resource_limits,
                        overcommit_since: None,
                        last_preemptive_scheduling: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn start_operation(&mut self, request: ReqStartOperation) -> Result<(), SchedulerError> {
        check_operation_spec(&request, &self.config)?;
        let operation_id = request.operation_id;
        if self.operations.contains_key(&operation_id) {
            return Err(SchedulerError::OperationAlreadyExists(operation_id));
        }
        let task_resources = JobResources::from(request.task_resources.as_ref());

        let tag_filter = SchedulingTagFilter::new(request.tag_filter);
        self.tag_filters.register(&tag_filter);
        let pool = if request.pool.is_empty() {
            DEFAULT_POOL.to_string()
        } else {
            request.pool
        };

        slog::info!(
            self.logger,
            "Starting operation";
            "OperationId" => &operation_id,
            "Pool" => &pool,
            "Tasks" => request.task_count
        );
        self.operations.insert(
            operation_id,
            Operation {
                pool,
                weight: request.weight,
                tag_filter,
                task_resources,
                task_count: request.task_count,
                next_task_index: 0,
                requeued_tasks: BTreeSet::new(),
                completed_tasks: 0,
                state: OperationState::Running,
                starving_since: None,
            },
        );
        Ok(())
    }

    /// Aborting a finished operation is a no-op. The node learns about the abort when it next
    /// reports the job, which by then is unknown.
    fn abort_operation(&mut self, request: ReqAbortOperation) -> Result<(), SchedulerError> {
        let op = self
            .operations
            .get_mut(&request.operation_id)
            .ok_or_else(|| SchedulerError::NoSuchOperation(request.operation_id.clone()))?;
        if op.state != OperationState::Running {
            return Ok(());
        }
        op.state = OperationState::Aborted;
        op.drop_pending_tasks();
        op.starving_since = None;
        let tag_filter = op.tag_filter.clone();
        self.tag_filters.unregister(&tag_filter);

        let job_ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.operation_id == request.operation_id)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in job_ids {
            self.jobs.remove(&job_id);
        }
        slog::info!(self.logger, "Aborted operation"; "OperationId" => &request.operation_id);
        Ok(())
    }

    fn process_heartbeat(
        &mut self,
        now: u64,
        request: ReqExecNodeHeartbeat,
    ) -> Result<RspExecNodeHeartbeat, SchedulerError> {
        let node_id = request.node_id;
        if !self.nodes.contains_key(&node_id) {
            return Err(SchedulerError::NoSuchExecNode(node_id));
        }
        check_resource_limits(&node_id, request.resource_limits.as_ref())?;
        if let Some(limits) = request.resource_limits.as_ref() {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.resource_limits = JobResources::from(limits);
            }
        }

        let mut jobs_to_abort = BTreeSet::new();
        let mut reported_running = BTreeSet::new();
        for status in request.jobs {
            let state = match ReportedJobState::from_u32(status.state) {
                Some(state) => state,
                None => {
                    slog::warn!(self.logger, "Ignoring job with unknown state"; "JobId" => &status.job_id, "State" => status.state);
                    continue;
                }
            };
            if state == ReportedJobState::Running {
                reported_running.insert(status.job_id.clone());
            }
            self.process_job_status(&node_id, status.job_id, state, &mut jobs_to_abort);
        }
        self.requeue_lost_jobs(&node_id, &reported_running);

        let (started, preempted, disable_jobs) = self.schedule_on_node(&node_id, now);
        jobs_to_abort.extend(preempted.iter().cloned());
        self.complete_finished_operations();

        let jobs_to_start = self
            .jobs
            .iter()
            .filter(|(_, job)| job.node_id == node_id && job.state == ExecJobState::Created)
            .map(|(job_id, job)| StartedJob {
                job_id: job_id.clone(),
                operation_id: job.operation_id.clone(),
                resources: Some(job.resources.into()),
            })
            .collect();
        if started > 0 || !preempted.is_empty() {
            slog::debug!(
                self.logger,
                "Scheduled";
                "NodeId" => &node_id,
                "Started" => started,
                "Preempted" => preempted.len()
            );
        }

        Ok(RspExecNodeHeartbeat {
            disable_jobs,
            jobs_to_start,
            jobs_to_abort: jobs_to_abort.into_iter().collect(),
        })
    }

    fn process_job_status(
        &mut self,
        node_id: &str,
        job_id: String,
        state: ReportedJobState,
        jobs_to_abort: &mut BTreeSet<String>,
    ) {
        let known = matches!(self.jobs.get(&job_id), Some(job) if job.node_id == node_id);
        if !known {
            if state == ReportedJobState::Running {
                slog::info!(self.logger, "Aborting unknown job"; "JobId" => &job_id, "NodeId" => node_id);
                jobs_to_abort.insert(job_id);
            }
            return;
        }

        match state {
            ReportedJobState::Running => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.state = ExecJobState::Running;
                }
            }
            ReportedJobState::Completed => {
                if let Some(job) = self.jobs.remove(&job_id) {
                    if let Some(op) = self.operations.get_mut(&job.operation_id) {
                        op.completed_tasks += 1;
                    }
                }
            }
            ReportedJobState::Failed | ReportedJobState::Aborted => {
                if let Some(job) = self.jobs.remove(&job_id) {
                    slog::info!(self.logger, "Requeueing task"; "JobId" => &job_id, "State" => ?state);
                    self.requeue(&job);
                }
            }
        }
    }

    /// A confirmed job the node no longer reports is gone.
    fn requeue_lost_jobs(&mut self, node_id: &str, reported_running: &BTreeSet<String>) {
        let lost: Vec<String> = self
            .jobs
            .iter()
            .filter(|(job_id, job)| {
                job.node_id == node_id && job.state == ExecJobState::Running && !reported_running.contains(*job_id)
            })
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in lost {
            if let Some(job) = self.jobs.remove(&job_id) {
                slog::info!(self.logger, "Job lost"; "JobId" => &job_id, "NodeId" => node_id);
                self.requeue(&job);
            }
        }
    }

    fn requeue(&mut self, job: &ExecJob) {
        if let Some(op) = self.operations.get_mut(&job.operation_id) {
            if op.state == OperationState::Running {
                op.requeued_tasks.insert(job.task_index);
            }
        }
    }

    fn node_usage(&self, node_id: &str) -> JobResources {
        self.jobs
            .values()
            .filter(|job| job.node_id == node_id)
            .fold(JobResources::zero(), |acc, job| acc + job.resources)
    }

    /// Returns the number of jobs started, the ids of preempted jobs and whether the node should
    /// stop accepting jobs.
    fn schedule_on_node(&mut self, node_id: &str, now: u64) -> (usize, BTreeSet<String>, bool) {
        let usage = self.node_usage(node_id);
        let descriptor = match self.nodes.get_mut(node_id) {
            Some(node) => {
                if dominates(&node.resource_limits, &usage) {
                    node.overcommit_since = None;
                } else if node.overcommit_since.is_none() {
                    node.overcommit_since = Some(now);
                }
                NodeDescriptor {
                    node_id: node_id.to_string(),
                    tags: node.tags.clone(),
                    resource_limits: node.resource_limits,
                    overcommit_since: node.overcommit_since,
                    last_preemptive_scheduling: node.last_preemptive_scheduling,
                }
            }
            None => return (0, BTreeSet::new(), false),
        };

        let elements = self.operation_elements();
        let total_resources = self
            .nodes
            .values()
            .fold(JobResources::zero(), |acc, node| acc + node.resource_limits);
        let filter_resources: BTreeMap<SchedulingTagFilter, JobResources> = self
            .tag_filters
            .registered_filters()
            .map(|(_, filter)| {
                let matching = self
                    .nodes
                    .values()
                    .filter(|node| filter.can_schedule(&node.tags))
                    .fold(JobResources::zero(), |acc, node| acc + node.resource_limits);
                (filter.clone(), matching)
            })
            .collect();
        let mut tree = build_tree_snapshot(
            &elements,
            total_resources,
            |filter| filter_resources.get(filter).copied().unwrap_or_default(),
            &self.config,
            now,
        );

        let running_jobs: Vec<RunningJob> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.node_id == node_id)
            .map(|(job_id, job)| RunningJob {
                job_id: job_id.clone(),
                operation_id: job.operation_id.clone(),
                resources: job.resources,
                start_time: job.start_time,
            })
            .collect();
        let mut context = SchedulingContext::new(descriptor, running_jobs, &self.config, now);
        self.job_scheduler.schedule_jobs(&mut context, &mut tree);

        for (operation_id, snapshot) in &tree.operations {
            if let Some(op) = self.operations.get_mut(operation_id) {
                op.starving_since = snapshot.starving_since;
            }
        }

        let mut preempted = BTreeSet::new();
        for preempted_job in context.preempted_jobs() {
            if let Some(job) = self.jobs.remove(&preempted_job.job_id) {
                self.requeue(&job);
                preempted.insert(preempted_job.job_id.clone());
            }
        }

        for started in context.started_jobs() {
            let task_index = match self
                .operations
                .get_mut(&started.operation_id)
                .and_then(Operation::take_pending_task)
            {
                Some(index) => index,
                None => continue,
            };
            let job_id = format!("{}/{}", started.operation_id, self.next_job_seq);
            self.next_job_seq += 1;
            self.jobs.insert(
                job_id,
                ExecJob {
                    operation_id: started.operation_id.clone(),
                    node_id: node_id.to_string(),
                    task_index,
                    resources: started.resources,
                    state: ExecJobState::Created,
                    start_time: now,
                },
            );
        }

        let usage = self.node_usage(node_id);
        let disable_jobs = match self.nodes.get_mut(node_id) {
            Some(node) => {
                if context.preemptive_scheduling_performed() {
                    node.last_preemptive_scheduling = Some(now);
                }
                if dominates(&node.resource_limits, &usage) {
                    node.overcommit_since = None;
                    false
                } else {
                    true
                }
            }
            None => false,
        };
        (context.started_jobs().len(), preempted, disable_jobs)
    }

    fn operation_elements(&self) -> Vec<OperationElement> {
        let mut running_by_operation: BTreeMap<&str, Vec<RunningJobRef>> = BTreeMap::new();
        for (job_id, job) in &self.jobs {
            running_by_operation
                .entry(job.operation_id.as_str())
                .or_default()
                .push(RunningJobRef {
                    job_id: job_id.clone(),
                    start_time: job.start_time,
                    resources: job.resources,
                });
        }

        self.operations
            .iter()
            .filter(|(_, op)| op.state == OperationState::Running)
            .map(|(operation_id, op)| OperationElement {
                operation_id: operation_id.clone(),
                pool: op.pool.clone(),
                weight: op.weight,
                tag_filter: op.tag_filter.clone(),
                task_resources: op.task_resources,
                pending_tasks: u64::from(op.pending_task_count()),
                running_jobs: running_by_operation.remove(operation_id.as_str()).unwrap_or_default(),
                starving_since: op.starving_since,
            })
            .collect()
    }

    fn complete_finished_operations(&mut self) {
        let jobs = &self.jobs;
        let mut finished = Vec::new();
        for (operation_id, op) in self.operations.iter_mut() {
            if op.state != OperationState::Running || op.pending_task_count() > 0 {
                continue;
            }
            if jobs.values().any(|job| &job.operation_id == operation_id) {
                continue;
            }
            op.state = OperationState::Completed;
            op.starving_since = None;
            finished.push((operation_id.clone(), op.tag_filter.clone()));
        }
        for (operation_id, tag_filter) in finished {
            self.tag_filters.unregister(&tag_filter);
            slog::info!(self.logger, "Operation completed"; "OperationId" => operation_id);
        }
    }

    fn get_operation(&self, request: ReqGetOperation) -> RspGetOperation {
        match self.operations.get(&request.operation_id) {
            Some(op) => RspGetOperation {
                found: true,
                state: op.state.to_u32(),
                pending_tasks: op.pending_task_count(),
                running_jobs: self
                    .jobs
                    .values()
                    .filter(|job| job.operation_id == request.operation_id)
                    .count() as u32,
                completed_tasks: op.completed_tasks,
            },
            None => RspGetOperation::default(),
        }
    }

    fn corrupt(&self, reason: String) -> HandlerError {
        HandlerError::CorruptSnapshot {
            part: self.name().to_string(),
            reason,
        }
    }
}

impl AutomatonPart for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn mutation_types(&self) -> Vec<&'static str> {
        vec![REGISTER_EXEC_NODE, START_OPERATION, ABORT_OPERATION, EXEC_NODE_HEARTBEAT]
    }

    fn query_types(&self) -> Vec<&'static str> {
        vec![GET_OPERATION]
    }

    fn validate_mutation(&self, mutation_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
        match mutation_type {
            REGISTER_EXEC_NODE => {
                let request: ReqRegisterExecNode = decode_payload(mutation_type, payload)?;
                check_resource_limits(&request.node_id, request.resource_limits.as_ref())?;
            }
            START_OPERATION => {
                let request: ReqStartOperation = decode_payload(mutation_type, payload)?;
                check_operation_spec(&request, &self.config)?;
            }
            ABORT_OPERATION => {
                decode_payload::<ReqAbortOperation>(mutation_type, payload)?;
            }
            EXEC_NODE_HEARTBEAT => {
                let request: ReqExecNodeHeartbeat = decode_payload(mutation_type, payload)?;
                check_resource_limits(&request.node_id, request.resource_limits.as_ref())?;
            }
            _ => return Err(HandlerError::UnknownMutationType(mutation_type.to_string())),
        }
        Ok(())
    }

    fn apply_mutation(
        &mut self,
        context: &MutationContext,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        match mutation_type {
            REGISTER_EXEC_NODE => {
                self.register_exec_node(decode_payload(mutation_type, payload)?)?;
                Ok(Vec::new())
            }
            START_OPERATION => {
                self.start_operation(decode_payload(mutation_type, payload)?)?;
                Ok(Vec::new())
            }
            ABORT_OPERATION => {
                self.abort_operation(decode_payload(mutation_type, payload)?)?;
                Ok(Vec::new())
            }
            EXEC_NODE_HEARTBEAT => {
                let response = self.process_heartbeat(context.timestamp, decode_payload(mutation_type, payload)?)?;
                Ok(encode_message(&response))
            }
            _ => Err(HandlerError::UnknownMutationType(mutation_type.to_string())),
        }
    }

    fn query(&self, query_type: &str, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        if query_type != GET_OPERATION {
            return Err(HandlerError::UnknownMutationType(query_type.to_string()));
        }
        let response = self.get_operation(decode_payload(query_type, payload)?);
        Ok(encode_message(&response))
    }

    fn save_snapshot(&self) -> Vec<u8> {
        let snapshot = SchedulerSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(node_id, node)| ExecNodeRecord {
                    node_id: node_id.clone(),
                    tags: node.tags.iter().cloned().collect(),
                    resource_limits: Some(node.resource_limits.into()),
                    overcommit_since: node.overcommit_since.unwrap_or(0),
                    last_preemptive_scheduling: node.last_preemptive_scheduling.unwrap_or(0),
                })
                .collect(),
            operations: self
                .operations
                .iter()
                .map(|(operation_id, op)| OperationRecord {
                    operation_id: operation_id.clone(),
                    pool: op.pool.clone(),
                    weight: op.weight,
                    tag_filter: op.tag_filter.tags().cloned().collect(),
                    task_resources: Some(op.task_resources.into()),
                    requeued_tasks: op.requeued_tasks.iter().copied().collect(),
                    next_task_index: op.next_task_index,
                    completed_tasks: op.completed_tasks,
                    state: op.state.to_u32(),
                    starving_since: op.starving_since.unwrap_or(0),
                    task_count: op.task_count,
                })
                .collect(),
            jobs: self
                .jobs
                .iter()
                .map(|(job_id, job)| ExecJobRecord {
                    job_id: job_id.clone(),
                    operation_id: job.operation_id.clone(),
                    node_id: job.node_id.clone(),
                    task_index: job.task_index,
                    resources: Some(job.resources.into()),
                    state: match job.state {
                        ExecJobState::Created => 0,
                        ExecJobState::Running => 1,
                    },
                    start_time: job.start_time,
                })
                .collect(),
            next_job_seq: self.next_job_seq,
        };
        encode_message(&snapshot)
    }

    fn load_snapshot(&mut self, state: &[u8]) -> Result<(), HandlerError> {
        let snapshot: SchedulerSnapshot =
            prost::Message::decode(state).map_err(|e: prost::DecodeError| self.corrupt(e.to_string()))?;
        let non_zero = |v: u64| if v == 0 { None } else { Some(v) };

        for record in snapshot.nodes {
            self.nodes.insert(
                record.node_id,
                ExecNode {
                    tags: record.tags.into_iter().collect(),
                    resource_limits: JobResources::from(record.resource_limits.as_ref()),
                    overcommit_since: non_zero(record.overcommit_since),
                    last_preemptive_scheduling: non_zero(record.last_preemptive_scheduling),
                },
            );
        }
        for record in snapshot.operations {
            let state = OperationState::from_u32(record.state)
                .ok_or_else(|| self.corrupt(format!("Operation {} has state {}", record.operation_id, record.state)))?;
            if record.next_task_index > record.task_count {
                return Err(self.corrupt(format!("Operation {} handed out too many tasks", record.operation_id)));
            }
            let tag_filter = SchedulingTagFilter::new(record.tag_filter);
            if state == OperationState::Running {
                self.tag_filters.register(&tag_filter);
            }
            self.operations.insert(
                record.operation_id,
                Operation {
                    pool: record.pool,
                    weight: record.weight,
                    tag_filter,
                    task_resources: JobResources::from(record.task_resources.as_ref()),
                    task_count: record.task_count,
                    next_task_index: record.next_task_index,
                    requeued_tasks: record.requeued_tasks.into_iter().collect(),
                    completed_tasks: record.completed_tasks,
                    state,
                    starving_since: non_zero(record.starving_since),
                },
            );
        }
        for record in snapshot.jobs {
            let state = match record.state {
                0 => ExecJobState::Created,
                1 => ExecJobState::Running,
                other => return Err(self.corrupt(format!("Job {} has state {}", record.job_id, other))),
            };
            self.jobs.insert(
                record.job_id,
                ExecJob {
                    operation_id: record.operation_id,
                    node_id: record.node_id,
                    task_index: record.task_index,
                    resources: JobResources::from(record.resources.as_ref()),
                    state,
                    start_time: record.start_time,
                },
            );
        }
        self.next_job_seq = snapshot.next_job_seq;
        Ok(())
    }

    fn clear(&mut self) {
        self.tag_filters.clear();
        self.nodes.clear();
        self.operations.clear();
        self.jobs.clear();
        self.next_job_seq = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::{ExecJobStatus, Resources};

    fn scheduler() -> Scheduler {
        Scheduler::new(slog::Logger::root(slog::Discard, slog::o!()), SchedulerConfig::default())
    }

    fn resources(user_slots: i64, cpu: i64) -> Option<Resources> {
        Some(Resources {
            user_slots,
            cpu,
            memory: 0,
            disk_quota: 0,
            gpu: 0,
        })
    }

    fn ctx(sequence_number: u64, timestamp: u64) -> MutationContext {
        MutationContext {
            sequence_number,
            term: 1,
            timestamp,
        }
    }

    fn register(s: &mut Scheduler, node_id: &str, slots: i64, tags: &[&str]) {
        let request = ReqRegisterExecNode {
            node_id: node_id.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            resource_limits: resources(slots, slots),
        };
        s.apply_mutation(&ctx(1, 0), REGISTER_EXEC_NODE, &encode_message(&request))
            .unwrap();
    }

    fn start(s: &mut Scheduler, operation_id: &str, tasks: u32, tag_filter: &[&str]) -> Result<Vec<u8>, HandlerError> {
        let request = ReqStartOperation {
            operation_id: operation_id.to_string(),
            pool: String::new(),
            weight: 1.0,
            tag_filter: tag_filter.iter().map(|t| t.to_string()).collect(),
            task_count: tasks,
            task_resources: resources(1, 1),
        };
        s.apply_mutation(&ctx(2, 0), START_OPERATION, &encode_message(&request))
    }

    fn heartbeat(s: &mut Scheduler, node_id: &str, now: u64, jobs: &[(&str, ReportedJobState)]) -> RspExecNodeHeartbeat {
        let request = ReqExecNodeHeartbeat {
            node_id: node_id.to_string(),
            jobs: jobs
                .iter()
                .map(|(job_id, state)| ExecJobStatus {
                    job_id: job_id.to_string(),
                    state: state.to_u32(),
                })
                .collect(),
            resource_limits: None,
        };
        let bytes = s
            .apply_mutation(&ctx(3, now), EXEC_NODE_HEARTBEAT, &encode_message(&request))
            .unwrap();
        prost::Message::decode(bytes.as_slice()).unwrap()
    }

    fn operation(s: &Scheduler, operation_id: &str) -> RspGetOperation {
        let request = ReqGetOperation {
            operation_id: operation_id.to_string(),
        };
        let bytes = s.query(GET_OPERATION, &encode_message(&request)).unwrap();
        prost::Message::decode(bytes.as_slice()).unwrap()
    }

    fn rejection_code(result: Result<Vec<u8>, HandlerError>) -> u32 {
        match result {
            Err(HandlerError::Rejected(e)) => e.code,
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn heartbeat_from_unknown_node_is_rejected() {
        let mut s = scheduler();
        let request = ReqExecNodeHeartbeat {
            node_id: "ghost".into(),
            jobs: vec![],
            resource_limits: None,
        };
        let result = s.apply_mutation(&ctx(1, 0), EXEC_NODE_HEARTBEAT, &encode_message(&request));
        assert_eq!(rejection_code(result), NO_SUCH_EXEC_NODE);
    }

    #[test]
    fn invalid_operation_specs_are_rejected() {
        let mut s = scheduler();
        assert_eq!(rejection_code(start(&mut s, "op", 0, &[])), INVALID_OPERATION_SPEC);
        start(&mut s, "op", 1, &[]).unwrap();
        assert_eq!(rejection_code(start(&mut s, "op", 1, &[])), OPERATION_ALREADY_EXISTS);
    }

    #[test]
    fn operation_runs_to_completion_with_requeue_on_failure() {
        let mut s = scheduler();
        register(&mut s, "n1", 2, &[]);
        start(&mut s, "op", 3, &[]).unwrap();

        let rsp = heartbeat(&mut s, "n1", 100, &[]);
        assert!(!rsp.disable_jobs);
        assert_eq!(rsp.jobs_to_start.len(), 2);
        let first = rsp.jobs_to_start[0].job_id.clone();
        let second = rsp.jobs_to_start[1].job_id.clone();

        // Created jobs are resent until the node confirms them.
        let rsp = heartbeat(&mut s, "n1", 200, &[]);
        assert_eq!(rsp.jobs_to_start.len(), 2);

        let rsp = heartbeat(
            &mut s,
            "n1",
            300,
            &[(&first, ReportedJobState::Completed), (&second, ReportedJobState::Failed)],
        );
        // The failed task went back to pending and was rescheduled with the remaining one.
        assert_eq!(rsp.jobs_to_start.len(), 2);
        assert_eq!(operation(&s, "op").completed_tasks, 1);
        assert_eq!(operation(&s, "op").pending_tasks, 0);

        let ids: Vec<String> = rsp.jobs_to_start.iter().map(|j| j.job_id.clone()).collect();
        heartbeat(&mut s, "n1", 400, &[(&ids[0], ReportedJobState::Running), (&ids[1], ReportedJobState::Running)]);
        heartbeat(&mut s, "n1", 500, &[(&ids[0], ReportedJobState::Completed), (&ids[1], ReportedJobState::Completed)]);

        let op = operation(&s, "op");
        assert_eq!(OperationState::from_u32(op.state), Some(OperationState::Completed));
        assert_eq!(op.completed_tasks, 3);
        assert_eq!(op.running_jobs, 0);
    }

    #[test]
    fn lost_and_unknown_jobs() {
        let mut s = scheduler();
        register(&mut s, "n1", 1, &[]);
        start(&mut s, "op", 1, &[]).unwrap();

        let job = heartbeat(&mut s, "n1", 100, &[]).jobs_to_start[0].job_id.clone();
        heartbeat(&mut s, "n1", 200, &[(&job, ReportedJobState::Running)]);
        assert_eq!(operation(&s, "op").running_jobs, 1);

        // The node forgot the job: it's requeued and handed out again under a new id.
        let rsp = heartbeat(&mut s, "n1", 300, &[("stray", ReportedJobState::Running)]);
        assert_eq!(rsp.jobs_to_abort, vec!["stray".to_string()]);
        assert_eq!(rsp.jobs_to_start.len(), 1);
        assert_ne!(rsp.jobs_to_start[0].job_id, job);
    }

    #[test]
    fn abort_operation_aborts_jobs_the_node_still_runs() {
        let mut s = scheduler();
        register(&mut s, "n1", 2, &[]);
        start(&mut s, "op", 2, &[]).unwrap();
        let jobs: Vec<String> = heartbeat(&mut s, "n1", 100, &[])
            .jobs_to_start
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        let running: Vec<(&str, ReportedJobState)> =
            jobs.iter().map(|j| (j.as_str(), ReportedJobState::Running)).collect();
        heartbeat(&mut s, "n1", 200, &running);

        let abort = ReqAbortOperation {
            operation_id: "op".into(),
        };
        s.apply_mutation(&ctx(4, 250), ABORT_OPERATION, &encode_message(&abort))
            .unwrap();
        // Aborting twice is fine.
        s.apply_mutation(&ctx(5, 260), ABORT_OPERATION, &encode_message(&abort))
            .unwrap();

        let rsp = heartbeat(&mut s, "n1", 300, &running);
        assert_eq!(rsp.jobs_to_abort, jobs);
        assert!(rsp.jobs_to_start.is_empty());

        let rsp = heartbeat(&mut s, "n1", 400, &[]);
        assert!(rsp.jobs_to_abort.is_empty());
        assert_eq!(
            OperationState::from_u32(operation(&s, "op").state),
            Some(OperationState::Aborted)
        );
    }

    #[test]
    fn tag_filtered_operation_waits_for_matching_node() {
        let mut s = scheduler();
        register(&mut s, "plain", 4, &[]);
        register(&mut s, "gpu-node", 4, &["gpu"]);
        start(&mut s, "op", 2, &["gpu"]).unwrap();

        assert!(heartbeat(&mut s, "plain", 100, &[]).jobs_to_start.is_empty());
        assert_eq!(heartbeat(&mut s, "gpu-node", 100, &[]).jobs_to_start.len(), 2);
    }

    #[test]
    fn shrunk_node_disables_jobs_and_sheds_after_grace() {
        let mut s = scheduler();
        register(&mut s, "n1", 4, &[]);
        start(&mut s, "op", 4, &[]).unwrap();
        let jobs: Vec<String> = heartbeat(&mut s, "n1", 100, &[])
            .jobs_to_start
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        let running: Vec<(&str, ReportedJobState)> =
            jobs.iter().map(|j| (j.as_str(), ReportedJobState::Running)).collect();

        let shrink = |s: &mut Scheduler, now: u64| {
            let request = ReqExecNodeHeartbeat {
                node_id: "n1".into(),
                jobs: running
                    .iter()
                    .map(|(job_id, state)| ExecJobStatus {
                        job_id: job_id.to_string(),
                        state: state.to_u32(),
                    })
                    .collect(),
                resource_limits: resources(2, 2),
            };
            let bytes = s
                .apply_mutation(&ctx(9, now), EXEC_NODE_HEARTBEAT, &encode_message(&request))
                .unwrap();
            let rsp: RspExecNodeHeartbeat = prost::Message::decode(bytes.as_slice()).unwrap();
            rsp
        };

        let rsp = shrink(&mut s, 1_000);
        assert!(rsp.disable_jobs);
        assert!(rsp.jobs_to_abort.is_empty());

        let grace = SchedulerConfig::default().allowed_overcommit_millis();
        let rsp = shrink(&mut s, 1_001 + grace);
        assert!(!rsp.disable_jobs);
        assert_eq!(rsp.jobs_to_abort.len(), 2);
        // The aborted tasks are pending again.
        assert_eq!(operation(&s, "op").pending_tasks, 2);
    }

    #[test]
    fn snapshot_round_trip_preserves_scheduling_decisions() {
        let mut leader = scheduler();
        register(&mut leader, "n1", 3, &["ssd"]);
        start(&mut leader, "a", 5, &["ssd"]).unwrap();
        start(&mut leader, "b", 5, &[]).unwrap();
        heartbeat(&mut leader, "n1", 100, &[]);

        let mut follower = scheduler();
        follower.load_snapshot(&leader.save_snapshot()).unwrap();
        assert_eq!(follower.save_snapshot(), leader.save_snapshot());

        let from_leader = heartbeat(&mut leader, "n1", 200, &[]);
        let from_follower = heartbeat(&mut follower, "n1", 200, &[]);
        assert_eq!(from_leader, from_follower);
        assert_eq!(follower.save_snapshot(), leader.save_snapshot());
    }

    fn start_request(operation_id: &str, task_count: u32, task_resources: Resources) -> ReqStartOperation {
        ReqStartOperation {
            operation_id: operation_id.to_string(),
            pool: String::new(),
            weight: 1.0,
            tag_filter: vec![],
            task_count,
            task_resources: Some(task_resources),
        }
    }

    #[test]
    fn oversized_operations_are_rejected_before_and_after_logging() {
        let mut s = scheduler();
        let four_gib = Resources {
            user_slots: 1,
            memory: 4 << 30,
            ..Default::default()
        };
        let overflowing = Resources {
            user_slots: 1,
            memory: i64::MAX / 2,
            ..Default::default()
        };
        let negative = Resources {
            user_slots: 1,
            cpu: -1,
            ..Default::default()
        };
        for request in vec![
            start_request("too-many", u32::MAX, four_gib),
            start_request("too-big", 3, overflowing),
            start_request("negative", 3, negative),
        ] {
            let payload = encode_message(&request);
            assert!(matches!(
                s.validate_mutation(START_OPERATION, &payload),
                Err(HandlerError::Rejected(ref e)) if e.code == INVALID_OPERATION_SPEC
            ));
            assert_eq!(
                rejection_code(s.apply_mutation(&ctx(1, 0), START_OPERATION, &payload)),
                INVALID_OPERATION_SPEC
            );
        }
        assert!(!operation(&s, "too-many").found);
    }

    #[test]
    fn out_of_bounds_node_limits_are_rejected() {
        let mut s = scheduler();
        let unbounded = Some(Resources {
            user_slots: i64::MAX,
            cpu: i64::MAX,
            ..Default::default()
        });
        let request = ReqRegisterExecNode {
            node_id: "n0".into(),
            tags: vec![],
            resource_limits: unbounded.clone(),
        };
        let payload = encode_message(&request);
        assert!(s.validate_mutation(REGISTER_EXEC_NODE, &payload).is_err());
        assert_eq!(
            rejection_code(s.apply_mutation(&ctx(1, 0), REGISTER_EXEC_NODE, &payload)),
            INVALID_RESOURCE_LIMITS
        );

        register(&mut s, "n1", 2, &[]);
        start(&mut s, "op", 4, &[]).unwrap();
        let request = ReqExecNodeHeartbeat {
            node_id: "n1".into(),
            jobs: vec![],
            resource_limits: unbounded,
        };
        let payload = encode_message(&request);
        assert!(s.validate_mutation(EXEC_NODE_HEARTBEAT, &payload).is_err());
        assert_eq!(
            rejection_code(s.apply_mutation(&ctx(2, 50), EXEC_NODE_HEARTBEAT, &payload)),
            INVALID_RESOURCE_LIMITS
        );

        // The registered limits still apply.
        assert_eq!(heartbeat(&mut s, "n1", 100, &[]).jobs_to_start.len(), 2);
    }

    #[test]
    fn large_operation_hands_out_tasks_lazily() {
        let mut s = scheduler();
        register(&mut s, "n1", 2, &[]);
        let max = SchedulerConfig::default().max_tasks_per_operation;
        start(&mut s, "op", max, &[]).unwrap();
        assert_eq!(
            rejection_code(start(&mut s, "op2", max + 1, &[])),
            INVALID_OPERATION_SPEC
        );

        let rsp = heartbeat(&mut s, "n1", 100, &[]);
        assert_eq!(rsp.jobs_to_start.len(), 2);
        assert_eq!(operation(&s, "op").pending_tasks, max - 2);

        let failed = rsp.jobs_to_start[0].job_id.clone();
        heartbeat(&mut s, "n1", 200, &[(&failed, ReportedJobState::Failed)]);
        // The failed task is requeued and handed out again right away.
        assert_eq!(operation(&s, "op").running_jobs, 2);
        assert_eq!(operation(&s, "op").pending_tasks, max - 2);

        let mut restored = scheduler();
        restored.load_snapshot(&s.save_snapshot()).unwrap();
        assert_eq!(restored.save_snapshot(), s.save_snapshot());
        assert_eq!(operation(&restored, "op").pending_tasks, max - 2);
    }
}

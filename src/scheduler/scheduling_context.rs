use crate::scheduler::resources::{dominates, JobResources};
use crate::scheduler::tag_filter::SchedulingTagFilter;
use crate::scheduler::SchedulerConfig;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
pub struct RunningJob {
    pub job_id: String,
    pub operation_id: String,
    pub resources: JobResources,
    pub start_time: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JobSchedulingStage {
    NonPreemptive,
    Preemptive,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StartedJob {
    pub operation_id: String,
    pub resources: JobResources,
    pub stage: JobSchedulingStage,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JobPreemptionReason {
    Preemption,
    ResourceOvercommit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PreemptedJob {
    pub job_id: String,
    pub operation_id: String,
    pub reason: JobPreemptionReason,
}

/// What the scheduler knows about one node while it serves that node's heartbeat.
#[derive(Clone, Debug)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub tags: BTreeSet<String>,
    pub resource_limits: JobResources,
    pub overcommit_since: Option<u64>,
    pub last_preemptive_scheduling: Option<u64>,
}

/// Admission bookkeeping for one node during one scheduling pass. Starting a job adds to usage,
/// preempting subtracts; discounts are resources the current preemptive stage may reclaim.
#[derive(Debug)]
pub struct SchedulingContext {
    node: NodeDescriptor,
    now: u64,
    min_spare_job_resources: JobResources,
    max_started_jobs_per_heartbeat: Option<usize>,
    allowed_overcommit_millis: u64,

    resource_usage: JobResources,
    unconditional_discount: JobResources,
    conditional_discounts: BTreeMap<String, JobResources>,
    max_conditional_discount: JobResources,

    running_jobs: Vec<RunningJob>,
    started_jobs: Vec<StartedJob>,
    preempted_jobs: Vec<PreemptedJob>,
    preemptive_scheduling_performed: bool,
}

impl SchedulingContext {
    pub fn new(node: NodeDescriptor, running_jobs: Vec<RunningJob>, config: &SchedulerConfig, now: u64) -> Self {
        let resource_usage = running_jobs
            .iter()
            .fold(JobResources::zero(), |acc, job| acc + job.resources);
        SchedulingContext {
            node,
            now,
            min_spare_job_resources: config.min_spare_job_resources,
            max_started_jobs_per_heartbeat: config.max_started_jobs_per_heartbeat,
            allowed_overcommit_millis: config.allowed_overcommit_millis(),
            resource_usage,
            unconditional_discount: JobResources::zero(),
            conditional_discounts: BTreeMap::new(),
            max_conditional_discount: JobResources::zero(),
            running_jobs,
            started_jobs: Vec::new(),
            preempted_jobs: Vec::new(),
            preemptive_scheduling_performed: false,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn resource_limits(&self) -> &JobResources {
        &self.node.resource_limits
    }

    pub fn resource_usage(&self) -> &JobResources {
        &self.resource_usage
    }

    pub fn can_satisfy_resource_request(&self, job_resources: &JobResources, conditional_discount: &JobResources) -> bool {
        dominates(
            &self.node.resource_limits,
            &(self.resource_usage + *job_resources - (self.unconditional_discount + *conditional_discount)),
        )
    }

    pub fn can_start_job_for_operation(&self, job_resources: &JobResources, operation_id: &str) -> bool {
        let conditional_discount = self.conditional_discount_for_operation(operation_id);
        self.can_satisfy_resource_request(job_resources, &conditional_discount)
    }

    pub fn can_start_more_jobs(&self) -> bool {
        if !self.can_satisfy_resource_request(&self.min_spare_job_resources, &self.max_conditional_discount) {
            return false;
        }
        match self.max_started_jobs_per_heartbeat {
            Some(limit) => self.started_jobs.len() < limit,
            None => true,
        }
    }

    pub fn can_schedule(&self, filter: &SchedulingTagFilter) -> bool {
        filter.is_empty() || filter.can_schedule(&self.node.tags)
    }

    pub fn is_overcommitted(&self) -> bool {
        !dominates(&self.node.resource_limits, &self.resource_usage)
    }

    pub fn should_abort_jobs_since_resources_overcommit(&self) -> bool {
        let allowed_overcommit_time_passed = match self.node.overcommit_since {
            Some(since) => since + self.allowed_overcommit_millis < self.now,
            None => false,
        };
        self.is_overcommitted() && allowed_overcommit_time_passed
    }

    pub fn start_job(&mut self, operation_id: &str, resources: JobResources, stage: JobSchedulingStage) {
        self.resource_usage += resources;
        self.started_jobs.push(StartedJob {
            operation_id: operation_id.to_string(),
            resources,
            stage,
        });
    }

    pub fn preempt_job(&mut self, job: &RunningJob, reason: JobPreemptionReason) {
        self.resource_usage -= job.resources;
        self.preempted_jobs.push(PreemptedJob {
            job_id: job.job_id.clone(),
            operation_id: job.operation_id.clone(),
            reason,
        });
    }

    pub fn is_preempted(&self, job_id: &str) -> bool {
        self.preempted_jobs.iter().any(|p| p.job_id == job_id)
    }

    pub fn reset_discounts(&mut self) {
        self.unconditional_discount = JobResources::zero();
        self.conditional_discounts.clear();
        self.max_conditional_discount = JobResources::zero();
    }

    pub fn increase_unconditional_discount(&mut self, resources: JobResources) {
        self.unconditional_discount += resources;
    }

    pub fn set_conditional_discount_for_operation(&mut self, operation_id: &str, discount: JobResources) {
        self.max_conditional_discount = self.max_conditional_discount.max(discount);
        self.conditional_discounts.insert(operation_id.to_string(), discount);
    }

    pub fn conditional_discount_for_operation(&self, operation_id: &str) -> JobResources {
        self.conditional_discounts
            .get(operation_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn node_free_resources_without_discount(&self) -> JobResources {
        self.node.resource_limits - self.resource_usage
    }

    pub fn running_jobs(&self) -> &[RunningJob] {
        &self.running_jobs
    }

    pub fn started_jobs(&self) -> &[StartedJob] {
        &self.started_jobs
    }

    pub fn preempted_jobs(&self) -> &[PreemptedJob] {
        &self.preempted_jobs
    }

    /// Non-forced preemptive stages wait out the backoff since the node's last preemptive pass.
    pub fn preemptive_scheduling_backed_off(&self, backoff_millis: u64) -> bool {
        match self.node.last_preemptive_scheduling {
            Some(last) => self.now < last + backoff_millis,
            None => false,
        }
    }

    pub fn mark_preemptive_scheduling_performed(&mut self) {
        self.preemptive_scheduling_performed = true;
    }

    pub fn preemptive_scheduling_performed(&self) -> bool {
        self.preemptive_scheduling_performed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(n: i64) -> JobResources {
        JobResources {
            user_slots: n,
            cpu: n,
            ..JobResources::zero()
        }
    }

    fn running(id: &str, n: i64) -> RunningJob {
        RunningJob {
            job_id: id.to_string(),
            operation_id: "op".to_string(),
            resources: slots(n),
            start_time: 0,
        }
    }

    fn context(limits: i64, jobs: Vec<RunningJob>, overcommit_since: Option<u64>, now: u64) -> SchedulingContext {
        let node = NodeDescriptor {
            node_id: "n1".to_string(),
            tags: BTreeSet::new(),
            resource_limits: slots(limits),
            overcommit_since,
            last_preemptive_scheduling: None,
        };
        SchedulingContext::new(node, jobs, &SchedulerConfig::default(), now)
    }

    #[test]
    fn discounts_widen_admission() {
        let mut ctx = context(4, vec![running("j1", 3)], None, 0);
        assert!(ctx.can_satisfy_resource_request(&slots(1), &JobResources::zero()));
        assert!(!ctx.can_satisfy_resource_request(&slots(2), &JobResources::zero()));

        ctx.increase_unconditional_discount(slots(1));
        assert!(ctx.can_satisfy_resource_request(&slots(2), &JobResources::zero()));

        ctx.reset_discounts();
        ctx.set_conditional_discount_for_operation("op-b", slots(2));
        assert!(ctx.can_start_job_for_operation(&slots(3), "op-b"));
        assert!(!ctx.can_start_job_for_operation(&slots(3), "op-c"));
    }

    #[test]
    fn spare_resources_gate_more_jobs() {
        let mut ctx = context(2, vec![], None, 0);
        assert!(ctx.can_start_more_jobs());
        ctx.start_job("op", slots(2), JobSchedulingStage::NonPreemptive);
        assert!(!ctx.can_start_more_jobs());
        assert_eq!(ctx.node_free_resources_without_discount(), JobResources::zero());
    }

    #[test]
    fn overcommit_abort_waits_for_grace_period() {
        let grace = SchedulerConfig::default().allowed_overcommit_millis();
        let jobs = || vec![running("j1", 3)];

        assert!(!context(2, jobs(), None, 100_000).should_abort_jobs_since_resources_overcommit());
        assert!(!context(2, jobs(), Some(100_000), 100_000 + grace).should_abort_jobs_since_resources_overcommit());
        assert!(context(2, jobs(), Some(100_000), 100_001 + grace).should_abort_jobs_since_resources_overcommit());
        assert!(!context(3, jobs(), Some(0), 100_001 + grace).should_abort_jobs_since_resources_overcommit());
    }
}

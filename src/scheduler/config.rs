use crate::scheduler::resources::JobResources;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// How long a node may stay above its limits before its jobs get aborted.
    pub allowed_node_resources_overcommit_duration: Duration,
    /// A node with less than this free is not offered new jobs.
    pub min_spare_job_resources: JobResources,
    pub max_started_jobs_per_heartbeat: Option<usize>,
    pub max_tasks_per_operation: u32,
    pub fair_share_starvation_tolerance: f64,
    pub aggressive_starvation_tolerance: f64,
    pub fair_share_starvation_timeout: Duration,
    /// Jobs within this fraction of their operation's fair share are never preempted.
    pub aggressive_preemption_satisfaction_threshold: f64,
    /// Minimum time between non-forced preemptive passes on one node.
    pub preemptive_scheduling_backoff: Duration,
}

impl SchedulerConfig {
    pub(crate) fn allowed_overcommit_millis(&self) -> u64 {
        self.allowed_node_resources_overcommit_duration.as_millis() as u64
    }

    pub(crate) fn fair_share_starvation_timeout_millis(&self) -> u64 {
        self.fair_share_starvation_timeout.as_millis() as u64
    }

    pub(crate) fn preemptive_scheduling_backoff_millis(&self) -> u64 {
        self.preemptive_scheduling_backoff.as_millis() as u64
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            allowed_node_resources_overcommit_duration: Duration::from_secs(10),
            min_spare_job_resources: JobResources {
                user_slots: 1,
                ..JobResources::zero()
            },
            max_started_jobs_per_heartbeat: None,
            max_tasks_per_operation: 100_000,
            fair_share_starvation_tolerance: 0.8,
            aggressive_starvation_tolerance: 0.5,
            fair_share_starvation_timeout: Duration::from_secs(5),
            aggressive_preemption_satisfaction_threshold: 0.5,
            preemptive_scheduling_backoff: Duration::from_millis(500),
        }
    }
}

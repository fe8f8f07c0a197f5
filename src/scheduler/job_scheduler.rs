use crate::scheduler::fair_share::{FairShareTreeSnapshot, JobPreemptionLevel, OperationPreemptionPriority};
use crate::scheduler::resources::{dominates, JobResources};
use crate::scheduler::scheduling_context::{JobPreemptionReason, JobSchedulingStage, RunningJob, SchedulingContext};
use crate::scheduler::SchedulerConfig;
use std::collections::BTreeMap;

pub const MAX_PREEMPTIVE_STAGE_COUNT: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PreemptiveScheduleJobsStage {
    pub target_operation_preemption_priority: OperationPreemptionPriority,
    pub min_job_preemption_level: JobPreemptionLevel,
    /// Ignores the per-node preemptive scheduling backoff.
    pub force_preemption_attempt: bool,
}

/// Decides, for one node heartbeat, which jobs start and which running jobs get preempted.
/// Never errors: a job that doesn't fit simply waits for a later heartbeat.
pub struct FairShareTreeJobScheduler {
    logger: slog::Logger,
    config: SchedulerConfig,
}

impl FairShareTreeJobScheduler {
    pub fn new(logger: slog::Logger, config: SchedulerConfig) -> Self {
        FairShareTreeJobScheduler { logger, config }
    }

    pub fn schedule_jobs(&self, context: &mut SchedulingContext, tree: &mut FairShareTreeSnapshot) {
        if context.should_abort_jobs_since_resources_overcommit() {
            self.abort_jobs_since_resources_overcommit(context, tree);
            return;
        }

        self.schedule_jobs_without_preemption(context, tree);

        for stage in self.build_preemptive_scheduling_stage_list(tree) {
            if !stage.force_preemption_attempt
                && context.preemptive_scheduling_backed_off(self.config.preemptive_scheduling_backoff_millis())
            {
                continue;
            }
            self.schedule_jobs_with_preemption(context, tree, &stage);
        }
    }

    /// Aggressively starving operations get a forced attempt every heartbeat; regular starvation
    /// is rate limited per node.
    pub fn build_preemptive_scheduling_stage_list(
        &self,
        tree: &FairShareTreeSnapshot,
    ) -> Vec<PreemptiveScheduleJobsStage> {
        let has_starving = |priority: OperationPreemptionPriority| {
            tree.operations
                .values()
                .any(|op| op.pending_tasks > 0 && op.preemption_priority >= priority)
        };

        let mut stages = Vec::with_capacity(MAX_PREEMPTIVE_STAGE_COUNT);
        if has_starving(OperationPreemptionPriority::Aggressive) {
            stages.push(PreemptiveScheduleJobsStage {
                target_operation_preemption_priority: OperationPreemptionPriority::Aggressive,
                min_job_preemption_level: JobPreemptionLevel::AggressivelyPreemptible,
                force_preemption_attempt: true,
            });
        }
        if has_starving(OperationPreemptionPriority::Regular) {
            stages.push(PreemptiveScheduleJobsStage {
                target_operation_preemption_priority: OperationPreemptionPriority::Regular,
                min_job_preemption_level: JobPreemptionLevel::Preemptible,
                force_preemption_attempt: false,
            });
        }
        stages
    }

    pub fn schedule_jobs_without_preemption(&self, context: &mut SchedulingContext, tree: &mut FairShareTreeSnapshot) {
        while context.can_start_more_jobs() {
            let next = tree.operations_by_satisfaction().into_iter().find(|operation_id| {
                let op = &tree.operations[operation_id];
                op.pending_tasks > 0
                    && context.can_schedule(&op.tag_filter)
                    && context.can_start_job_for_operation(&op.task_resources, operation_id)
            });
            let operation_id = match next {
                Some(operation_id) => operation_id,
                None => break,
            };

            let resources = tree.operations[&operation_id].task_resources;
            context.start_job(&operation_id, resources, JobSchedulingStage::NonPreemptive);
            account_started_job(tree, &operation_id);
        }
    }

    /// Starts at most one job per stage, paid for by preempting jobs the stage allows.
    pub fn schedule_jobs_with_preemption(
        &self,
        context: &mut SchedulingContext,
        tree: &mut FairShareTreeSnapshot,
        stage: &PreemptiveScheduleJobsStage,
    ) {
        let candidates: Vec<String> = tree
            .operations_by_satisfaction()
            .into_iter()
            .filter(|id| {
                let op = &tree.operations[id];
                op.pending_tasks > 0 && op.preemption_priority >= stage.target_operation_preemption_priority
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let (unconditional, conditional) = self.analyze_preemptible_jobs(context, tree, stage);
        context.reset_discounts();
        context.increase_unconditional_discount(total_resources(&unconditional));
        for operation_id in &candidates {
            let pool = &tree.operations[operation_id].pool;
            let discount = conditional
                .get(pool)
                .map(|jobs| {
                    total_resources(
                        &jobs
                            .iter()
                            .filter(|job| &job.operation_id != operation_id)
                            .cloned()
                            .collect::<Vec<_>>(),
                    )
                })
                .unwrap_or_default();
            context.set_conditional_discount_for_operation(operation_id, discount);
        }

        if !context.can_start_more_jobs() {
            context.reset_discounts();
            return;
        }
        context.mark_preemptive_scheduling_performed();

        let started = candidates.into_iter().find(|operation_id| {
            let op = &tree.operations[operation_id];
            context.can_schedule(&op.tag_filter) && context.can_start_job_for_operation(&op.task_resources, operation_id)
        });

        if let Some(operation_id) = started {
            let resources = tree.operations[&operation_id].task_resources;
            context.start_job(&operation_id, resources, JobSchedulingStage::Preemptive);
            account_started_job(tree, &operation_id);

            let mut preemptible = unconditional;
            if let Some(pool_jobs) = conditional.get(&tree.operations[&operation_id].pool) {
                preemptible.extend(pool_jobs.iter().filter(|job| job.operation_id != operation_id).cloned());
            }
            self.preempt_jobs_after_scheduling(context, tree, preemptible, &operation_id);
        }
        context.reset_discounts();
    }

    /// Unconditionally preemptible jobs may go for any starving operation. Conditionally
    /// preemptible ones (one level below the stage minimum) only for a sibling in the same pool.
    fn analyze_preemptible_jobs(
        &self,
        context: &SchedulingContext,
        tree: &FairShareTreeSnapshot,
        stage: &PreemptiveScheduleJobsStage,
    ) -> (Vec<RunningJob>, BTreeMap<String, Vec<RunningJob>>) {
        let mut unconditional = Vec::new();
        let mut conditional: BTreeMap<String, Vec<RunningJob>> = BTreeMap::new();

        for job in context.running_jobs() {
            if context.is_preempted(&job.job_id) {
                continue;
            }
            let op = match tree.operations.get(&job.operation_id) {
                Some(op) => op,
                None => continue,
            };
            // Starving operations keep what they have.
            if op.preemption_priority != OperationPreemptionPriority::None {
                continue;
            }

            let level = tree.job_preemption_level(&job.job_id);
            if level >= stage.min_job_preemption_level {
                unconditional.push(job.clone());
            } else if stage.min_job_preemption_level == JobPreemptionLevel::Preemptible
                && level == JobPreemptionLevel::AggressivelyPreemptible
            {
                conditional.entry(op.pool.clone()).or_default().push(job.clone());
            }
        }
        (unconditional, conditional)
    }

    fn preempt_jobs_after_scheduling(
        &self,
        context: &mut SchedulingContext,
        tree: &FairShareTreeSnapshot,
        mut preemptible: Vec<RunningJob>,
        started_for: &str,
    ) {
        sort_most_preemptible_first(&mut preemptible, tree);
        for job in &preemptible {
            if dominates(context.resource_limits(), context.resource_usage()) {
                break;
            }
            slog::info!(
                self.logger,
                "Preempting job";
                "JobId" => &job.job_id,
                "OperationId" => &job.operation_id,
                "For" => started_for,
                "NodeId" => context.node_id()
            );
            context.preempt_job(job, JobPreemptionReason::Preemption);
        }

        if !dominates(context.resource_limits(), context.resource_usage()) {
            slog::warn!(
                self.logger,
                "Node still overcommitted after preemption";
                "NodeId" => context.node_id(),
                "Usage" => ?context.resource_usage()
            );
        }
    }

    fn abort_jobs_since_resources_overcommit(&self, context: &mut SchedulingContext, tree: &FairShareTreeSnapshot) {
        let mut jobs: Vec<RunningJob> = context.running_jobs().to_vec();
        sort_most_preemptible_first(&mut jobs, tree);

        for job in &jobs {
            if !context.is_overcommitted() {
                break;
            }
            slog::info!(
                self.logger,
                "Aborting job since node resources are overcommitted";
                "JobId" => &job.job_id,
                "NodeId" => context.node_id(),
                "Usage" => ?context.resource_usage(),
                "Limits" => ?context.resource_limits()
            );
            context.preempt_job(job, JobPreemptionReason::ResourceOvercommit);
        }
    }
}

fn account_started_job(tree: &mut FairShareTreeSnapshot, operation_id: &str) {
    let total = tree.total_resources;
    if let Some(op) = tree.operations.get_mut(operation_id) {
        op.pending_tasks = op.pending_tasks.saturating_sub(1);
        op.usage_share += op.task_resources.dominant_share(&total);
    }
}

fn total_resources(jobs: &[RunningJob]) -> JobResources {
    jobs.iter().fold(JobResources::zero(), |acc, job| acc + job.resources)
}

/// Highest level first, then youngest first.
fn sort_most_preemptible_first(jobs: &mut Vec<RunningJob>, tree: &FairShareTreeSnapshot) {
    jobs.sort_by(|a, b| {
        tree.job_preemption_level(&b.job_id)
            .cmp(&tree.job_preemption_level(&a.job_id))
            .then_with(|| b.start_time.cmp(&a.start_time))
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
}

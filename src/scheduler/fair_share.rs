use crate::scheduler::resources::JobResources;
use crate::scheduler::tag_filter::SchedulingTagFilter;
use crate::scheduler::SchedulerConfig;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum OperationPreemptionPriority {
    None,
    Regular,
    Aggressive,
}

/// Ordered from least to most preemptible; a stage preempts jobs at or above its minimum level.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum JobPreemptionLevel {
    NonPreemptible,
    AggressivelyPreemptible,
    Preemptible,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StarvationStatus {
    NonStarving,
    Starving,
    AggressivelyStarving,
}

#[derive(Clone, Debug)]
pub struct RunningJobRef {
    pub job_id: String,
    pub start_time: u64,
    pub resources: JobResources,
}

/// Input to a fair share computation: one running operation.
#[derive(Clone, Debug)]
pub struct OperationElement {
    pub operation_id: String,
    pub pool: String,
    pub weight: f64,
    pub tag_filter: SchedulingTagFilter,
    pub task_resources: JobResources,
    pub pending_tasks: u64,
    pub running_jobs: Vec<RunningJobRef>,
    pub starving_since: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct OperationSnapshot {
    pub pool: String,
    pub tag_filter: SchedulingTagFilter,
    pub task_resources: JobResources,
    pub pending_tasks: u64,
    pub demand_share: f64,
    pub fair_share: f64,
    pub usage_share: f64,
    pub starvation_status: StarvationStatus,
    pub starving_since: Option<u64>,
    pub preemption_priority: OperationPreemptionPriority,
}

impl OperationSnapshot {
    /// Usage relative to fair share; lower means more deserving.
    pub fn satisfaction(&self) -> f64 {
        if self.fair_share < EPSILON {
            return f64::INFINITY;
        }
        self.usage_share / self.fair_share
    }
}

/// Immutable view of the tree taken at the start of a scheduling pass. The pass itself only
/// moves `pending_tasks` and `usage_share` as it starts jobs.
#[derive(Clone, Debug)]
pub struct FairShareTreeSnapshot {
    pub total_resources: JobResources,
    pub operations: BTreeMap<String, OperationSnapshot>,
    pub job_preemption_levels: BTreeMap<String, JobPreemptionLevel>,
}

impl FairShareTreeSnapshot {
    pub fn job_preemption_level(&self, job_id: &str) -> JobPreemptionLevel {
        self.job_preemption_levels
            .get(job_id)
            .copied()
            .unwrap_or(JobPreemptionLevel::NonPreemptible)
    }

    pub fn operation_preemption_priority(&self, operation_id: &str) -> OperationPreemptionPriority {
        self.operations
            .get(operation_id)
            .map(|op| op.preemption_priority)
            .unwrap_or(OperationPreemptionPriority::None)
    }

    /// Operation ids ordered from least to most satisfied, ties by id.
    pub fn operations_by_satisfaction(&self) -> Vec<String> {
        let mut ids: Vec<&String> = self.operations.keys().collect();
        ids.sort_by(|a, b| {
            let sa = self.operations[*a].satisfaction();
            let sb = self.operations[*b].satisfaction();
            sa.partial_cmp(&sb).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b))
        });
        ids.into_iter().cloned().collect()
    }
}

/// Weighted max-min fair division of `capacity`. Returns one share per item, never above its
/// demand; leftover capacity stays undistributed once every demand is met.
pub fn water_fill(capacity: f64, items: &[(f64, f64)]) -> Vec<f64> {
    let mut shares = vec![0.0; items.len()];
    let mut order: Vec<usize> = (0..items.len())
        .filter(|&i| items[i].0 > EPSILON && items[i].1 > EPSILON)
        .collect();
    // Lowest demand per unit of weight saturates first.
    order.sort_by(|&a, &b| {
        let ra = items[a].1 / items[a].0;
        let rb = items[b].1 / items[b].0;
        ra.partial_cmp(&rb).unwrap_or(Ordering::Equal).then(a.cmp(&b))
    });

    let mut remaining = capacity.max(0.0);
    let mut remaining_weight: f64 = order.iter().map(|&i| items[i].0).sum();
    for (position, &i) in order.iter().enumerate() {
        let (weight, demand) = items[i];
        let level = remaining / remaining_weight;
        if demand <= weight * level + EPSILON {
            shares[i] = demand;
            remaining -= demand;
            remaining_weight -= weight;
        } else {
            for &j in &order[position..] {
                shares[j] = items[j].0 * level;
            }
            break;
        }
    }
    shares
}

/// Two-level fair share: pools split the cluster equally by demand, operations split their pool
/// by weight. Shares are dominant resource shares of the whole cluster.
pub fn build_tree_snapshot<F>(
    elements: &[OperationElement],
    total_resources: JobResources,
    resources_matching_filter: F,
    config: &SchedulerConfig,
    now: u64,
) -> FairShareTreeSnapshot
where
    F: Fn(&SchedulingTagFilter) -> JobResources,
{
    let demand_shares: Vec<f64> = elements
        .iter()
        .map(|element| {
            let running = element.running_jobs.len() as u64;
            let demand = element.task_resources.times(element.pending_tasks + running);
            let cap = if element.tag_filter.is_empty() {
                1.0
            } else {
                resources_matching_filter(&element.tag_filter).dominant_share(&total_resources)
            };
            demand.dominant_share(&total_resources).min(cap)
        })
        .collect();

    let mut pools: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, element) in elements.iter().enumerate() {
        pools.entry(element.pool.as_str()).or_default().push(i);
    }
    let pool_demands: Vec<(f64, f64)> = pools
        .values()
        .map(|members| (1.0, members.iter().map(|&i| demand_shares[i]).sum::<f64>().min(1.0)))
        .collect();
    let pool_shares = water_fill(1.0, &pool_demands);

    let mut fair_shares = vec![0.0; elements.len()];
    for (members, pool_share) in pools.values().zip(pool_shares) {
        let items: Vec<(f64, f64)> = members
            .iter()
            .map(|&i| (elements[i].weight, demand_shares[i]))
            .collect();
        for (&i, share) in members.iter().zip(water_fill(pool_share, &items)) {
            fair_shares[i] = share;
        }
    }

    let mut operations = BTreeMap::new();
    let mut job_preemption_levels = BTreeMap::new();
    for (i, element) in elements.iter().enumerate() {
        let usage = element
            .running_jobs
            .iter()
            .fold(JobResources::zero(), |acc, job| acc + job.resources);
        let usage_share = usage.dominant_share(&total_resources);
        let fair_share = fair_shares[i];

        let starvation_status = starvation_status(usage_share, fair_share, element.pending_tasks, config);
        let starving_since = match starvation_status {
            StarvationStatus::NonStarving => None,
            _ => Some(element.starving_since.unwrap_or(now)),
        };
        let preemption_priority = match starving_since {
            Some(since) if now.saturating_sub(since) >= config.fair_share_starvation_timeout_millis() => {
                match starvation_status {
                    StarvationStatus::AggressivelyStarving => OperationPreemptionPriority::Aggressive,
                    _ => OperationPreemptionPriority::Regular,
                }
            }
            _ => OperationPreemptionPriority::None,
        };

        classify_jobs(element, fair_share, &total_resources, config, &mut job_preemption_levels);

        operations.insert(
            element.operation_id.clone(),
            OperationSnapshot {
                pool: element.pool.clone(),
                tag_filter: element.tag_filter.clone(),
                task_resources: element.task_resources,
                pending_tasks: element.pending_tasks,
                demand_share: demand_shares[i],
                fair_share,
                usage_share,
                starvation_status,
                starving_since,
                preemption_priority,
            },
        );
    }

    FairShareTreeSnapshot {
        total_resources,
        operations,
        job_preemption_levels,
    }
}

fn starvation_status(usage_share: f64, fair_share: f64, pending_tasks: u64, config: &SchedulerConfig) -> StarvationStatus {
    if pending_tasks == 0 || fair_share < EPSILON {
        return StarvationStatus::NonStarving;
    }
    if usage_share + EPSILON < fair_share * config.aggressive_starvation_tolerance {
        StarvationStatus::AggressivelyStarving
    } else if usage_share + EPSILON < fair_share * config.fair_share_starvation_tolerance {
        StarvationStatus::Starving
    } else {
        StarvationStatus::NonStarving
    }
}

/// Oldest jobs are the last to go: levels are assigned by cumulative usage in start order.
fn classify_jobs(
    element: &OperationElement,
    fair_share: f64,
    total_resources: &JobResources,
    config: &SchedulerConfig,
    levels: &mut BTreeMap<String, JobPreemptionLevel>,
) {
    let mut jobs: Vec<&RunningJobRef> = element.running_jobs.iter().collect();
    jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.job_id.cmp(&b.job_id)));

    let mut cumulative = JobResources::zero();
    for job in jobs {
        cumulative += job.resources;
        let share = cumulative.dominant_share(total_resources);
        let level = if share <= fair_share * config.aggressive_preemption_satisfaction_threshold + EPSILON {
            JobPreemptionLevel::NonPreemptible
        } else if share <= fair_share + EPSILON {
            JobPreemptionLevel::AggressivelyPreemptible
        } else {
            JobPreemptionLevel::Preemptible
        };
        levels.insert(job.job_id.clone(), level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-6, "{} != {}", actual, expected);
    }

    #[test]
    fn water_fill_gives_small_demands_first() {
        let shares = water_fill(1.0, &[(1.0, 0.1), (1.0, 0.8), (1.0, 0.8)]);
        assert_close(shares[0], 0.1);
        assert_close(shares[1], 0.45);
        assert_close(shares[2], 0.45);
    }

    #[test]
    fn water_fill_respects_weights_and_leaves_surplus() {
        let shares = water_fill(1.0, &[(3.0, 1.0), (1.0, 1.0)]);
        assert_close(shares[0], 0.75);
        assert_close(shares[1], 0.25);

        let shares = water_fill(1.0, &[(1.0, 0.2), (1.0, 0.3), (1.0, 0.0)]);
        assert_eq!(shares, vec![0.2, 0.3, 0.0]);
    }

    fn element(id: &str, pool: &str, pending: u64, running: &[(&str, u64)]) -> OperationElement {
        let slot = JobResources {
            user_slots: 1,
            ..JobResources::zero()
        };
        OperationElement {
            operation_id: id.to_string(),
            pool: pool.to_string(),
            weight: 1.0,
            tag_filter: SchedulingTagFilter::default(),
            task_resources: slot,
            pending_tasks: pending,
            running_jobs: running
                .iter()
                .map(|(job_id, start_time)| RunningJobRef {
                    job_id: job_id.to_string(),
                    start_time: *start_time,
                    resources: slot,
                })
                .collect(),
            starving_since: None,
        }
    }

    fn ten_slots() -> JobResources {
        JobResources {
            user_slots: 10,
            ..JobResources::zero()
        }
    }

    #[test]
    fn pools_split_before_operations() {
        let elements = vec![
            element("a1", "a", 10, &[]),
            element("a2", "a", 10, &[]),
            element("b1", "b", 10, &[]),
        ];
        let snapshot = build_tree_snapshot(
            &elements,
            ten_slots(),
            |_| ten_slots(),
            &SchedulerConfig::default(),
            0,
        );
        assert_close(snapshot.operations["a1"].fair_share, 0.25);
        assert_close(snapshot.operations["a2"].fair_share, 0.25);
        assert_close(snapshot.operations["b1"].fair_share, 0.5);
    }

    #[test]
    fn hogging_operation_has_preemptible_tail_and_starver_gets_priority() {
        let config = SchedulerConfig::default();
        let jobs: Vec<(String, u64)> = (0..10).map(|i| (format!("h{}", i), i)).collect();
        let job_refs: Vec<(&str, u64)> = jobs.iter().map(|(id, t)| (id.as_str(), *t)).collect();
        let elements = vec![element("hog", "a", 0, &job_refs), element("starver", "b", 5, &[])];

        let mut earlier = elements.clone();
        earlier[1].starving_since = Some(0);
        let now = config.fair_share_starvation_timeout_millis();
        let snapshot = build_tree_snapshot(&earlier, ten_slots(), |_| ten_slots(), &config, now);

        // hog: fair share 0.5 of 10 slots. Oldest 2 jobs (<= 0.25) are safe, next 3 within fair
        // share, the rest above it.
        assert_eq!(snapshot.job_preemption_level("h0"), JobPreemptionLevel::NonPreemptible);
        assert_eq!(snapshot.job_preemption_level("h4"), JobPreemptionLevel::AggressivelyPreemptible);
        assert_eq!(snapshot.job_preemption_level("h9"), JobPreemptionLevel::Preemptible);

        let starver = &snapshot.operations["starver"];
        assert_eq!(starver.starvation_status, StarvationStatus::AggressivelyStarving);
        assert_eq!(starver.preemption_priority, OperationPreemptionPriority::Aggressive);
        assert_eq!(snapshot.operations_by_satisfaction()[0], "starver");

        // Starvation that just began doesn't grant priority yet.
        let fresh = build_tree_snapshot(&elements, ten_slots(), |_| ten_slots(), &config, now);
        assert_eq!(fresh.operations["starver"].starving_since, Some(now));
        assert_eq!(
            fresh.operations["starver"].preemption_priority,
            OperationPreemptionPriority::None
        );
    }
}

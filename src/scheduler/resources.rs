use crate::payloads::Resources;
use std::convert::TryFrom;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Largest amount of any single resource a node may offer or a task may ask for.
pub const MAX_RESOURCE_AMOUNT: i64 = 1 << 50;

/// Resource vector of a job or a node. Components may go negative in intermediate arithmetic
/// (usage minus discounts); limits never are. Arithmetic saturates.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct JobResources {
    pub user_slots: i64,
    pub cpu: i64,
    pub memory: i64,
    pub disk_quota: i64,
    pub gpu: i64,
}

impl JobResources {
    pub fn zero() -> Self {
        JobResources::default()
    }

    fn components(&self) -> [i64; 5] {
        [self.user_slots, self.cpu, self.memory, self.disk_quota, self.gpu]
    }

    fn zip_with(self, other: JobResources, f: impl Fn(i64, i64) -> i64) -> JobResources {
        JobResources {
            user_slots: f(self.user_slots, other.user_slots),
            cpu: f(self.cpu, other.cpu),
            memory: f(self.memory, other.memory),
            disk_quota: f(self.disk_quota, other.disk_quota),
            gpu: f(self.gpu, other.gpu),
        }
    }

    pub fn times(self, n: u64) -> JobResources {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        JobResources {
            user_slots: self.user_slots.saturating_mul(n),
            cpu: self.cpu.saturating_mul(n),
            memory: self.memory.saturating_mul(n),
            disk_quota: self.disk_quota.saturating_mul(n),
            gpu: self.gpu.saturating_mul(n),
        }
    }

    /// Every component lies in `0..=MAX_RESOURCE_AMOUNT`.
    pub fn is_in_bounds(&self) -> bool {
        self.components()
            .iter()
            .all(|c| (0..=MAX_RESOURCE_AMOUNT).contains(c))
    }

    pub fn max(self, other: JobResources) -> JobResources {
        self.zip_with(other, i64::max)
    }

    pub fn min(self, other: JobResources) -> JobResources {
        self.zip_with(other, i64::min)
    }

    /// Largest fraction of `total` this vector takes in any dimension. Dimensions the cluster has
    /// none of are ignored.
    pub fn dominant_share(&self, total: &JobResources) -> f64 {
        self.components()
            .iter()
            .zip(total.components().iter())
            .filter(|(_, t)| **t > 0)
            .map(|(v, t)| *v as f64 / *t as f64)
            .fold(0.0, f64::max)
    }
}

/// True when `lhs >= rhs` in every dimension.
pub fn dominates(lhs: &JobResources, rhs: &JobResources) -> bool {
    lhs.components()
        .iter()
        .zip(rhs.components().iter())
        .all(|(l, r)| l >= r)
}

impl Add for JobResources {
    type Output = JobResources;

    fn add(self, rhs: JobResources) -> JobResources {
        self.zip_with(rhs, i64::saturating_add)
    }
}

impl Sub for JobResources {
    type Output = JobResources;

    fn sub(self, rhs: JobResources) -> JobResources {
        self.zip_with(rhs, i64::saturating_sub)
    }
}

impl AddAssign for JobResources {
    fn add_assign(&mut self, rhs: JobResources) {
        *self = *self + rhs;
    }
}

impl SubAssign for JobResources {
    fn sub_assign(&mut self, rhs: JobResources) {
        *self = *self - rhs;
    }
}

impl From<&Resources> for JobResources {
    fn from(r: &Resources) -> Self {
        JobResources {
            user_slots: r.user_slots,
            cpu: r.cpu,
            memory: r.memory,
            disk_quota: r.disk_quota,
            gpu: r.gpu,
        }
    }
}

impl From<Option<&Resources>> for JobResources {
    fn from(r: Option<&Resources>) -> Self {
        r.map(JobResources::from).unwrap_or_default()
    }
}

impl From<JobResources> for Resources {
    fn from(r: JobResources) -> Self {
        Resources {
            user_slots: r.user_slots,
            cpu: r.cpu,
            memory: r.memory,
            disk_quota: r.disk_quota,
            gpu: r.gpu,
        }
    }
}

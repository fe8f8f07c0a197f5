mod config;
mod fair_share;
mod job_scheduler;
mod resources;
mod scheduler;
mod scheduling_context;
mod tag_filter;

pub use config::SchedulerConfig;
pub use fair_share::JobPreemptionLevel;
pub use fair_share::OperationPreemptionPriority;
pub use job_scheduler::FairShareTreeJobScheduler;
pub use resources::JobResources;
pub use scheduler::OperationState;
pub use scheduler::ReportedJobState;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerError;
pub use scheduler::ABORT_OPERATION;
pub use scheduler::EXEC_NODE_HEARTBEAT;
pub use scheduler::GET_OPERATION;
pub use scheduler::INVALID_OPERATION_SPEC;
pub use scheduler::NO_SUCH_EXEC_NODE;
pub use scheduler::NO_SUCH_OPERATION;
pub use scheduler::OPERATION_ALREADY_EXISTS;
pub use scheduler::REGISTER_EXEC_NODE;
pub use scheduler::START_OPERATION;
pub use scheduling_context::NodeDescriptor;
pub use scheduling_context::SchedulingContext;
pub use tag_filter::SchedulingTagFilter;

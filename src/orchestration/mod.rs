//! Startup ordering, background jobs and health supervision

pub mod cron;
pub mod health;
pub mod lifecycle;
pub mod scheduler;

pub use cron::CronSchedule;
pub use health::{
    aggregate_status, ComponentHealth, ComponentType, HealthMonitor, HealthMonitorConfig, HealthRegistry,
    HealthReport, HealthSnapshot, HealthStatus,
};
pub use lifecycle::{Component, CoreContext, LifecycleManager, Stage};
pub use scheduler::{CatchUpPolicy, FireOutcome, Job, JobStats, JobTask, RetryPolicy, Schedule, Scheduler};

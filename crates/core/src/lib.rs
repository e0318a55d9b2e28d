pub mod config;
pub mod errors;

pub use config::{
    AlertConfig, AppConfig, PipelineConfig, QueueConfig, RedisConfig, SchedulerConfig,
    WorkerConfig,
};
pub use errors::{MonitoringError, MonitoringResult};

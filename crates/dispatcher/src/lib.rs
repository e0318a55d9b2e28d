pub mod cron_utils;
pub mod trigger_registry;

pub use cron_utils::CronScheduler;
pub use trigger_registry::{ScheduleStatus, TriggerRegistry};

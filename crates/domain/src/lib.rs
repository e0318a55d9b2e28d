pub mod entities;
pub mod events;
pub mod messaging;
pub mod ports;

pub use entities::{
    AlertSeverity, AnalysisJob, JobDescriptor, JobStatus, MonitoringParams, Region, RegionPatch,
};
pub use events::{DomainEvent, MonitoringEvent};
pub use messaging::{AnalysisJobQueue, QueueStatsSnapshot};
pub use ports::{
    AnalysisOutcome, AnalysisPipeline, AnalysisRequest, NotificationSink, RegionRepository,
};

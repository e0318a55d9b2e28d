pub mod connection_supervisor;
pub mod job_queue;
pub mod lease;
pub mod notification;
pub mod pipeline_client;
pub mod region_repository;
pub mod retention_sweep;

pub use connection_supervisor::{ConnectionState, RedisConnectionSupervisor};
pub use job_queue::InMemoryJobQueue;
pub use lease::LeaseCoordinator;
pub use notification::RedisNotificationSink;
pub use pipeline_client::{HttpAnalysisPipeline, StubAnalysisPipeline};
pub use region_repository::{AlertRecord, InMemoryRegionRepository};
pub use retention_sweep::RetentionSweeper;

//! 任务队列抽象
//!
//! 至少一次投递语义：同一任务在失败重试下可能执行多次，
//! 下游效果必须幂等。

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use forestshield_core::MonitoringResult;

use crate::entities::{AnalysisJob, JobDescriptor, JobStatus};

/// 各状态的任务计数，纯观测接口
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// 区域分析任务队列
#[automock]
#[async_trait]
pub trait AnalysisJobQueue: Send + Sync {
    /// 追加一个Waiting状态的任务，返回队列分配的序号
    async fn enqueue(&self, descriptor: JobDescriptor) -> MonitoringResult<u64>;

    /// 等待并取出下一个到期的Waiting任务，转为Active并递增尝试次数
    ///
    /// 队列关闭后返回None，消费循环以此退出。
    async fn dequeue(&self) -> Option<AnalysisJob>;

    /// 将任务标记为Completed
    async fn complete(&self, job_id: u64, note: Option<String>) -> MonitoringResult<()>;

    /// 报告执行失败
    ///
    /// 预算未耗尽时转入Delayed并按指数退避安排重试，
    /// 否则进入终态Failed。返回转换后的状态。
    async fn fail(&self, job_id: u64, error: &str) -> MonitoringResult<JobStatus>;

    /// 不可重试的失败，直接进入终态Failed而不消耗重试预算
    async fn fail_terminal(&self, job_id: u64, error: &str) -> MonitoringResult<()>;

    /// 更新进度，单调不减，低于当前值的更新被忽略
    ///
    /// 返回生效后的进度值。
    async fn update_progress(&self, job_id: u64, progress: u8) -> MonitoringResult<u8>;

    /// 移除指定区域所有Waiting/Delayed任务，返回移除数量
    ///
    /// 已经Active的任务不受影响，会运行至完成。
    async fn remove_pending_for_region(&self, region_id: &str) -> usize;

    async fn get_job(&self, job_id: u64) -> Option<AnalysisJob>;

    /// 各状态任务计数，不产生任何状态变更
    async fn stats(&self) -> QueueStatsSnapshot;
}

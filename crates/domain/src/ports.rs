//! 外部协作者端口
//!
//! 区域存储、分析管道、通知出口只在接口边界上被本核心感知，
//! 具体实现由infrastructure或外部系统提供。

use async_trait::async_trait;
use chrono::NaiveDate;
use mockall::automock;
use serde::{Deserialize, Serialize};

use forestshield_core::MonitoringResult;

use crate::entities::{AlertSeverity, Region, RegionPatch};
use crate::events::MonitoringEvent;

/// 分析管道请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub cloud_cover_max: f64,
}

/// 分析管道结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub deforestation_percentage: f64,
    pub images_found: u32,
    pub processing_time_ms: u64,
}

/// 卫星影像分析管道
#[automock]
#[async_trait]
pub trait AnalysisPipeline: Send + Sync {
    /// 对指定坐标和时间窗口执行砍伐分析
    ///
    /// 传输层或领域层的失败均作为任务失败处理，由队列按预算重试。
    async fn analyze(&self, request: AnalysisRequest) -> MonitoringResult<AnalysisOutcome>;
}

/// 区域存储
#[automock]
#[async_trait]
pub trait RegionRepository: Send + Sync {
    async fn get_region(&self, id: &str) -> MonitoringResult<Option<Region>>;

    async fn update_region(&self, id: &str, patch: RegionPatch) -> MonitoringResult<()>;

    async fn create_alert(
        &self,
        region: &Region,
        percentage: f64,
        severity: AlertSeverity,
    ) -> MonitoringResult<()>;
}

/// 通知出口
///
/// fire-and-forget语义：投递失败只记录日志，绝不阻塞或失败任务。
#[automock]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn broadcast(&self, event: &MonitoringEvent);
}

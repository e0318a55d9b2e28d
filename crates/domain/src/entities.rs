use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forestshield_core::AlertConfig;

/// 监测区域
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// 最近一次分析完成时间
    pub last_analysis_at: Option<DateTime<Utc>>,
    /// 最近一次分析得到的砍伐百分比
    pub last_deforestation_percentage: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Region {
    pub fn new(id: impl Into<String>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            latitude,
            longitude,
            last_analysis_at: None,
            last_deforestation_percentage: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 区域状态增量更新
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionPatch {
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub last_deforestation_percentage: Option<f64>,
}

/// 区域监测触发参数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MonitoringParams {
    pub latitude: f64,
    pub longitude: f64,
    /// 卫星影像云量上限（百分比）
    pub cloud_cover_max: f64,
}

/// 入队的任务描述符，由触发器或立即触发请求创建
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub region_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub cloud_cover_max: f64,
}

impl JobDescriptor {
    pub fn from_params(region_id: impl Into<String>, params: &MonitoringParams) -> Self {
        Self {
            region_id: region_id.into(),
            latitude: params.latitude,
            longitude: params.longitude,
            cloud_cover_max: params.cloud_cover_max,
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "DELAYED")]
    Delayed,
}

impl JobStatus {
    /// 终态不再发生任何转换，重试只能经由队列生成新的执行
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// 尚未投递给处理器的状态，stop时可以安全移除
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Active => "ACTIVE",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Delayed => "DELAYED",
        };
        write!(f, "{s}")
    }
}

/// 区域分析任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    /// 队列分配的自增序号
    pub id: u64,
    pub region_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub cloud_cover_max: f64,
    /// 已经开始过的执行次数（含当前执行）
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    /// 单次执行内单调不减，0-100
    pub progress: u8,
    pub error_message: Option<String>,
    /// 完成时的附注（如同区域任务被跳过的原因）
    pub completion_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Delayed状态下的重试调度时间
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn new(id: u64, descriptor: JobDescriptor, max_attempts: u32) -> Self {
        Self {
            id,
            region_id: descriptor.region_id,
            latitude: descriptor.latitude,
            longitude: descriptor.longitude,
            cloud_cover_max: descriptor.cloud_cover_max,
            attempt: 0,
            max_attempts,
            status: JobStatus::Waiting,
            progress: 0,
            error_message: None,
            completion_note: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
        }
    }

    /// 是否还有剩余的重试预算
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// 告警严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertSeverity {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MODERATE")]
    Moderate,
    #[serde(rename = "HIGH")]
    High,
}

impl AlertSeverity {
    /// 按固定阈值划分严重级别，边界采用严格大于比较
    pub fn from_percentage(percentage: f64, thresholds: &AlertConfig) -> Self {
        if percentage > thresholds.high_threshold {
            AlertSeverity::High
        } else if percentage > thresholds.moderate_threshold {
            AlertSeverity::Moderate
        } else {
            AlertSeverity::Low
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Moderate => "MODERATE",
            AlertSeverity::High => "HIGH",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Waiting.is_pending());
        assert!(JobStatus::Delayed.is_pending());
        assert!(!JobStatus::Active.is_pending());
    }

    #[test]
    fn test_new_job_starts_waiting() {
        let descriptor = JobDescriptor {
            region_id: "r-1".to_string(),
            latitude: -3.4653,
            longitude: -62.2159,
            cloud_cover_max: 20.0,
        };
        let job = AnalysisJob::new(1, descriptor, 3);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.progress, 0);
        assert!(job.has_attempts_left());
    }

    #[test]
    fn test_severity_boundaries_are_strict() {
        let thresholds = AlertConfig::default();
        // 恰好等于阈值不升级
        assert_eq!(
            AlertSeverity::from_percentage(10.0, &thresholds),
            AlertSeverity::Moderate
        );
        assert_eq!(
            AlertSeverity::from_percentage(5.0, &thresholds),
            AlertSeverity::Low
        );
        assert_eq!(
            AlertSeverity::from_percentage(10.01, &thresholds),
            AlertSeverity::High
        );
        assert_eq!(
            AlertSeverity::from_percentage(5.01, &thresholds),
            AlertSeverity::Moderate
        );
        assert_eq!(
            AlertSeverity::from_percentage(12.0, &thresholds),
            AlertSeverity::High
        );
        assert_eq!(
            AlertSeverity::from_percentage(3.0, &thresholds),
            AlertSeverity::Low
        );
    }

    #[test]
    fn test_job_status_serde_names() {
        let json = serde_json::to_string(&JobStatus::Delayed).unwrap();
        assert_eq!(json, "\"DELAYED\"");
    }
}

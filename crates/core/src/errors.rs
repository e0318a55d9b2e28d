use thiserror::Error;

/// 监测调度核心错误类型定义
#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error("区域未找到: {id}")]
    RegionNotFound { id: String },

    #[error("分析任务未找到: {id}")]
    JobNotFound { id: u64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("分析管道错误: {0}")]
    Pipeline(String),

    #[error("共享存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("任务队列错误: {0}")]
    Queue(String),

    #[error("任务状态转换无效: 任务 {id} 当前状态为 {status}")]
    InvalidJobTransition { id: u64, status: String },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type MonitoringResult<T> = Result<T, MonitoringError>;

impl MonitoringError {
    /// 判断该错误是否可以通过队列重试恢复
    ///
    /// 区域缺失和CRON/配置错误属于配置性错误，重试不会改变结果，
    /// 处理器对这类错误直接进入终态而不消耗重试预算。
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            MonitoringError::RegionNotFound { .. }
                | MonitoringError::InvalidCron { .. }
                | MonitoringError::Configuration(_)
                | MonitoringError::InvalidJobTransition { .. }
        )
    }
}

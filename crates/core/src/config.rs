use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub alerts: AlertConfig,
    pub pipeline: PipelineConfig,
}

/// 共享存储（Redis）连接配置
///
/// `host` 缺省时系统进入降级模式：租约协调不可用，调度照常进行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: Option<String>,
    pub port: u16,
    pub db: i64,
    pub connection_timeout_seconds: u64,
    /// 单个逻辑连接的最大建连尝试次数
    pub max_retry_attempts: u32,
    /// 建连尝试之间的线性退避基数（秒）
    pub retry_delay_seconds: u64,
    /// 断线后的最大重连次数，超过后需要外部重启
    pub max_reconnect_attempts: u32,
    /// 重连退避基数（秒），实际延迟为 attempt × base，封顶
    pub reconnect_delay_seconds: u64,
    pub reconnect_delay_cap_seconds: u64,
    pub health_check_interval_seconds: u64,
    /// 生命周期事件发布使用的pub/sub频道
    pub notification_channel: String,
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// CRON表达式求值使用的固定时区偏移（小时，东为正）
    pub timezone_offset_hours: i32,
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 每个任务的尝试预算（含首次执行）
    pub max_attempts: u32,
    /// 指数退避基数（秒），第n次重试延迟 base × 2^(n-1)
    pub backoff_base_seconds: u64,
    pub completed_retention_hours: i64,
    pub failed_retention_days: i64,
    pub sweep_interval_seconds: u64,
}

/// 任务处理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 并行执行的分析任务上限
    pub max_concurrent_jobs: usize,
    /// 分析时间窗口（天），start_date = 今天 - 窗口
    pub analysis_window_days: i64,
}

/// 告警阈值配置（百分比，严格大于比较）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub alert_threshold: f64,
    pub moderate_threshold: f64,
    pub high_threshold: f64,
}

/// 分析管道客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 分析管道HTTP端点，缺省时使用桩实现
    pub endpoint: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 6379,
            db: 0,
            connection_timeout_seconds: 10,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
            max_reconnect_attempts: 10,
            reconnect_delay_seconds: 2,
            reconnect_delay_cap_seconds: 30,
            health_check_interval_seconds: 15,
            notification_channel: "forestshield:events".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        // 巴西利亚时间，监测区域集中在亚马逊流域
        Self {
            timezone_offset_hours: -3,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 2,
            completed_retention_hours: 24,
            failed_retention_days: 7,
            sweep_interval_seconds: 3600,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            analysis_window_days: 30,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 3.0,
            moderate_threshold: 5.0,
            high_threshold: 10.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_seconds: 120,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            alerts: AlertConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl RedisConfig {
    /// 构建Redis连接URL
    pub fn connection_url(&self) -> Option<String> {
        self.host
            .as_ref()
            .map(|host| format!("redis://{}:{}/{}", host, self.port, self.db))
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 优先级：显式配置文件 > 默认路径配置文件 > 内置默认值，
    /// 最后叠加 `FORESTSHIELD_` 前缀的环境变量（如
    /// `FORESTSHIELD_REDIS__HOST`）。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder().add_source(
            config::Config::try_from(&defaults).context("序列化默认配置失败")?,
        );

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = [
                "config/forestshield.toml",
                "forestshield.toml",
                "/etc/forestshield/config.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FORESTSHIELD")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("解析配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 校验配置的内部一致性
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(anyhow::anyhow!("queue.max_attempts 必须大于0"));
        }
        if self.worker.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("worker.max_concurrent_jobs 必须大于0"));
        }
        if self.alerts.alert_threshold > self.alerts.moderate_threshold
            || self.alerts.moderate_threshold > self.alerts.high_threshold
        {
            return Err(anyhow::anyhow!(
                "告警阈值必须满足 alert <= moderate <= high"
            ));
        }
        if !(-12..=14).contains(&self.scheduler.timezone_offset_hours) {
            return Err(anyhow::anyhow!(
                "scheduler.timezone_offset_hours 超出有效范围: {}",
                self.scheduler.timezone_offset_hours
            ));
        }
        if self.redis.host.is_some() && self.redis.max_retry_attempts == 0 {
            return Err(anyhow::anyhow!("redis.max_retry_attempts 必须大于0"));
        }
        Ok(())
    }
}

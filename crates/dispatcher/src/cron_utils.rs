use chrono::{DateTime, Duration, FixedOffset, Utc};
use cron::Schedule;
use std::str::FromStr;

use forestshield_core::{MonitoringError, MonitoringResult};

/// CRON表达式解析和触发时间计算工具
///
/// 所有触发时间在配置的固定时区偏移下求值，返回统一换算为UTC。
pub struct CronScheduler {
    schedule: Schedule,
    timezone: FixedOffset,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    ///
    /// 接受5字段（分钟起）和6/7字段（秒起）两种表达式，
    /// 5字段表达式按秒=0补齐。
    pub fn new(cron_expr: &str, timezone_offset_hours: i32) -> MonitoringResult<Self> {
        let normalized = Self::normalize_expression(cron_expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| MonitoringError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;
        let timezone = FixedOffset::east_opt(timezone_offset_hours * 3600).ok_or_else(|| {
            MonitoringError::InvalidCron {
                expr: cron_expr.to_string(),
                message: format!("无效的时区偏移: {timezone_offset_hours}"),
            }
        })?;

        Ok(Self { schedule, timezone })
    }

    /// 获取下一次触发时间（UTC）
    pub fn next_fire_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// 获取从指定时间开始的多个触发时间（UTC）
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .take(count)
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }

    /// 计算下次触发距离现在的时长
    pub fn time_until_next_fire(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_fire_time(now).map(|next| next - now)
    }

    /// 验证CRON表达式是否有效
    pub fn validate_expression(cron_expr: &str) -> MonitoringResult<()> {
        Schedule::from_str(&Self::normalize_expression(cron_expr)).map_err(|e| {
            MonitoringError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }

    fn normalize_expression(cron_expr: &str) -> String {
        let fields = cron_expr.split_whitespace().count();
        if fields == 5 {
            format!("0 {}", cron_expr.trim())
        } else {
            cron_expr.trim().to_string()
        }
    }
}

//! 领域事件
//!
//! 分析任务生命周期事件定义，通过通知接口广播给实时观察者

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::AlertSeverity;

/// 领域事件基础trait
pub trait DomainEvent: Send + Sync {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> String;
}

/// 分析任务生命周期事件
///
/// 终态事件携带足够的上下文，观察者无需回查即可重建结果。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MonitoringEvent {
    AnalysisStarted {
        id: Uuid,
        job_id: u64,
        region_id: String,
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    AnalysisProgress {
        id: Uuid,
        job_id: u64,
        region_id: String,
        progress: u8,
        occurred_at: DateTime<Utc>,
    },
    AnalysisCompleted {
        id: Uuid,
        job_id: u64,
        region_id: String,
        region_name: String,
        deforestation_percentage: f64,
        images_found: u32,
        duration_ms: u64,
        occurred_at: DateTime<Utc>,
    },
    AnalysisFailed {
        id: Uuid,
        job_id: u64,
        region_id: String,
        error_message: String,
        attempt: u32,
        will_retry: bool,
        occurred_at: DateTime<Utc>,
    },
    AnalysisSkipped {
        id: Uuid,
        job_id: u64,
        region_id: String,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    DeforestationAlert {
        id: Uuid,
        region_id: String,
        region_name: String,
        percentage: f64,
        severity: AlertSeverity,
        occurred_at: DateTime<Utc>,
    },
}

impl MonitoringEvent {
    pub fn analysis_started(job_id: u64, region_id: &str, attempt: u32) -> Self {
        MonitoringEvent::AnalysisStarted {
            id: Uuid::new_v4(),
            job_id,
            region_id: region_id.to_string(),
            attempt,
            occurred_at: Utc::now(),
        }
    }

    pub fn analysis_progress(job_id: u64, region_id: &str, progress: u8) -> Self {
        MonitoringEvent::AnalysisProgress {
            id: Uuid::new_v4(),
            job_id,
            region_id: region_id.to_string(),
            progress,
            occurred_at: Utc::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn analysis_completed(
        job_id: u64,
        region_id: &str,
        region_name: &str,
        deforestation_percentage: f64,
        images_found: u32,
        duration_ms: u64,
    ) -> Self {
        MonitoringEvent::AnalysisCompleted {
            id: Uuid::new_v4(),
            job_id,
            region_id: region_id.to_string(),
            region_name: region_name.to_string(),
            deforestation_percentage,
            images_found,
            duration_ms,
            occurred_at: Utc::now(),
        }
    }

    pub fn analysis_failed(
        job_id: u64,
        region_id: &str,
        error_message: &str,
        attempt: u32,
        will_retry: bool,
    ) -> Self {
        MonitoringEvent::AnalysisFailed {
            id: Uuid::new_v4(),
            job_id,
            region_id: region_id.to_string(),
            error_message: error_message.to_string(),
            attempt,
            will_retry,
            occurred_at: Utc::now(),
        }
    }

    pub fn analysis_skipped(job_id: u64, region_id: &str, reason: &str) -> Self {
        MonitoringEvent::AnalysisSkipped {
            id: Uuid::new_v4(),
            job_id,
            region_id: region_id.to_string(),
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn deforestation_alert(
        region_id: &str,
        region_name: &str,
        percentage: f64,
        severity: AlertSeverity,
    ) -> Self {
        MonitoringEvent::DeforestationAlert {
            id: Uuid::new_v4(),
            region_id: region_id.to_string(),
            region_name: region_name.to_string(),
            percentage,
            severity,
            occurred_at: Utc::now(),
        }
    }
}

impl DomainEvent for MonitoringEvent {
    fn event_id(&self) -> Uuid {
        match self {
            MonitoringEvent::AnalysisStarted { id, .. } => *id,
            MonitoringEvent::AnalysisProgress { id, .. } => *id,
            MonitoringEvent::AnalysisCompleted { id, .. } => *id,
            MonitoringEvent::AnalysisFailed { id, .. } => *id,
            MonitoringEvent::AnalysisSkipped { id, .. } => *id,
            MonitoringEvent::DeforestationAlert { id, .. } => *id,
        }
    }

    fn event_type(&self) -> &str {
        match self {
            MonitoringEvent::AnalysisStarted { .. } => "analysis-started",
            MonitoringEvent::AnalysisProgress { .. } => "analysis-progress",
            MonitoringEvent::AnalysisCompleted { .. } => "analysis-completed",
            MonitoringEvent::AnalysisFailed { .. } => "analysis-failed",
            MonitoringEvent::AnalysisSkipped { .. } => "analysis-skipped",
            MonitoringEvent::DeforestationAlert { .. } => "deforestation-alert",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            MonitoringEvent::AnalysisStarted { occurred_at, .. } => *occurred_at,
            MonitoringEvent::AnalysisProgress { occurred_at, .. } => *occurred_at,
            MonitoringEvent::AnalysisCompleted { occurred_at, .. } => *occurred_at,
            MonitoringEvent::AnalysisFailed { occurred_at, .. } => *occurred_at,
            MonitoringEvent::AnalysisSkipped { occurred_at, .. } => *occurred_at,
            MonitoringEvent::DeforestationAlert { occurred_at, .. } => *occurred_at,
        }
    }

    fn aggregate_id(&self) -> String {
        match self {
            MonitoringEvent::AnalysisStarted { region_id, .. } => region_id.clone(),
            MonitoringEvent::AnalysisProgress { region_id, .. } => region_id.clone(),
            MonitoringEvent::AnalysisCompleted { region_id, .. } => region_id.clone(),
            MonitoringEvent::AnalysisFailed { region_id, .. } => region_id.clone(),
            MonitoringEvent::AnalysisSkipped { region_id, .. } => region_id.clone(),
            MonitoringEvent::DeforestationAlert { region_id, .. } => region_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = MonitoringEvent::analysis_started(1, "r-1", 1);
        assert_eq!(event.event_type(), "analysis-started");
        let event = MonitoringEvent::analysis_completed(1, "r-1", "Xingu", 4.2, 12, 1500);
        assert_eq!(event.event_type(), "analysis-completed");
        assert_eq!(event.aggregate_id(), "r-1");
        let event = MonitoringEvent::analysis_skipped(2, "r-1", "重复任务");
        assert_eq!(event.event_type(), "analysis-skipped");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = MonitoringEvent::analysis_failed(7, "r-2", "管道超时", 2, true);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "analysis-failed");
        assert_eq!(json["job_id"], 7);
        assert_eq!(json["will_retry"], true);
    }
}

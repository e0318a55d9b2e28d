use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use forestshield_core::MonitoringResult;
use forestshield_domain::entities::{AlertSeverity, Region, RegionPatch};
use forestshield_domain::ports::RegionRepository;

/// 砍伐告警记录
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub region_id: String,
    pub region_name: String,
    pub percentage: f64,
    pub severity: AlertSeverity,
    pub created_at: DateTime<Utc>,
}

/// 内存区域存储
///
/// 嵌入式部署和测试场景使用；持久化的区域存储是外部协作者，
/// 生产部署通过相同的端口接入。
#[derive(Default)]
pub struct InMemoryRegionRepository {
    regions: RwLock<HashMap<String, Region>>,
    alerts: RwLock<Vec<AlertRecord>>,
}

impl InMemoryRegionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, region: Region) {
        self.regions.write().await.insert(region.id.clone(), region);
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.regions.write().await.remove(id).is_some()
    }

    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl RegionRepository for InMemoryRegionRepository {
    async fn get_region(&self, id: &str) -> MonitoringResult<Option<Region>> {
        Ok(self.regions.read().await.get(id).cloned())
    }

    async fn update_region(&self, id: &str, patch: RegionPatch) -> MonitoringResult<()> {
        let mut regions = self.regions.write().await;
        if let Some(region) = regions.get_mut(id) {
            if let Some(at) = patch.last_analysis_at {
                region.last_analysis_at = Some(at);
            }
            if let Some(pct) = patch.last_deforestation_percentage {
                region.last_deforestation_percentage = Some(pct);
            }
            region.updated_at = Utc::now();
            debug!("区域 {} 状态已更新", id);
        }
        Ok(())
    }

    async fn create_alert(
        &self,
        region: &Region,
        percentage: f64,
        severity: AlertSeverity,
    ) -> MonitoringResult<()> {
        info!(
            "创建告警: 区域 {} 砍伐 {:.2}%，级别 {}",
            region.name, percentage, severity
        );
        self.alerts.write().await.push(AlertRecord {
            region_id: region.id.clone(),
            region_name: region.name.clone(),
            percentage,
            severity,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_update() {
        let repo = InMemoryRegionRepository::new();
        repo.insert(Region::new("r-1", "Xingu", -3.0, -52.0)).await;

        let region = repo.get_region("r-1").await.unwrap().unwrap();
        assert_eq!(region.name, "Xingu");
        assert!(region.last_analysis_at.is_none());

        let now = Utc::now();
        repo.update_region(
            "r-1",
            RegionPatch {
                last_analysis_at: Some(now),
                last_deforestation_percentage: Some(4.5),
            },
        )
        .await
        .unwrap();

        let region = repo.get_region("r-1").await.unwrap().unwrap();
        assert_eq!(region.last_analysis_at, Some(now));
        assert_eq!(region.last_deforestation_percentage, Some(4.5));
    }

    #[tokio::test]
    async fn test_missing_region_is_none() {
        let repo = InMemoryRegionRepository::new();
        assert!(repo.get_region("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alerts_recorded() {
        let repo = InMemoryRegionRepository::new();
        let region = Region::new("r-1", "Xingu", -3.0, -52.0);
        repo.create_alert(&region, 12.0, AlertSeverity::High)
            .await
            .unwrap();

        let alerts = repo.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
        assert_eq!(alerts[0].percentage, 12.0);
    }
}

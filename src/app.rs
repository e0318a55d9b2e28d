use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use forestshield_core::AppConfig;
use forestshield_dispatcher::{ScheduleStatus, TriggerRegistry};
use forestshield_domain::entities::MonitoringParams;
use forestshield_domain::messaging::{AnalysisJobQueue, QueueStatsSnapshot};
use forestshield_domain::ports::{AnalysisPipeline, NotificationSink, RegionRepository};
use forestshield_infrastructure::{
    HttpAnalysisPipeline, InMemoryJobQueue, InMemoryRegionRepository, LeaseCoordinator,
    RedisConnectionSupervisor, RedisNotificationSink, RetentionSweeper, StubAnalysisPipeline,
};
use forestshield_worker::AnalysisJobProcessor;

/// 森林监测应用
///
/// 组装调度核心的全部组件并提供对外门面：
/// 区域监测的启停、调度与队列状态查询、推送流租约协调。
pub struct Application {
    supervisor: Arc<RedisConnectionSupervisor>,
    queue: Arc<InMemoryJobQueue>,
    regions: Arc<InMemoryRegionRepository>,
    triggers: TriggerRegistry,
    processor: Arc<AnalysisJobProcessor>,
    lease: LeaseCoordinator,
    sweeper: Mutex<RetentionSweeper>,
}

impl Application {
    /// 按配置组装所有组件（不启动任何后台任务）
    pub fn new(config: &AppConfig) -> Result<Self> {
        config.validate().context("配置校验失败")?;

        let supervisor = RedisConnectionSupervisor::new(config.redis.clone());
        let queue = Arc::new(InMemoryJobQueue::new(config.queue.clone()));
        let regions = Arc::new(InMemoryRegionRepository::new());

        // 未配置分析管道端点时回退到桩实现
        let pipeline: Arc<dyn AnalysisPipeline> = match &config.pipeline.endpoint {
            Some(endpoint) => Arc::new(
                HttpAnalysisPipeline::new(&config.pipeline, endpoint.clone())
                    .context("创建分析管道客户端失败")?,
            ),
            None => {
                warn!("未配置分析管道端点，使用桩实现");
                Arc::new(StubAnalysisPipeline)
            }
        };

        let notifier: Arc<dyn NotificationSink> = Arc::new(RedisNotificationSink::new(
            Arc::clone(&supervisor),
            config.redis.notification_channel.clone(),
        ));

        let triggers = TriggerRegistry::new(
            queue.clone() as Arc<dyn AnalysisJobQueue>,
            config.scheduler.timezone_offset_hours,
        );

        let processor = AnalysisJobProcessor::new(
            queue.clone() as Arc<dyn AnalysisJobQueue>,
            regions.clone() as Arc<dyn RegionRepository>,
            pipeline,
            notifier,
            config.alerts.clone(),
            config.worker.clone(),
        );

        let lease = LeaseCoordinator::new(Arc::clone(&supervisor));
        let sweeper = Mutex::new(RetentionSweeper::new(queue.clone(), config.queue.clone()));

        Ok(Self {
            supervisor,
            queue,
            regions,
            triggers,
            processor,
            lease,
            sweeper,
        })
    }

    /// 启动后台组件：存储监督器、保留期清扫、worker池
    pub async fn start(&self) {
        self.supervisor.initialize().await;
        self.sweeper.lock().await.start();
        self.processor.start().await;
        info!("森林监测应用已启动，实例 {}", self.lease.instance_id());
    }

    /// 运行直至收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.start().await;
        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号");
        self.shutdown().await;
        Ok(())
    }

    /// 启动（或替换）区域监测
    pub async fn start_monitoring(
        &self,
        region_id: &str,
        cron_expr: &str,
        params: MonitoringParams,
        trigger_immediately: bool,
    ) -> forestshield_core::MonitoringResult<()> {
        self.triggers
            .start(region_id, cron_expr, params, trigger_immediately)
            .await
    }

    /// 停止区域监测并清除其待处理任务
    pub async fn stop_monitoring(&self, region_id: &str) -> bool {
        self.triggers.stop(region_id).await
    }

    pub async fn list_active_schedules(&self) -> Vec<ScheduleStatus> {
        self.triggers.list_active().await
    }

    pub async fn queue_stats(&self) -> QueueStatsSnapshot {
        self.queue.stats().await
    }

    /// 尝试获取推送流的独占租约
    pub async fn claim_stream(&self, stream: &str, ttl_seconds: u64) -> bool {
        self.lease.claim(stream, ttl_seconds).await
    }

    pub async fn refresh_stream_claim(&self, stream: &str, ttl_seconds: u64) -> bool {
        self.lease.refresh(stream, ttl_seconds).await
    }

    pub async fn release_stream(&self, stream: &str) -> bool {
        self.lease.release(stream).await
    }

    pub fn regions(&self) -> &Arc<InMemoryRegionRepository> {
        &self.regions
    }

    pub async fn wait_store_ready(&self, wait: Duration) -> bool {
        self.supervisor.wait_ready(wait).await
    }

    /// 有序停机：触发器 → 队列/worker → 清扫器 → 存储连接
    ///
    /// 先停触发器保证不再有新任务入队，再关闭队列让worker
    /// 把正在执行的任务跑完后退出，最后才断开共享存储。
    pub async fn shutdown(&self) {
        info!("开始有序停机");
        self.triggers.stop_all().await;
        self.queue.close();
        self.processor.stop().await;
        self.sweeper.lock().await.stop().await;
        self.supervisor.shutdown().await;
        info!("森林监测应用已退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forestshield_domain::entities::Region;

    fn test_config() -> AppConfig {
        // 默认配置不含Redis主机，全程降级运行
        AppConfig::default()
    }

    #[tokio::test]
    async fn test_application_wires_without_store() {
        let app = Application::new(&test_config()).unwrap();
        app.start().await;

        assert!(app.list_active_schedules().await.is_empty());
        let stats = app.queue_stats().await;
        assert_eq!(stats.waiting + stats.active, 0);

        // 无存储时租约操作全部拒绝
        assert!(!app.claim_stream("region-updates", 30).await);
        assert!(!app.refresh_stream_claim("region-updates", 30).await);
        assert!(!app.release_stream("region-updates").await);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitoring_lifecycle_through_facade() {
        let app = Application::new(&test_config()).unwrap();
        app.regions()
            .insert(Region::new("r-1", "Tapajós", -4.2, -56.5))
            .await;
        app.start().await;

        app.start_monitoring("r-1", "0 0 * * *", MonitoringParams::default(), true)
            .await
            .unwrap();
        let schedules = app.list_active_schedules().await;
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].region_id, "r-1");

        // 立即触发的任务已入队，等待worker消费
        tokio::time::sleep(Duration::from_millis(500)).await;
        let stats = app.queue_stats().await;
        assert_eq!(stats.completed, 1);

        assert!(app.stop_monitoring("r-1").await);
        assert!(app.list_active_schedules().await.is_empty());

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_at_facade() {
        let app = Application::new(&test_config()).unwrap();
        let result = app
            .start_monitoring("r-1", "not a cron", MonitoringParams::default(), false)
            .await;
        assert!(result.is_err());
        assert!(app.list_active_schedules().await.is_empty());
        app.shutdown().await;
    }
}

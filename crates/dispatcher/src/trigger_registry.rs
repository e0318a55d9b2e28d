use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use forestshield_core::MonitoringResult;
use forestshield_domain::entities::{JobDescriptor, MonitoringParams};
use forestshield_domain::messaging::AnalysisJobQueue;

use crate::cron_utils::CronScheduler;

/// 活跃调度的观测快照
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub region_id: String,
    pub is_running: bool,
    pub next_fire_time: Option<DateTime<Utc>>,
}

struct RegionTrigger {
    cron_expr: String,
    params: MonitoringParams,
    scheduler: Arc<CronScheduler>,
    /// false时触发循环继续运行但跳过入队（维护窗口）
    running: Arc<AtomicBool>,
    last_fired_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// 周期触发器注册表
///
/// 持有区域到活跃CRON触发器的映射。触发器由注册表独占所有，
/// 每个区域同一时刻至多一个触发器；重复start会先原子地停掉旧
/// 触发器。每次触发只向队列追加任务描述符，不直接执行分析。
pub struct TriggerRegistry {
    triggers: RwLock<HashMap<String, RegionTrigger>>,
    queue: Arc<dyn AnalysisJobQueue>,
    /// 全局暂停标志，pause_all/resume_all写入
    paused: AtomicBool,
    timezone_offset_hours: i32,
}

impl TriggerRegistry {
    pub fn new(queue: Arc<dyn AnalysisJobQueue>, timezone_offset_hours: i32) -> Self {
        Self {
            triggers: RwLock::new(HashMap::new()),
            queue,
            paused: AtomicBool::new(false),
            timezone_offset_hours,
        }
    }

    /// 启动（或替换）一个区域的监测触发器
    ///
    /// 已有触发器先被停掉（幂等），替换不清除队列中的待处理任务。
    /// `trigger_immediately` 为真时在正常调度之外同步入队一个任务。
    pub async fn start(
        &self,
        region_id: &str,
        cron_expr: &str,
        params: MonitoringParams,
        trigger_immediately: bool,
    ) -> MonitoringResult<()> {
        let scheduler = Arc::new(CronScheduler::new(cron_expr, self.timezone_offset_hours)?);

        // 原子替换：先摘除旧触发器再插入新触发器
        if self.remove_trigger(region_id).await {
            info!("区域 {} 的旧触发器已停止，准备替换", region_id);
        }

        let running = Arc::new(AtomicBool::new(!self.paused.load(Ordering::SeqCst)));
        let last_fired_at = Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(Self::fire_loop(
            region_id.to_string(),
            params,
            Arc::clone(&scheduler),
            Arc::clone(&self.queue),
            Arc::clone(&running),
            Arc::clone(&last_fired_at),
            shutdown_rx,
        ));

        self.triggers.write().await.insert(
            region_id.to_string(),
            RegionTrigger {
                cron_expr: cron_expr.to_string(),
                params,
                scheduler,
                running,
                last_fired_at,
                shutdown_tx,
                handle,
            },
        );
        info!("区域 {} 开始监测，调度表达式: {}", region_id, cron_expr);

        if trigger_immediately {
            let job_id = self
                .queue
                .enqueue(JobDescriptor::from_params(region_id, &params))
                .await?;
            info!("区域 {} 立即触发一次分析，任务 {}", region_id, job_id);
        }
        Ok(())
    }

    /// 停止一个区域的监测
    ///
    /// 移除触发器并清除队列中该区域所有Waiting/Delayed任务；
    /// 已在执行的任务不受影响，运行至完成。
    pub async fn stop(&self, region_id: &str) -> bool {
        let existed = self.remove_trigger(region_id).await;
        let removed = self.queue.remove_pending_for_region(region_id).await;
        if existed {
            info!(
                "区域 {} 停止监测，清除 {} 个未投递任务",
                region_id, removed
            );
        }
        existed
    }

    /// 停止所有触发器（关闭流程使用），不清除队列
    pub async fn stop_all(&self) {
        let mut triggers = self.triggers.write().await;
        let count = triggers.len();
        for (region_id, trigger) in triggers.drain() {
            let _ = trigger.shutdown_tx.send(());
            trigger.handle.abort();
            debug!("区域 {} 触发器已停止", region_id);
        }
        if count > 0 {
            info!("已停止全部 {} 个触发器", count);
        }
    }

    /// 列出活跃调度的观测快照
    pub async fn list_active(&self) -> Vec<ScheduleStatus> {
        let now = Utc::now();
        let triggers = self.triggers.read().await;
        let mut statuses: Vec<ScheduleStatus> = triggers
            .iter()
            .map(|(region_id, trigger)| ScheduleStatus {
                region_id: region_id.clone(),
                is_running: trigger.running.load(Ordering::SeqCst),
                next_fire_time: trigger.scheduler.next_fire_time(now),
            })
            .collect();
        statuses.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        statuses
    }

    /// 查询某区域当前的触发参数（观测用）
    pub async fn params(&self, region_id: &str) -> Option<(String, MonitoringParams)> {
        self.triggers
            .read()
            .await
            .get(region_id)
            .map(|t| (t.cron_expr.clone(), t.params))
    }

    /// 某区域最近一次触发时间
    pub async fn last_fired_at(&self, region_id: &str) -> Option<DateTime<Utc>> {
        let triggers = self.triggers.read().await;
        let trigger = triggers.get(region_id)?;
        let last_fired = *trigger.last_fired_at.read().await;
        last_fired
    }

    pub async fn active_count(&self) -> usize {
        self.triggers.read().await.len()
    }

    /// 维护窗口：全局暂停触发，保留触发器定义
    pub async fn pause_all(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let triggers = self.triggers.read().await;
        for trigger in triggers.values() {
            trigger.running.store(false, Ordering::SeqCst);
        }
        info!("全部触发器已暂停（{} 个）", triggers.len());
    }

    /// 结束维护窗口，恢复触发
    pub async fn resume_all(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let triggers = self.triggers.read().await;
        for trigger in triggers.values() {
            trigger.running.store(true, Ordering::SeqCst);
        }
        info!("全部触发器已恢复（{} 个）", triggers.len());
    }

    async fn remove_trigger(&self, region_id: &str) -> bool {
        let Some(trigger) = self.triggers.write().await.remove(region_id) else {
            return false;
        };
        let _ = trigger.shutdown_tx.send(());
        trigger.handle.abort();
        true
    }

    /// 触发循环：睡到下一次触发时刻，入队一个任务描述符
    ///
    /// 入队失败只记录日志，调度本身不会因单次失败而终止。
    async fn fire_loop(
        region_id: String,
        params: MonitoringParams,
        scheduler: Arc<CronScheduler>,
        queue: Arc<dyn AnalysisJobQueue>,
        running: Arc<AtomicBool>,
        last_fired_at: Arc<RwLock<Option<DateTime<Utc>>>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            let now = Utc::now();
            let Some(next) = scheduler.next_fire_time(now) else {
                warn!("区域 {} 无法计算下一次触发时间，触发循环退出", region_id);
                return;
            };
            let delay = (next - now).to_std().unwrap_or(StdDuration::ZERO);

            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("区域 {} 触发循环收到关闭信号", region_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    if !running.load(Ordering::SeqCst) {
                        debug!("区域 {} 处于暂停状态，跳过本次触发", region_id);
                        continue;
                    }
                    *last_fired_at.write().await = Some(Utc::now());
                    match queue
                        .enqueue(JobDescriptor::from_params(&region_id, &params))
                        .await
                    {
                        Ok(job_id) => {
                            debug!("区域 {} 定时触发，任务 {} 入队", region_id, job_id);
                        }
                        Err(e) => {
                            warn!("区域 {} 触发入队失败: {}", region_id, e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forestshield_core::QueueConfig;
    use forestshield_infrastructure::InMemoryJobQueue;

    fn params(cloud: f64) -> MonitoringParams {
        MonitoringParams {
            latitude: -3.4653,
            longitude: -62.2159,
            cloud_cover_max: cloud,
        }
    }

    fn registry() -> (TriggerRegistry, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let registry = TriggerRegistry::new(queue.clone() as Arc<dyn AnalysisJobQueue>, -3);
        (registry, queue)
    }

    // 远未来的表达式，测试期间不会自然触发
    const QUIET_CRON: &str = "0 0 1 1 *";

    #[tokio::test]
    async fn test_at_most_one_trigger_per_region() {
        let (registry, _queue) = registry();
        registry
            .start("r-1", QUIET_CRON, params(10.0), false)
            .await
            .unwrap();
        registry
            .start("r-1", QUIET_CRON, params(30.0), false)
            .await
            .unwrap();

        assert_eq!(registry.active_count().await, 1);
        // 重复start后保留最新参数
        let (_, p) = registry.params("r-1").await.unwrap();
        assert_eq!(p.cloud_cover_max, 30.0);
    }

    #[tokio::test]
    async fn test_invalid_cron_leaves_registry_unchanged() {
        let (registry, _queue) = registry();
        registry
            .start("r-1", QUIET_CRON, params(10.0), false)
            .await
            .unwrap();
        assert!(registry
            .start("r-1", "not a cron", params(99.0), false)
            .await
            .is_err());

        assert_eq!(registry.active_count().await, 1);
        let (_, p) = registry.params("r-1").await.unwrap();
        assert_eq!(p.cloud_cover_max, 10.0);
    }

    #[tokio::test]
    async fn test_trigger_immediately_enqueues_one_job() {
        let (registry, queue) = registry();
        registry
            .start("r-1", QUIET_CRON, params(10.0), true)
            .await
            .unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_stop_purges_pending_jobs() {
        let (registry, queue) = registry();
        registry
            .start("r-1", QUIET_CRON, params(10.0), true)
            .await
            .unwrap();
        registry
            .start("r-2", QUIET_CRON, params(10.0), true)
            .await
            .unwrap();

        assert!(registry.stop("r-1").await);
        assert!(!registry.stop("r-1").await); // 幂等

        let stats = queue.stats().await;
        assert_eq!(stats.waiting, 1); // 只剩r-2的任务
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_scheduled_fire_enqueues() {
        let (registry, queue) = registry();
        // 每秒触发
        registry
            .start("r-1", "* * * * * *", params(10.0), false)
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(2500)).await;
        let stats = queue.stats().await;
        assert!(stats.waiting >= 1, "应至少触发一次: {stats:?}");
        assert!(registry.last_fired_at("r-1").await.is_some());
    }

    #[tokio::test]
    async fn test_pause_all_skips_fires_and_resume_restores() {
        let (registry, queue) = registry();
        registry
            .start("r-1", "* * * * * *", params(10.0), false)
            .await
            .unwrap();

        registry.pause_all().await;
        tokio::time::sleep(StdDuration::from_millis(2200)).await;
        assert_eq!(queue.stats().await.waiting, 0);

        // 定义仍然保留
        let statuses = registry.list_active().await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].is_running);

        registry.resume_all().await;
        tokio::time::sleep(StdDuration::from_millis(2500)).await;
        assert!(queue.stats().await.waiting >= 1);
    }

    #[tokio::test]
    async fn test_list_active_reports_next_fire() {
        let (registry, _queue) = registry();
        registry
            .start("r-b", QUIET_CRON, params(10.0), false)
            .await
            .unwrap();
        registry
            .start("r-a", QUIET_CRON, params(10.0), false)
            .await
            .unwrap();

        let statuses = registry.list_active().await;
        assert_eq!(statuses.len(), 2);
        // 按region_id排序
        assert_eq!(statuses[0].region_id, "r-a");
        assert!(statuses[0].is_running);
        assert!(statuses[0].next_fire_time.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_stop_all_clears_triggers_without_purge() {
        let (registry, queue) = registry();
        registry
            .start("r-1", QUIET_CRON, params(10.0), true)
            .await
            .unwrap();
        registry.stop_all().await;

        assert_eq!(registry.active_count().await, 0);
        // stop_all不清除队列
        assert_eq!(queue.stats().await.waiting, 1);
    }
}

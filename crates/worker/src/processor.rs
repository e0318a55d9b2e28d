use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use forestshield_core::{AlertConfig, MonitoringError, MonitoringResult, WorkerConfig};
use forestshield_domain::entities::{AlertSeverity, AnalysisJob, JobStatus, RegionPatch};
use forestshield_domain::events::MonitoringEvent;
use forestshield_domain::messaging::AnalysisJobQueue;
use forestshield_domain::ports::{
    AnalysisPipeline, AnalysisRequest, NotificationSink, RegionRepository,
};

/// 单次执行成功后的结果摘要
struct ExecutionSummary {
    region_name: String,
    deforestation_percentage: f64,
    images_found: u32,
}

/// 区域单飞占位，Drop时释放占用，执行体panic也不会泄漏
struct FlightGuard<'a> {
    regions: &'a StdMutex<HashSet<String>>,
    region_id: String,
}

impl<'a> FlightGuard<'a> {
    /// 占用区域，已被占用时返回None
    fn acquire(regions: &'a StdMutex<HashSet<String>>, region_id: &str) -> Option<Self> {
        let mut running = regions.lock().unwrap_or_else(|e| e.into_inner());
        if running.insert(region_id.to_string()) {
            Some(Self {
                regions,
                region_id: region_id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.regions.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.region_id);
    }
}

/// 区域分析任务处理器
///
/// 从队列消费任务，驱动外部分析管道，更新区域状态并评估告警
/// 阈值。单次执行的状态机为 Pending → Running(进度0..100) →
/// {Completed, Failed}；终态不可逆，重试只能经由队列产生新的执行。
///
/// 并发由固定数量的worker循环限制，约束对下游分析管道的压力。
/// 同一区域同时只有一个任务真正执行，后到的任务被跳过。
pub struct AnalysisJobProcessor {
    queue: Arc<dyn AnalysisJobQueue>,
    regions: Arc<dyn RegionRepository>,
    pipeline: Arc<dyn AnalysisPipeline>,
    notifier: Arc<dyn NotificationSink>,
    alerts: AlertConfig,
    worker_config: WorkerConfig,
    /// 正在执行分析的区域集合（同区域单飞），不跨await持锁
    running_regions: StdMutex<HashSet<String>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalysisJobProcessor {
    pub fn new(
        queue: Arc<dyn AnalysisJobQueue>,
        regions: Arc<dyn RegionRepository>,
        pipeline: Arc<dyn AnalysisPipeline>,
        notifier: Arc<dyn NotificationSink>,
        alerts: AlertConfig,
        worker_config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            regions,
            pipeline,
            notifier,
            alerts,
            worker_config,
            running_regions: StdMutex::new(HashSet::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// 启动worker循环池
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("任务处理器已经在运行");
            return;
        }
        for index in 0..self.worker_config.max_concurrent_jobs {
            let processor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                processor.worker_loop(index).await;
            }));
        }
        info!(
            "任务处理器已启动，{} 个并行worker",
            self.worker_config.max_concurrent_jobs
        );
    }

    /// 等待worker循环退出
    ///
    /// 调用前必须先关闭队列，否则dequeue会一直阻塞。
    pub async fn stop(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("等待worker退出时出错: {}", e);
                }
            }
        }
        info!("任务处理器已停止");
    }

    async fn worker_loop(&self, index: usize) {
        debug!("worker {} 开始消费任务", index);
        while let Some(job) = self.queue.dequeue().await {
            self.process(job).await;
        }
        debug!("worker {} 退出", index);
    }

    /// 处理一个已投递的任务
    ///
    /// 所有执行期错误在此处兜底转换为失败转换并交还队列，
    /// 单个任务的失败绝不导致调度进程崩溃。
    pub async fn process(&self, job: AnalysisJob) {
        let started = Instant::now();

        // 同区域单飞：前一个任务仍在执行时跳过本次执行
        let Some(guard) = FlightGuard::acquire(&self.running_regions, &job.region_id) else {
            debug!(
                "区域 {} 已有任务在执行，跳过任务 {}",
                job.region_id, job.id
            );
            if let Err(e) = self
                .queue
                .complete(job.id, Some("同区域任务仍在执行，跳过".to_string()))
                .await
            {
                warn!("标记跳过任务 {} 失败: {}", job.id, e);
            }
            self.notifier
                .broadcast(&MonitoringEvent::analysis_skipped(
                    job.id,
                    &job.region_id,
                    "同区域任务仍在执行",
                ))
                .await;
            return;
        };

        self.notifier
            .broadcast(&MonitoringEvent::analysis_started(
                job.id,
                &job.region_id,
                job.attempt,
            ))
            .await;

        let outcome = self.execute(&job).await;
        drop(guard);

        match outcome {
            Ok(summary) => {
                self.advance(&job, 100).await;
                if let Err(e) = self.queue.complete(job.id, None).await {
                    warn!("标记任务 {} 完成失败: {}", job.id, e);
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    "任务 {} 完成: 区域 {} 砍伐 {:.2}%，耗时 {}ms",
                    job.id, summary.region_name, summary.deforestation_percentage, duration_ms
                );
                self.notifier
                    .broadcast(&MonitoringEvent::analysis_completed(
                        job.id,
                        &job.region_id,
                        &summary.region_name,
                        summary.deforestation_percentage,
                        summary.images_found,
                        duration_ms,
                    ))
                    .await;
            }
            Err(e) => {
                let message = e.to_string();
                let will_retry = if e.is_retryable() {
                    match self.queue.fail(job.id, &message).await {
                        Ok(status) => status == JobStatus::Delayed,
                        Err(queue_err) => {
                            warn!("报告任务 {} 失败时出错: {}", job.id, queue_err);
                            false
                        }
                    }
                } else {
                    // 配置性错误不消耗重试预算，直接进入终态
                    if let Err(queue_err) = self.queue.fail_terminal(job.id, &message).await {
                        warn!("标记任务 {} 终态失败时出错: {}", job.id, queue_err);
                    }
                    false
                };
                warn!(
                    "任务 {} 第 {} 次执行失败（{}重试）: {}",
                    job.id,
                    job.attempt,
                    if will_retry { "将" } else { "不再" },
                    message
                );
                self.notifier
                    .broadcast(&MonitoringEvent::analysis_failed(
                        job.id,
                        &job.region_id,
                        &message,
                        job.attempt,
                        will_retry,
                    ))
                    .await;
            }
        }
    }

    /// 推进单次执行的粗粒度进度步骤
    async fn execute(&self, job: &AnalysisJob) -> MonitoringResult<ExecutionSummary> {
        self.advance(job, 10).await;

        // 区域已被删除时立即失败，不消耗重试预算
        let region = self
            .regions
            .get_region(&job.region_id)
            .await?
            .ok_or_else(|| MonitoringError::RegionNotFound {
                id: job.region_id.clone(),
            })?;
        self.advance(job, 20).await;

        let end_date = Utc::now().date_naive();
        let start_date = end_date - Duration::days(self.worker_config.analysis_window_days);
        let outcome = self
            .pipeline
            .analyze(AnalysisRequest {
                latitude: job.latitude,
                longitude: job.longitude,
                start_date,
                end_date,
                cloud_cover_max: job.cloud_cover_max,
            })
            .await?;
        self.advance(job, 80).await;

        self.regions
            .update_region(
                &job.region_id,
                RegionPatch {
                    last_analysis_at: Some(Utc::now()),
                    last_deforestation_percentage: Some(outcome.deforestation_percentage),
                },
            )
            .await?;
        self.advance(job, 90).await;

        if outcome.deforestation_percentage > self.alerts.alert_threshold {
            let severity =
                AlertSeverity::from_percentage(outcome.deforestation_percentage, &self.alerts);
            self.regions
                .create_alert(&region, outcome.deforestation_percentage, severity)
                .await?;
            self.notifier
                .broadcast(&MonitoringEvent::deforestation_alert(
                    &region.id,
                    &region.name,
                    outcome.deforestation_percentage,
                    severity,
                ))
                .await;
        }

        Ok(ExecutionSummary {
            region_name: region.name,
            deforestation_percentage: outcome.deforestation_percentage,
            images_found: outcome.images_found,
        })
    }

    async fn advance(&self, job: &AnalysisJob, progress: u8) {
        match self.queue.update_progress(job.id, progress).await {
            Ok(effective) => {
                self.notifier
                    .broadcast(&MonitoringEvent::analysis_progress(
                        job.id,
                        &job.region_id,
                        effective,
                    ))
                    .await;
            }
            Err(e) => warn!("更新任务 {} 进度失败: {}", job.id, e),
        }
    }
}

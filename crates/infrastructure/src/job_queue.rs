use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use forestshield_core::{MonitoringError, MonitoringResult, QueueConfig};
use forestshield_domain::entities::{AnalysisJob, JobDescriptor, JobStatus};
use forestshield_domain::messaging::{AnalysisJobQueue, QueueStatsSnapshot};

/// 内存任务队列实现
///
/// 进程内的至少一次投递队列：Waiting任务按FIFO投递，失败任务按
/// 指数退避转入Delayed，预算耗尽后进入终态Failed。终态任务短暂
/// 保留供巡检，由保留清扫按期限清除。
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    /// 新任务到达时唤醒消费者
    notify: Notify,
    config: QueueConfig,
    closed: AtomicBool,
}

struct QueueState {
    next_id: u64,
    jobs: HashMap<u64, AnalysisJob>,
    /// Waiting任务的FIFO顺序
    waiting: VecDeque<u64>,
}

/// 消费者等待期间检查Delayed任务到期的轮询间隔
const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(200);

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                jobs: HashMap::new(),
                waiting: VecDeque::new(),
            }),
            notify: Notify::new(),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// 关闭队列，消费者在下一次dequeue时退出
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        info!("任务队列已关闭");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 将到期的Delayed任务提升回Waiting，返回提升数量
    ///
    /// 重试任务在到期时刻进入FIFO队尾，而不是回到原始位置。
    pub async fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let promoted = Self::promote_due_locked(&mut state, now);
        if promoted > 0 {
            drop(state);
            self.notify.notify_waiters();
        }
        promoted
    }

    fn promote_due_locked(state: &mut QueueState, now: DateTime<Utc>) -> usize {
        let due: Vec<u64> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Delayed
                    && job.next_attempt_at.is_some_and(|at| at <= now)
            })
            .map(|job| job.id)
            .collect();

        for id in &due {
            if let Some(job) = state.jobs.get_mut(id) {
                job.status = JobStatus::Waiting;
                job.next_attempt_at = None;
                state.waiting.push_back(*id);
                debug!("任务 {} 重试时间已到，重新进入等待队列", id);
            }
        }
        due.len()
    }

    /// 按保留期限清除终态任务，返回(已完成清除数, 失败清除数)
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> (usize, usize) {
        let completed_cutoff = now - chrono::Duration::hours(self.config.completed_retention_hours);
        let failed_cutoff = now - chrono::Duration::days(self.config.failed_retention_days);

        let mut state = self.state.lock().await;
        let expired: Vec<u64> = state
            .jobs
            .values()
            .filter(|job| match (job.status, job.finished_at) {
                (JobStatus::Completed, Some(at)) => at < completed_cutoff,
                (JobStatus::Failed, Some(at)) => at < failed_cutoff,
                _ => false,
            })
            .map(|job| job.id)
            .collect();

        let mut completed_removed = 0;
        let mut failed_removed = 0;
        for id in expired {
            if let Some(job) = state.jobs.remove(&id) {
                match job.status {
                    JobStatus::Completed => completed_removed += 1,
                    JobStatus::Failed => failed_removed += 1,
                    _ => {}
                }
            }
        }

        if completed_removed + failed_removed > 0 {
            debug!(
                "保留清扫移除 {} 个已完成、{} 个失败任务",
                completed_removed, failed_removed
            );
        }
        (completed_removed, failed_removed)
    }

    /// 非阻塞取任务，没有到期的Waiting任务时返回None
    pub async fn try_dequeue(&self) -> Option<AnalysisJob> {
        if self.is_closed() {
            return None;
        }
        let mut state = self.state.lock().await;
        Self::promote_due_locked(&mut state, Utc::now());
        let id = state.waiting.pop_front()?;
        let job = state.jobs.get_mut(&id)?;
        job.status = JobStatus::Active;
        job.attempt += 1;
        job.progress = 0;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }
}

#[async_trait]
impl AnalysisJobQueue for InMemoryJobQueue {
    async fn enqueue(&self, descriptor: JobDescriptor) -> MonitoringResult<u64> {
        if self.is_closed() {
            return Err(MonitoringError::Queue("队列已关闭".to_string()));
        }

        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;

        let job = AnalysisJob::new(id, descriptor, self.config.max_attempts);
        debug!("任务 {} 入队，区域 {}", id, job.region_id);
        state.jobs.insert(id, job);
        state.waiting.push_back(id);
        drop(state);

        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Option<AnalysisJob> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(job) = self.try_dequeue().await {
                return Some(job);
            }
            // 等待新任务通知，同时定期检查Delayed任务是否到期
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(DEQUEUE_POLL_INTERVAL) => {}
            }
        }
    }

    async fn complete(&self, job_id: u64, note: Option<String>) -> MonitoringResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(MonitoringError::JobNotFound { id: job_id })?;

        if job.status != JobStatus::Active {
            return Err(MonitoringError::InvalidJobTransition {
                id: job_id,
                status: job.status.to_string(),
            });
        }
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        job.completion_note = note;
        debug!("任务 {} 完成", job_id);
        Ok(())
    }

    async fn fail(&self, job_id: u64, error: &str) -> MonitoringResult<JobStatus> {
        let mut state = self.state.lock().await;
        let backoff_base = self.config.backoff_base_seconds;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(MonitoringError::JobNotFound { id: job_id })?;

        if job.status != JobStatus::Active {
            return Err(MonitoringError::InvalidJobTransition {
                id: job_id,
                status: job.status.to_string(),
            });
        }
        job.error_message = Some(error.to_string());

        if job.has_attempts_left() {
            // 指数退避：第n次重试延迟 base × 2^(n-1)
            let delay_seconds = backoff_base * 2u64.saturating_pow(job.attempt.saturating_sub(1));
            job.status = JobStatus::Delayed;
            job.next_attempt_at =
                Some(Utc::now() + chrono::Duration::seconds(delay_seconds as i64));
            warn!(
                "任务 {} 第 {} 次执行失败，{} 秒后重试: {}",
                job_id, job.attempt, delay_seconds, error
            );
            Ok(JobStatus::Delayed)
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            warn!(
                "任务 {} 重试预算耗尽（{} 次），进入终态失败: {}",
                job_id, job.max_attempts, error
            );
            Ok(JobStatus::Failed)
        }
    }

    async fn fail_terminal(&self, job_id: u64, error: &str) -> MonitoringResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(MonitoringError::JobNotFound { id: job_id })?;

        if job.status.is_terminal() {
            return Err(MonitoringError::InvalidJobTransition {
                id: job_id,
                status: job.status.to_string(),
            });
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.finished_at = Some(Utc::now());
        warn!("任务 {} 不可重试失败: {}", job_id, error);
        Ok(())
    }

    async fn update_progress(&self, job_id: u64, progress: u8) -> MonitoringResult<u8> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(MonitoringError::JobNotFound { id: job_id })?;

        if job.status == JobStatus::Active {
            // 单调不减，越界和回退的更新被忽略
            job.progress = job.progress.max(progress.min(100));
        }
        Ok(job.progress)
    }

    async fn remove_pending_for_region(&self, region_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let stale: Vec<u64> = state
            .jobs
            .values()
            .filter(|job| job.region_id == region_id && job.status.is_pending())
            .map(|job| job.id)
            .collect();

        for id in &stale {
            state.jobs.remove(id);
        }
        state.waiting.retain(|id| !stale.contains(id));

        if !stale.is_empty() {
            info!("移除区域 {} 的 {} 个未投递任务", region_id, stale.len());
        }
        stale.len()
    }

    async fn get_job(&self, job_id: u64) -> Option<AnalysisJob> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    async fn stats(&self) -> QueueStatsSnapshot {
        let state = self.state.lock().await;
        let mut stats = QueueStatsSnapshot::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Delayed => stats.delayed += 1,
            }
        }
        stats
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{error, info, warn};

use forestshield_core::QueueConfig;

use crate::job_queue::InMemoryJobQueue;

/// 保留清扫服务
///
/// 定期清除超过保留期限的终态任务，同时把到期的Delayed任务
/// 提升回等待队列，防止队列无限增长。
pub struct RetentionSweeper {
    queue: Arc<InMemoryJobQueue>,
    config: QueueConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    sweep_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RetentionSweeper {
    pub fn new(queue: Arc<InMemoryJobQueue>, config: QueueConfig) -> Self {
        Self {
            queue,
            config,
            shutdown_tx: None,
            sweep_handle: None,
        }
    }

    /// 启动清扫服务
    pub fn start(&mut self) {
        if self.sweep_handle.is_some() {
            warn!("保留清扫服务已经在运行");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let queue = Arc::clone(&self.queue);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_seconds.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await; // 首个tick立即完成，跳过

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let promoted = queue.promote_due(now).await;
                        let (completed, failed) = queue.sweep_expired(now).await;
                        if promoted + completed + failed > 0 {
                            info!(
                                "清扫完成: 提升 {} 个重试任务，清除 {} 个已完成、{} 个失败任务",
                                promoted, completed, failed
                            );
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("保留清扫服务收到关闭信号");
                        break;
                    }
                }
            }
        });

        self.sweep_handle = Some(handle);
        info!(
            "保留清扫服务已启动，间隔 {} 秒",
            self.config.sweep_interval_seconds
        );
    }

    /// 停止清扫服务
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.sweep_handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("等待清扫服务退出时出错: {}", e);
                }
            }
        }
        info!("保留清扫服务已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forestshield_domain::entities::JobDescriptor;
    use forestshield_domain::messaging::AnalysisJobQueue;

    #[tokio::test]
    async fn test_sweeper_start_stop() {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        let mut sweeper = RetentionSweeper::new(Arc::clone(&queue), QueueConfig::default());
        sweeper.start();
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_sweeper_promotes_due_retries() {
        let mut config = QueueConfig::default();
        config.sweep_interval_seconds = 1;
        config.backoff_base_seconds = 0; // 立即到期

        let queue = Arc::new(InMemoryJobQueue::new(config.clone()));
        let id = queue
            .enqueue(JobDescriptor {
                region_id: "r-1".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                cloud_cover_max: 20.0,
            })
            .await
            .unwrap();
        queue.try_dequeue().await.unwrap();
        queue.fail(id, "失败一次").await.unwrap();

        let mut sweeper = RetentionSweeper::new(Arc::clone(&queue), config);
        sweeper.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        sweeper.stop().await;

        let job = queue.try_dequeue().await.expect("任务应被提升回等待队列");
        assert_eq!(job.id, id);
        assert_eq!(job.attempt, 2);
    }
}

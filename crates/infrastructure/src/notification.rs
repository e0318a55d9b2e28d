use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use forestshield_domain::events::{DomainEvent, MonitoringEvent};
use forestshield_domain::ports::NotificationSink;

use crate::connection_supervisor::RedisConnectionSupervisor;

/// Publishes lifecycle events to a Redis pub/sub channel.
///
/// Delivery is fire-and-forget: serialization or publish errors are logged
/// and never propagate to the job that produced the event. When the store
/// is degraded the event is traced locally so observers of the log still
/// see the outcome.
pub struct RedisNotificationSink {
    supervisor: Arc<RedisConnectionSupervisor>,
    channel: String,
}

impl RedisNotificationSink {
    pub fn new(supervisor: Arc<RedisConnectionSupervisor>, channel: impl Into<String>) -> Self {
        Self {
            supervisor,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    async fn broadcast(&self, event: &MonitoringEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize {} event: {e}", event.event_type());
                return;
            }
        };

        let Some(mut conn) = self.supervisor.publisher().await else {
            debug!(
                "store degraded, {} event for {} logged only: {payload}",
                event.event_type(),
                event.aggregate_id()
            );
            return;
        };

        let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(receivers) => {
                debug!(
                    "published {} event to '{}' ({} receivers)",
                    event.event_type(),
                    self.channel,
                    receivers
                );
            }
            Err(e) => {
                warn!("failed to publish {} event: {e}", event.event_type());
                self.supervisor.report_failure("notification.publish");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forestshield_core::RedisConfig;

    #[tokio::test]
    async fn test_broadcast_degrades_without_store() {
        let supervisor = RedisConnectionSupervisor::new(RedisConfig::default());
        supervisor.initialize().await;
        let sink = RedisNotificationSink::new(supervisor, "forestshield:events");

        // Must not panic or error while degraded.
        let event = MonitoringEvent::analysis_started(1, "r-1", 1);
        sink.broadcast(&event).await;
    }
}

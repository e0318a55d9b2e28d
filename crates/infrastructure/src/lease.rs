use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection_supervisor::RedisConnectionSupervisor;

const LEASE_KEY_PREFIX: &str = "forestshield:stream:";

/// Distributed mutual exclusion over named stream resources.
///
/// Used by the push-update layer so that exactly one server instance
/// produces updates for a given stream in a horizontally scaled
/// deployment. Correctness relies entirely on the store's atomic
/// `SET NX EX`; no in-process locking is involved.
///
/// Failure policy: any store unavailability makes claim/refresh/release
/// return false instead of raising. Callers must degrade to "assume not
/// owner": under-production is safe, duplicate production is not.
pub struct LeaseCoordinator {
    supervisor: Arc<RedisConnectionSupervisor>,
    instance_id: String,
}

impl LeaseCoordinator {
    pub fn new(supervisor: Arc<RedisConnectionSupervisor>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let instance_id = format!("{host}-{}", &Uuid::new_v4().to_string()[..8]);
        Self {
            supervisor,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Attempts to establish new ownership of `key` for `ttl_seconds`.
    ///
    /// Single atomic `SET key value NX EX ttl` round trip. Returns true iff
    /// this call created the lease; false when another instance holds it or
    /// the store is unavailable. A false return is an expected, frequent
    /// outcome under multi-instance contention, not an error.
    pub async fn claim(&self, key: &str, ttl_seconds: u64) -> bool {
        let Some(mut conn) = self.supervisor.command().await else {
            debug!("claim({key}) unavailable, store not ready");
            return false;
        };

        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(Self::lease_key(key))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => {
                debug!("claimed stream '{key}' for {ttl_seconds}s");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("claim({key}) failed: {e}");
                self.supervisor.report_failure("lease.claim");
                false
            }
        }
    }

    /// Unconditionally resets the lease with a fresh TTL.
    ///
    /// Does NOT verify prior ownership: an instance that silently lost the
    /// lease after expiry could re-acquire it here. Callers must pair
    /// refresh with a liveness cadence shorter than the TTL.
    pub async fn refresh(&self, key: &str, ttl_seconds: u64) -> bool {
        let Some(mut conn) = self.supervisor.command().await else {
            debug!("refresh({key}) unavailable, store not ready");
            return false;
        };

        let result: redis::RedisResult<String> = redis::cmd("SET")
            .arg(Self::lease_key(key))
            .arg(&self.instance_id)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("refresh({key}) failed: {e}");
                self.supervisor.report_failure("lease.refresh");
                false
            }
        }
    }

    /// Deletes the lease key, making the resource immediately claimable.
    pub async fn release(&self, key: &str) -> bool {
        let Some(mut conn) = self.supervisor.command().await else {
            debug!("release({key}) unavailable, store not ready");
            return false;
        };

        let result: redis::RedisResult<i64> = redis::cmd("DEL")
            .arg(Self::lease_key(key))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(deleted) => {
                debug!("released stream '{key}' (existed: {})", deleted > 0);
                true
            }
            Err(e) => {
                warn!("release({key}) failed: {e}");
                self.supervisor.report_failure("lease.release");
                false
            }
        }
    }

    fn lease_key(key: &str) -> String {
        format!("{LEASE_KEY_PREFIX}{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forestshield_core::RedisConfig;

    #[tokio::test]
    async fn test_claim_false_without_store() {
        // No host configured: coordination degraded, never an owner.
        let supervisor = RedisConnectionSupervisor::new(RedisConfig::default());
        supervisor.initialize().await;
        let lease = LeaseCoordinator::new(supervisor);

        assert!(!lease.claim("region-updates", 30).await);
        assert!(!lease.refresh("region-updates", 30).await);
        assert!(!lease.release("region-updates").await);
    }

    #[tokio::test]
    async fn test_instance_id_contains_hostname_suffix() {
        let supervisor = RedisConnectionSupervisor::new(RedisConfig::default());
        let lease = LeaseCoordinator::new(supervisor);
        // hostname plus an 8-char uuid fragment
        assert!(lease.instance_id().len() > 8);
        assert!(lease.instance_id().contains('-'));
    }

    #[test]
    fn test_lease_key_prefixed() {
        assert_eq!(
            LeaseCoordinator::lease_key("alerts"),
            "forestshield:stream:alerts"
        );
    }
}

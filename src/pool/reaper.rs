//! Idle reclamation and the min-idle floor.

use std::{sync::Arc, time::Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ContainerStatus, MinIdlePolicy, Pool};
use crate::runtime::ContainerHandle;

impl Pool {
    /// Run the reaper loop. Call this from a spawned task.
    pub async fn run_reaper(self: Arc<Self>, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reaper_interval);
        // The first tick fires immediately; nothing can be expired yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!(function = %self.name(), "Reaper loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    self.reap_idle().await;
                }
            }
        }
    }

    /// One sweep: remove containers idle for longer than the idle timeout.
    /// Returns the number removed.
    ///
    /// Under [`MinIdlePolicy::Prewarm`] the sweep keeps `min_idle` idle
    /// containers, reaping the longest-idle ones first, and then provisions
    /// back up to the floor.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let victims: Vec<ContainerHandle> = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            let idle = state.containers.count(ContainerStatus::Idle);
            let idle_timeout = self.config.idle_timeout;
            let mut expired: Vec<_> = state
                .containers
                .values_mut()
                .filter(|c| c.is_idle_expired(now, idle_timeout))
                .collect();
            if self.config.min_idle_policy == MinIdlePolicy::Prewarm {
                expired.sort_by_key(|c| c.last_active);
                expired.truncate(idle.saturating_sub(self.config.min_idle));
            }
            expired
                .into_iter()
                .filter_map(|record| {
                    record
                        .transition(ContainerStatus::Removing)
                        .ok()
                        .map(|_| record.handle.clone())
                })
                .collect()
        };

        let mut reaped = 0;
        if !victims.is_empty() {
            info!(
                function = %self.name(),
                count = victims.len(),
                "Reaping idle containers"
            );
            reaped = join_all(victims.into_iter().map(|h| self.teardown(h)))
                .await
                .into_iter()
                .filter(|removed| *removed)
                .count();
            self.metrics
                .containers_reaped
                .add(reaped as u64, &self.labels());
        }

        self.prewarm().await;
        reaped
    }

    /// Provision idle containers up to the min-idle floor. Does nothing unless
    /// the pool uses [`MinIdlePolicy::Prewarm`]. Returns the number of
    /// containers that became ready.
    pub async fn prewarm(&self) -> usize {
        if self.config.min_idle_policy != MinIdlePolicy::Prewarm {
            return 0;
        }
        let needed = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            let have = state.containers.count(ContainerStatus::Idle) + state.prewarming;
            let needed = self.config.min_idle.saturating_sub(have);
            state.prewarming += needed;
            needed
        };
        if needed == 0 {
            return 0;
        }

        info!(function = %self.name(), count = needed, "Pre-warming containers");
        let results = join_all((0..needed).map(|_| async {
            let result = self.provision(ContainerStatus::Idle).await;
            self.lock().prewarming -= 1;
            result
        }))
        .await;

        let mut ready = 0;
        for result in results {
            match result {
                Ok(_) => ready += 1,
                Err(e) => warn!(function = %self.name(), error = %e, "Pre-warm failed"),
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        health::HealthProber,
        metrics::Metrics,
        pool::PoolConfig,
        testing::{test_pool_config, MockRuntime},
    };

    fn new_pool(runtime: &Arc<MockRuntime>, config: PoolConfig) -> Arc<Pool> {
        Arc::new(Pool::new(
            config,
            runtime.clone(),
            HealthProber::new(),
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test]
    async fn test_reaps_only_expired_idle() {
        let runtime = Arc::new(MockRuntime::new());
        let mut config = test_pool_config("matmul");
        config.idle_timeout = Duration::from_millis(100);
        let pool = new_pool(&runtime, config);

        let idle = pool.acquire().await.unwrap();
        let busy = pool.acquire().await.unwrap();
        idle.release();

        // not expired yet
        assert_eq!(pool.reap_idle().await, 0);
        assert_eq!(pool.status().total, 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.reap_idle().await, 1);
        let status = pool.status();
        assert_eq!((status.total, status.busy, status.idle), (1, 1, 0));
        assert_eq!(runtime.stopped(), 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_prewarm_fills_floor() {
        let runtime = Arc::new(MockRuntime::new());
        let mut config = test_pool_config("svd_compute");
        config.min_idle = 2;
        config.min_idle_policy = MinIdlePolicy::Prewarm;
        let pool = new_pool(&runtime, config);

        assert_eq!(pool.prewarm().await, 2);
        assert_eq!(pool.status().idle, 2);
        // already at the floor
        assert_eq!(pool.prewarm().await, 0);
        assert_eq!(runtime.started(), 2);
    }

    #[tokio::test]
    async fn test_prewarm_never_reaps_below_floor() {
        let runtime = Arc::new(MockRuntime::new());
        let mut config = test_pool_config("svd_compute");
        config.min_idle = 1;
        config.min_idle_policy = MinIdlePolicy::Prewarm;
        config.idle_timeout = Duration::from_millis(50);
        let pool = new_pool(&runtime, config);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        a.release();
        b.release();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.reap_idle().await, 1);
        let status = pool.status();
        assert_eq!((status.total, status.idle), (1, 1));
        assert_eq!(runtime.started(), 2);
    }

    #[tokio::test]
    async fn test_hint_policy_does_not_prewarm() {
        let runtime = Arc::new(MockRuntime::new());
        let mut config = test_pool_config("svd_start");
        config.min_idle = 3;
        let pool = new_pool(&runtime, config);
        assert_eq!(pool.prewarm().await, 0);
        assert_eq!(pool.reap_idle().await, 0);
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn test_reaper_loop_stops_on_cancel() {
        let runtime = Arc::new(MockRuntime::new());
        let mut config = test_pool_config("matmul");
        config.idle_timeout = Duration::from_millis(20);
        config.reaper_interval = Duration::from_millis(30);
        let pool = new_pool(&runtime, config);
        pool.acquire().await.unwrap().release();

        let cancel = CancellationToken::new();
        let reaper = tokio::spawn(pool.clone().run_reaper(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.status().total, 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), reaper)
            .await
            .unwrap()
            .unwrap();
    }
}

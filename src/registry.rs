use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    health::HealthProber,
    metrics::Metrics,
    pool::{MinIdlePolicy, Pool, PoolConfig},
    runtime::ContainerRuntime,
};

pub enum CreateOutcome {
    Created(Arc<Pool>),
    /// A pool with that name already existed; the new config was ignored.
    Exists(Arc<Pool>),
}

#[cfg(test)]
impl CreateOutcome {
    pub fn pool(&self) -> &Arc<Pool> {
        match self {
            CreateOutcome::Created(pool) | CreateOutcome::Exists(pool) => pool,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// All pools of this process, keyed by function name.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    runtime: Arc<dyn ContainerRuntime>,
    prober: HealthProber,
    metrics: Arc<Metrics>,
    cancel_token: CancellationToken,
}

impl PoolRegistry {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        prober: HealthProber,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            runtime,
            prober,
            metrics,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Create the pool for `config.function_name` unless one exists. A new
    /// pool gets a reaper task and, under the prewarm policy, starts filling
    /// its min-idle floor.
    pub fn create(&self, config: PoolConfig) -> CreateOutcome {
        let pool = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = pools.get(&config.function_name) {
                return CreateOutcome::Exists(existing.clone());
            }
            let pool = Arc::new(Pool::new(
                config,
                self.runtime.clone(),
                self.prober.clone(),
                self.metrics.clone(),
            ));
            pools.insert(pool.name().to_string(), pool.clone());
            pool
        };

        let pool_config = pool.config();
        info!(
            function = %pool.name(),
            image = %pool_config.image,
            host_port_start = pool_config.host_port_start,
            idle_timeout_secs = pool_config.idle_timeout.as_secs(),
            min_idle = pool_config.min_idle,
            min_idle_policy = ?pool_config.min_idle_policy,
            event = "pool_created",
            "Created pool"
        );

        tokio::spawn(pool.clone().run_reaper(self.cancel_token.child_token()));
        if pool_config.min_idle_policy == MinIdlePolicy::Prewarm {
            let prewarm_pool = pool.clone();
            tokio::spawn(async move {
                prewarm_pool.prewarm().await;
            });
        }
        CreateOutcome::Created(pool)
    }

    pub fn get(&self, function_name: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function_name)
            .cloned()
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Remove managed containers a previous process left behind.
    pub async fn cleanup_orphans(&self) -> usize {
        let names = match self.runtime.list_managed().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list managed containers");
                return 0;
            }
        };
        let mut removed = 0;
        for name in names {
            match self.runtime.remove_by_name(&name).await {
                Ok(()) => {
                    info!(container = %name, "Removed orphaned container");
                    removed += 1;
                }
                Err(e) => warn!(container = %name, error = %e, "Failed to remove orphan"),
            }
        }
        removed
    }

    /// Stop every reaper, then every container of every pool.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let pools: Vec<Arc<Pool>> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        info!(pools = pools.len(), "Shutting down pools");
        join_all(pools.iter().map(|pool| pool.shutdown())).await;
    }
}

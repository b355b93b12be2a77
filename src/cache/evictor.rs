use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::BeaconCache;
use crate::config::CacheConfig;
use crate::providers::TimingProvider;

/// Background task running periodic age and memory eviction passes.
pub struct CacheEvictor {
    cache: Arc<BeaconCache>,
    timing: Arc<dyn TimingProvider>,
    cfg: CacheConfig,
}

impl CacheEvictor {
    pub fn new(cache: Arc<BeaconCache>, timing: Arc<dyn TimingProvider>, cfg: CacheConfig) -> Self {
        Self { cache, timing, cfg }
    }

    /// Spawns the eviction loop; it stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.cfg.eviction_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cache evictor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.cache.run_eviction(
                            self.timing.now_millis(),
                            self.cfg.max_record_age,
                            self.cfg.lower_memory_bound,
                            self.cfg.upper_memory_bound,
                        );
                    }
                }
            }
        })
    }
}

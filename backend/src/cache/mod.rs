use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::AppResult;
use crate::metrics::counters::Counters;
use crate::runner::UnitFactory;
use crate::spark::Spark;
use crate::spark::types::ModuleHandle;

/// Bounded in-memory cache of replica pools keyed by module version id.
///
/// Guarantees:
/// - At most `capacity` pools are resident.
/// - Eviction is FIFO by insertion order; `get` never promotes an entry.
/// - An evicted pool leaves the map inside the critical section and is
///   disposed afterwards, so a concurrent `get` can never observe it.
pub struct ModelCache {
    /// Max pools held in memory.
    capacity: usize,
    factory: Arc<dyn UnitFactory>,
    queue_capacity: usize,
    counters: Counters,

    /// Pool storage by version id.
    map: Mutex<HashMap<String, Arc<Spark>>>,
    /// Insertion order (oldest at the front).
    order: Mutex<VecDeque<String>>,
}

impl ModelCache {
    pub fn new(
        capacity: usize,
        factory: Arc<dyn UnitFactory>,
        queue_capacity: usize,
        counters: Counters,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            factory,
            queue_capacity,
            counters,
            map: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, version_id: &str) -> bool {
        self.map.lock().contains_key(version_id)
    }

    /// Version ids in insertion order, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.order.lock().iter().cloned().collect()
    }

    /// Returns the cached pool. Never loads and never reorders.
    pub fn get(&self, version_id: &str) -> Option<Arc<Spark>> {
        let hit = self.map.lock().get(version_id).cloned();
        match hit {
            Some(spark) => {
                Counters::incr(&self.counters.cache_hits);
                Some(spark)
            }
            None => {
                Counters::incr(&self.counters.cache_misses);
                debug!(version_id, "no pool cached for version");
                None
            }
        }
    }

    /// Creates and caches a pool for `handle`, evicting the oldest entry when
    /// at capacity. Returns the resident pool if one already exists.
    #[instrument(skip(self, handle), target = "cache", fields(version_id = %handle.version_id))]
    pub async fn put(&self, handle: ModuleHandle) -> AppResult<Arc<Spark>> {
        let existing = self.map.lock().get(&handle.version_id).cloned();
        if let Some(existing) = existing {
            warn!("pool already cached");
            return Ok(existing);
        }

        // Loading happens outside the lock; a failure leaves the cache untouched.
        let version_id = handle.version_id.clone();
        let spark = Arc::new(Spark::create(handle, self.factory.as_ref(), self.queue_capacity).await?);

        let (resident, victims) = {
            let mut map = self.map.lock();
            let mut order = self.order.lock();

            if let Some(winner) = map.get(&version_id).cloned() {
                // A concurrent put got here first; ours is surplus.
                (winner, vec![spark])
            } else {
                let mut victims = Vec::new();
                while map.len() >= self.capacity {
                    let Some(oldest) = order.pop_front() else {
                        break;
                    };
                    if let Some(evicted) = map.remove(&oldest) {
                        Counters::incr(&self.counters.cache_evictions);
                        info!(
                            evicted_id = %oldest,
                            cache_size = map.len(),
                            "cache capacity reached; evicted oldest pool"
                        );
                        victims.push(evicted);
                    }
                }

                map.insert(version_id.clone(), spark.clone());
                order.push_back(version_id.clone());
                debug!(cache_size = map.len(), "pool cached");
                (spark, victims)
            }
        };

        for victim in victims {
            dispose_quietly(&victim).await;
        }

        Ok(resident)
    }

    /// Removes and disposes the pool for `version_id`, if cached.
    #[instrument(skip(self), target = "cache")]
    pub async fn remove(&self, version_id: &str) -> bool {
        let removed = {
            let mut map = self.map.lock();
            let mut order = self.order.lock();
            order.retain(|id| id != version_id);
            map.remove(version_id)
        };

        match removed {
            Some(spark) => {
                dispose_quietly(&spark).await;
                info!("pool removed from cache");
                true
            }
            None => false,
        }
    }

    /// Disposes every cached pool.
    #[instrument(skip(self), target = "cache")]
    pub async fn clear(&self) {
        let drained: Vec<Arc<Spark>> = {
            let mut map = self.map.lock();
            self.order.lock().clear();
            map.drain().map(|(_, spark)| spark).collect()
        };

        let count = drained.len();
        for spark in drained {
            dispose_quietly(&spark).await;
        }

        info!(count, "model cache cleared");
    }
}

/// Best-effort disposal: failures are logged, never propagated.
async fn dispose_quietly(spark: &Spark) {
    if let Err(e) = spark.dispose().await {
        warn!(
            version_id = %spark.version_id(),
            error = %format!("{e:#}"),
            "failed to dispose replica pool"
        );
    }
}

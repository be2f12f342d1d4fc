//! Ambient telemetry: prometheus counters/gauges/histograms for the pool,
//! the unit registry, and the image cache.
//!
//! A `prometheus::Registry` owning one struct per subsystem (`opts!` and
//! `histogram_opts!` for the individual collectors), exported as plain text
//! via `export_text`. Hosting an HTTP endpoint for that text is an outer
//! surface this module deliberately doesn't own — it only registers and
//! exports, leaving hosting to the embedding application.

use prometheus::{histogram_opts, opts, Encoder, Gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder};

use crate::error::{PoolError, PoolResult};

/// Task-scheduling counters and histograms.
pub struct TaskMetrics {
    /// Tasks submitted, regardless of outcome.
    pub submitted_total: IntCounter,
    /// Tasks that reached `Completed`.
    pub completed_total: IntCounter,
    /// Tasks that reached `Failed`.
    pub failed_total: IntCounter,
    /// Tasks that reached `Cancelled`.
    pub cancelled_total: IntCounter,
    /// Retry attempts armed, by attempt number.
    pub retries_total: IntCounterVec,
    /// Tasks routed to the dead-letter queue.
    pub dead_lettered_total: IntCounter,
    /// Wall-clock duration of completed tasks, by unit kind.
    pub duration_seconds: HistogramVec,
    /// Queue depth sampled at dispatch time.
    pub queue_depth: Gauge,
}

impl TaskMetrics {
    fn new() -> PoolResult<Self> {
        Ok(Self {
            submitted_total: IntCounter::with_opts(opts!("pool_tasks_submitted_total", "Total tasks submitted")).map_err(prom_err)?,
            completed_total: IntCounter::with_opts(opts!("pool_tasks_completed_total", "Total tasks completed")).map_err(prom_err)?,
            failed_total: IntCounter::with_opts(opts!("pool_tasks_failed_total", "Total tasks failed")).map_err(prom_err)?,
            cancelled_total: IntCounter::with_opts(opts!("pool_tasks_cancelled_total", "Total tasks cancelled")).map_err(prom_err)?,
            retries_total: IntCounterVec::new(
                opts!("pool_task_retries_total", "Retry attempts armed"),
                &["attempt"],
            )
            .map_err(prom_err)?,
            dead_lettered_total: IntCounter::with_opts(opts!("pool_tasks_dead_lettered_total", "Tasks moved to the dead-letter queue")).map_err(prom_err)?,
            duration_seconds: HistogramVec::new(
                histogram_opts!("pool_task_duration_seconds", "Task duration in seconds"),
                &["unit_kind"],
            )
            .map_err(prom_err)?,
            queue_depth: Gauge::with_opts(opts!("pool_task_queue_depth", "Pending tasks in the queue")).map_err(prom_err)?,
        })
    }

    fn register(&self, registry: &Registry) -> PoolResult<()> {
        registry.register(Box::new(self.submitted_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.completed_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.failed_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.cancelled_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.retries_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.dead_lettered_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.duration_seconds.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.queue_depth.clone())).map_err(prom_err)?;
        Ok(())
    }
}

/// Execution-unit pool counters.
pub struct UnitMetrics {
    /// Units currently registered, by kind.
    pub units_total: IntCounterVec,
    /// Units spawned over the lifetime of the process.
    pub units_spawned_total: IntCounter,
    /// Units reaped for being idle past their kind's timeout.
    pub units_reaped_total: IntCounter,
    /// Circuit breaker trips, by kind.
    pub circuit_opens_total: IntCounterVec,
}

impl UnitMetrics {
    fn new() -> PoolResult<Self> {
        Ok(Self {
            units_total: IntCounterVec::new(opts!("pool_units_total", "Units registered"), &["kind", "state"]).map_err(prom_err)?,
            units_spawned_total: IntCounter::with_opts(opts!("pool_units_spawned_total", "Units spawned")).map_err(prom_err)?,
            units_reaped_total: IntCounter::with_opts(opts!("pool_units_reaped_total", "Idle units reaped")).map_err(prom_err)?,
            circuit_opens_total: IntCounterVec::new(opts!("pool_unit_circuit_opens_total", "Circuit breaker trips"), &["kind"]).map_err(prom_err)?,
        })
    }

    fn register(&self, registry: &Registry) -> PoolResult<()> {
        registry.register(Box::new(self.units_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.units_spawned_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.units_reaped_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.circuit_opens_total.clone())).map_err(prom_err)?;
        Ok(())
    }
}

/// Image cache counters.
pub struct CacheMetrics {
    /// In-memory tier hits.
    pub memory_hits_total: IntCounter,
    /// Persistent tier hits (promoted into memory on hit).
    pub persistent_hits_total: IntCounter,
    /// Misses across both tiers.
    pub misses_total: IntCounter,
    /// Entries written to the persistent tier.
    pub writes_total: IntCounter,
}

impl CacheMetrics {
    fn new() -> PoolResult<Self> {
        Ok(Self {
            memory_hits_total: IntCounter::with_opts(opts!("pool_cache_memory_hits_total", "In-memory cache hits")).map_err(prom_err)?,
            persistent_hits_total: IntCounter::with_opts(opts!("pool_cache_persistent_hits_total", "Persistent cache hits")).map_err(prom_err)?,
            misses_total: IntCounter::with_opts(opts!("pool_cache_misses_total", "Cache misses")).map_err(prom_err)?,
            writes_total: IntCounter::with_opts(opts!("pool_cache_writes_total", "Cache writes")).map_err(prom_err)?,
        })
    }

    fn register(&self, registry: &Registry) -> PoolResult<()> {
        registry.register(Box::new(self.memory_hits_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.persistent_hits_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.misses_total.clone())).map_err(prom_err)?;
        registry.register(Box::new(self.writes_total.clone())).map_err(prom_err)?;
        Ok(())
    }
}

/// Aggregate metrics registry for the whole runtime.
pub struct Metrics {
    registry: Registry,
    /// Task-scheduling metrics.
    pub tasks: TaskMetrics,
    /// Unit-pool metrics.
    pub units: UnitMetrics,
    /// Image cache metrics.
    pub cache: CacheMetrics,
}

impl Metrics {
    /// Build and register every metric family on a fresh registry.
    pub fn new() -> PoolResult<Self> {
        let registry = Registry::new();
        let tasks = TaskMetrics::new()?;
        let units = UnitMetrics::new()?;
        let cache = CacheMetrics::new()?;
        tasks.register(&registry)?;
        units.register(&registry)?;
        cache.register(&registry)?;
        Ok(Self { registry, tasks, units, cache })
    }

    /// Render every registered metric in the Prometheus text exposition
    /// format. The embedding application is responsible for serving this
    /// over HTTP (or anywhere else) — no outer metrics-service surface is
    /// owned by this crate.
    pub fn export_text(&self) -> PoolResult<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).map_err(|e| PoolError::Internal(format!("metrics encode: {e}")))?;
        String::from_utf8(buf).map_err(|e| PoolError::Internal(format!("metrics encode: {e}")))
    }
}

fn prom_err(e: prometheus::Error) -> PoolError {
    PoolError::Internal(format!("prometheus: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.tasks.submitted_total.inc();
        metrics.cache.memory_hits_total.inc();
        let text = metrics.export_text().unwrap();
        assert!(text.contains("pool_tasks_submitted_total"));
        assert!(text.contains("pool_cache_memory_hits_total"));
    }
}

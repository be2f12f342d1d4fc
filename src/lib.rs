//! In-process worker pool runtime: a priority-aware task scheduler driving
//! a dynamically sized pool of background execution units, a timeout/retry
//! controller, a per-pool task queue, a command protocol for driving
//! OffscreenCanvas-style render units, and a two-tier image result cache
//! with discrete-scale quantization.
//!
//! One supervisor task ([`pool::WorkerPool`]) owns all mutable scheduling
//! state; execution units are independent tasks communicating only by
//! message passing, never shared memory. No GUI, no cross-process RPC, no
//! cluster distribution — see `SPEC_FULL.md` for the full module ledger.

pub mod cache;
pub mod canvas;
pub mod config;
pub mod error;
pub mod events;
pub mod image;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod task;
pub mod timeout;
pub mod unit;

pub use config::RuntimeConfig;
pub use error::{PoolError, PoolResult, TaskFailure};
pub use image::ImageProcessor;
pub use pool::{PoolStats, Submission, WorkerPool};
pub use task::{Priority, Task, TaskId, TaskOptions, TaskStatus};
pub use unit::{default_unit_factory, ExecutionUnit, UnitFactory};

/// Convenience builder assembling a [`WorkerPool`] (and, optionally, an
/// [`ImageProcessor`] layered over its own pool) from a [`RuntimeConfig`].
///
/// Config goes in, a fully wired runtime comes out: the scheduler, and,
/// if asked, the image-processing facade layered over it. This crate has
/// no other outer services to start.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    unit_factory: Option<UnitFactory>,
}

impl RuntimeBuilder {
    /// Start from a loaded [`RuntimeConfig`].
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config, unit_factory: None }
    }

    /// Start from defaults, equivalent to `RuntimeConfig::default()`.
    pub fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default())
    }

    /// Override the unit factory; defaults to [`default_unit_factory`] when
    /// not called.
    pub fn unit_factory(mut self, factory: UnitFactory) -> Self {
        self.unit_factory = Some(factory);
        self
    }

    /// Install a `tracing_subscriber` formatter honoring
    /// `RuntimeConfig::observability`. Idempotent: a second call (or a host
    /// that already installed its own subscriber) is a silent no-op.
    pub fn init_logging(&self) {
        let filter = self.config.observability.log_level.clone();
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        let _ = if self.config.observability.json_logs {
            subscriber.json().try_init()
        } else {
            subscriber.try_init()
        };
    }

    /// Start just the scheduler, with no image-processing facade layered
    /// on top.
    pub fn build_pool(self) -> PoolResult<WorkerPool> {
        let factory = self.unit_factory.unwrap_or_else(default_unit_factory);
        WorkerPool::start(self.config.pool, factory)
    }

    /// Start the image-processing facade, which owns its own pool
    /// configured from `self.config.pool`.
    pub fn build_image_processor(self) -> PoolResult<ImageProcessor> {
        let factory = self.unit_factory.unwrap_or_else(default_unit_factory);
        ImageProcessor::start(self.config.pool, factory, self.config.image_cache, self.config.image_processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_starts_a_working_pool() {
        let pool = RuntimeBuilder::with_defaults().build_pool().unwrap();
        let submission = pool
            .submit("calc/add", "calc", serde_json::json!({}), Priority::Normal, TaskOptions::default())
            .await
            .unwrap();
        assert!(submission.wait().await.is_ok());
        pool.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn builder_starts_an_image_processor() {
        let processor = RuntimeBuilder::with_defaults().build_image_processor().unwrap();
        let stats = processor.get_cache_stats().await;
        assert_eq!(stats.size, 0);
        processor.terminate(true).await.unwrap();
    }
}

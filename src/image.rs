//! ImageProcessor: a thin facade over [`crate::pool::WorkerPool`]
//! specialized for image jobs, consulting [`crate::cache::ImageCache`]
//! before submitting and populating it on completion.
//!
//! A single domain-specific entry point wrapping cache lookup plus
//! worker-pool dispatch behind one `scale` call, the way a model-serving
//! facade wraps a loader and a dispatcher behind one `infer` call. The
//! size-adjusted timeout formula and discrete scale quantization are this
//! module's own surface, with no direct precedent elsewhere in the crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::{calculate_discrete_scale, fingerprint, CachePayload, CacheStats, ImageCache, ImageIdentity, ProcessingOptions, StorageType};
use crate::config::{ImageCacheSettings, ImageProcessorSettings, PoolSettings};
use crate::error::{PoolError, PoolResult, TaskFailure};
use crate::events::TaskEvent;
use crate::task::{Priority, TaskOptions};
use crate::timeout::TimeoutStats;
use crate::unit::UnitFactory;
use crate::pool::WorkerPool;

/// Caller-supplied description of an image scale/convert request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Source URL, when the image has a stable address (preferred identity).
    pub source_url: Option<String>,
    /// Raw source bytes. Always required to run the job; used for the
    /// sampled-hash identity fallback when `source_url` is absent.
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`.
    pub mime: String,
    /// Original width in pixels.
    pub original_width: u32,
    /// Original height in pixels.
    pub original_height: u32,
    /// Desired output width, if any.
    pub target_width: Option<u32>,
    /// Desired output height, if any.
    pub target_height: Option<u32>,
    /// Caller's device pixel ratio (1.0 if unknown).
    pub device_pixel_ratio: f64,
    /// Desired output format; `None` preserves the source format.
    pub output_format: Option<String>,
    /// Desired encode quality, 0-100.
    pub quality: Option<u8>,
    /// Scheduling priority for the underlying task.
    pub priority: Priority,
}

/// Result of a completed scale request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResult {
    /// Encoded output bytes.
    pub bytes: Vec<u8>,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Output format.
    pub format: String,
    /// Whether this result came from the cache.
    pub from_cache: bool,
}

/// Compute the effective timeout for a job of `byte_size` bytes in
/// `format`: a base linear term in MB (~5s/MB), a penalty for lossless
/// formats, a bonus for high-efficiency formats, floored at a configured
/// minimum.
pub fn adjust_timeout_based_on_image_size(byte_size: u64, format: &str, settings: &ImageProcessorSettings) -> Duration {
    let mb = byte_size as f64 / (1024.0 * 1024.0);
    let mut secs = mb * settings.seconds_per_mb;

    let lower = format.to_ascii_lowercase();
    if matches!(lower.as_str(), "png" | "bmp" | "tiff" | "webp-lossless") {
        secs += settings.lossless_penalty_secs;
    }
    if matches!(lower.as_str(), "avif" | "webp" | "heic") {
        secs -= settings.high_efficiency_bonus_secs;
    }

    secs = secs.max(settings.minimum_timeout_secs);
    Duration::from_secs_f64(secs)
}

fn image_identity(req: &ScaleRequest) -> ImageIdentity {
    match &req.source_url {
        Some(url) => ImageIdentity::Url { url: url.clone(), byte_len: req.bytes.len() as u64, mime: req.mime.clone() },
        None => ImageIdentity::SampledHash { hash: crate::cache::sampled_hash(&req.bytes), byte_len: req.bytes.len() as u64, mime: req.mime.clone() },
    }
}

/// Facade over [`WorkerPool`] for image scale/convert jobs, owning its own
/// fingerprinted result cache.
pub struct ImageProcessor {
    pool: WorkerPool,
    cache: Mutex<ImageCache>,
    cache_enabled: std::sync::atomic::AtomicBool,
    use_discrete_scales: bool,
    discrete_scales: Vec<u32>,
    settings: ImageProcessorSettings,
    namespace: String,
}

impl ImageProcessor {
    /// Build a processor driving its own [`WorkerPool`] (started with
    /// `pool_settings` and `unit_factory`) and a cache configured from
    /// `cache_settings`.
    pub fn start(pool_settings: PoolSettings, unit_factory: UnitFactory, cache_settings: ImageCacheSettings, processor_settings: ImageProcessorSettings) -> PoolResult<Self> {
        let pool = WorkerPool::start(pool_settings, unit_factory)?;
        let discrete_scales = cache_settings.discrete_scales.clone();
        let namespace = "image-processor".to_string();
        let cache = ImageCache::new(&cache_settings, None);
        Ok(Self {
            pool,
            cache: Mutex::new(cache),
            cache_enabled: std::sync::atomic::AtomicBool::new(cache_settings.enabled),
            use_discrete_scales: true,
            discrete_scales,
            settings: processor_settings,
            namespace,
        })
    }

    /// Enable or disable cache consultation; does not clear existing entries.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// Change which tier(s) future writes target.
    pub async fn set_cache_storage_type(&self, storage_type: StorageType) {
        self.cache.lock().await.set_storage_type(storage_type);
    }

    /// Discard all cached results.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear(&self.namespace).await;
    }

    /// Snapshot of cache counters.
    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.lock().await.get_stats()
    }

    /// Snapshot of the underlying pool's deadline bookkeeping.
    pub async fn get_timeout_stats(&self) -> PoolResult<TimeoutStats> {
        Ok(self.pool.get_stats().await?.timeouts)
    }

    /// Subscribe to the underlying pool's task events (e.g. to observe
    /// `TASK_DURATION`-equivalent `Completed` events).
    pub fn task_events(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.pool.events().subscribe_tasks()
    }

    /// Run a scale/convert request: checks the cache, and on a miss submits
    /// a task to the underlying pool, storing the result before returning.
    pub async fn scale(&self, req: ScaleRequest) -> Result<ScaleResult, TaskFailure> {
        let scale_pct = if self.use_discrete_scales {
            calculate_discrete_scale(req.original_width, req.original_height, req.target_width, req.target_height, req.device_pixel_ratio, &self.discrete_scales)
        } else {
            100
        };

        let options = ProcessingOptions {
            format: req.output_format.clone(),
            quality: req.quality,
            discrete_scale_pct: scale_pct,
            extra: Default::default(),
        };
        let identity = image_identity(&req);
        let fp = fingerprint(&identity, &options);

        if self.cache_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            if let Some(entry) = self.cache.lock().await.get(&self.namespace, &fp).await {
                return Ok(ScaleResult {
                    bytes: entry.payload.bytes,
                    width: entry.payload.width,
                    height: entry.payload.height,
                    format: entry.payload.format,
                    from_cache: true,
                });
            }
        }

        let timeout = adjust_timeout_based_on_image_size(req.bytes.len() as u64, req.mime.as_str(), &self.settings);
        let payload = serde_json::json!({
            "bytes": req.bytes,
            "mime": req.mime,
            "original_width": req.original_width,
            "original_height": req.original_height,
            "discrete_scale_pct": scale_pct,
            "output_format": req.output_format,
            "quality": req.quality,
        });

        let mut options = TaskOptions::default();
        options.timeout = Some(timeout);
        options.transferables = vec![req.bytes.clone()];

        let submission = self
            .pool
            .submit("image/scale", "image", payload, req.priority, options)
            .await
            .map_err(|e| TaskFailure::Rejected(e.to_string()))?;
        let outcome = submission.wait().await?;

        let width = outcome.get("width").and_then(|v| v.as_u64()).unwrap_or(req.original_width as u64) as u32;
        let height = outcome.get("height").and_then(|v| v.as_u64()).unwrap_or(req.original_height as u64) as u32;
        let format = outcome.get("format").and_then(|v| v.as_str()).unwrap_or("png").to_string();
        let bytes = outcome
            .get("bytes")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|b| b.as_u64()).map(|b| b as u8).collect())
            .unwrap_or_default();

        if self.cache_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            let cache_payload = CachePayload { bytes: bytes.clone(), width, height, format: format.clone() };
            self.cache.lock().await.set(&self.namespace, fp, cache_payload).await;
        }

        Ok(ScaleResult { bytes, width, height, format, from_cache: false })
    }

    /// Shut down the underlying pool, draining (`force = false`) or
    /// aborting (`force = true`) in-flight jobs.
    pub async fn terminate(&self, force: bool) -> PoolResult<()> {
        self.pool.shutdown(force).await
    }
}

impl From<PoolError> for TaskFailure {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Shutdown => TaskFailure::Rejected("pool is shutting down".into()),
            other => TaskFailure::Rejected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::default_unit_factory;

    fn settings() -> ImageProcessorSettings {
        ImageProcessorSettings::default()
    }

    #[test]
    fn timeout_scales_linearly_with_size_and_floors() {
        let s = settings();
        let tiny = adjust_timeout_based_on_image_size(1024, "jpeg", &s);
        assert_eq!(tiny, Duration::from_secs_f64(5.0));

        let five_mb = adjust_timeout_based_on_image_size(5 * 1024 * 1024, "jpeg", &s);
        assert!((five_mb.as_secs_f64() - 25.0).abs() < 0.01);
    }

    #[test]
    fn lossless_penalty_and_efficiency_bonus_apply() {
        let s = settings();
        let png = adjust_timeout_based_on_image_size(1024 * 1024, "png", &s);
        let avif = adjust_timeout_based_on_image_size(1024 * 1024, "avif", &s);
        assert!(png > avif);
    }

    #[tokio::test]
    async fn identical_fingerprint_for_quantized_equivalent_targets() {
        let cache_settings = ImageCacheSettings { enabled: true, memory_capacity: 16, persistent_dir: None, discrete_scales: vec![25, 50, 100] };
        let processor = ImageProcessor::start(PoolSettings::default(), default_unit_factory(), cache_settings, settings()).unwrap();

        let base = ScaleRequest {
            source_url: Some("https://example.com/a.png".into()),
            bytes: vec![0u8; 64],
            mime: "image/png".into(),
            original_width: 1000,
            original_height: 800,
            target_width: Some(480),
            target_height: None,
            device_pixel_ratio: 1.0,
            output_format: Some("webp".into()),
            quality: Some(80),
            priority: Priority::Normal,
        };
        let mut near = base.clone();
        near.target_width = Some(500);

        let first = processor.scale(base).await.unwrap();
        assert!(!first.from_cache);
        let second = processor.scale(near).await.unwrap();
        assert!(second.from_cache);

        let stats = processor.get_cache_stats().await;
        assert!(stats.memory_hits >= 1);
    }
}

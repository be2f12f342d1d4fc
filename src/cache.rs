//! ImageCache: two-tier (in-memory + persistent) cache for processed
//! image results, keyed by a fingerprint over image identity and quantized
//! processing options.
//!
//! The in-memory tier is a real recency-based LRU (`lru::LruCache`) rather
//! than FIFO-on-overflow, since recency is a much better proxy for reuse
//! likelihood than insertion order. The persistent tier is plain
//! `tokio::fs` I/O, one JSON file per fingerprint.
//!
//! Lookup order is MEMORY then PERSISTENT; a PERSISTENT hit promotes the
//! entry into MEMORY. Only the supervisor (here, [`crate::image::ImageProcessor`])
//! mutates this cache — it is not shared across tasks.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ImageCacheSettings;
use crate::metrics::Metrics;

/// Which tier(s) a cache entry lives in, and which tier(s) `set` writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    /// In-memory LRU only; lost on process exit.
    Memory,
    /// Filesystem-backed only; survives restarts, no in-memory fast path.
    Persistent,
    /// Written to both; read path still checks memory first.
    Both,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Both
    }
}

/// Deterministic identity of a source image, derivable without reading the
/// full byte stream when a URL is available.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageIdentity {
    /// Source URL + byte length + MIME type — preferred when the image has
    /// a stable address, since it never requires touching the bytes.
    Url { url: String, byte_len: u64, mime: String },
    /// Deterministic sampled hash of the byte stream, used when no URL
    /// identity is available (e.g. an in-memory blob with no origin). Never
    /// derived from random bytes — see [`sampled_hash`].
    SampledHash { hash: u64, byte_len: u64, mime: String },
}

/// Canonical, order-independent processing options folded into a
/// fingerprint alongside [`ImageIdentity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Requested output format (e.g. `"webp"`, `"png"`); `None` preserves source format.
    pub format: Option<String>,
    /// Requested encode quality, 0-100.
    pub quality: Option<u8>,
    /// Discrete scale, in percent of original dimensions (see [`calculate_discrete_scale`]).
    pub discrete_scale_pct: u32,
    /// Any other caller-supplied knobs, serialized canonically (sorted keys).
    pub extra: std::collections::BTreeMap<String, String>,
}

/// A fully resolved, deterministic lookup key: `(ImageIdentity, ProcessingOptions)`.
pub type Fingerprint = String;

/// Compute the fingerprint for an image identity and processing options.
/// Order-independent and stable across runs — `extra` is a `BTreeMap` so
/// iteration order never perturbs the hash.
pub fn fingerprint(identity: &ImageIdentity, options: &ProcessingOptions) -> Fingerprint {
    let canonical = serde_json::to_string(&(identity, options)).unwrap_or_default();
    format!("{:016x}", fnv1a(canonical.as_bytes()))
}

/// Deterministic FNV-1a hash, sampled at a fixed stride over `bytes` rather
/// than hashing every byte — cheap for large payloads while remaining
/// stable across runs (no randomness, unlike a seeded `HashMap` hasher).
pub fn sampled_hash(bytes: &[u8]) -> u64 {
    const STRIDE: usize = 4096;
    if bytes.is_empty() {
        return fnv1a(&[]);
    }
    let mut sampled = Vec::with_capacity(bytes.len() / STRIDE + 1);
    let mut i = 0;
    while i < bytes.len() {
        sampled.push(bytes[i]);
        i += STRIDE;
    }
    fnv1a(&sampled)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Quantize a requested resize ratio to the smallest member of
/// `discrete_scales` (each expressed as whole percent, e.g. `50` = 0.5x)
/// that is at least as large as the request, so the cached result is never
/// smaller than what the caller asked for. Falls back to the largest
/// configured scale if the request exceeds every entry.
///
/// `target_w`/`target_h` are in output pixels; when both are given the
/// larger of the two per-axis ratios is used (the scale that makes the
/// image at least as big as requested on both axes).
pub fn calculate_discrete_scale(
    original_w: u32,
    original_h: u32,
    target_w: Option<u32>,
    target_h: Option<u32>,
    device_pixel_ratio: f64,
    discrete_scales: &[u32],
) -> u32 {
    if discrete_scales.is_empty() || original_w == 0 || original_h == 0 {
        return 100;
    }

    let ratio_w = target_w.map(|w| w as f64 / original_w as f64);
    let ratio_h = target_h.map(|h| h as f64 / original_h as f64);
    let requested = match (ratio_w, ratio_h) {
        (Some(rw), Some(rh)) => rw.max(rh),
        (Some(rw), None) => rw,
        (None, Some(rh)) => rh,
        (None, None) => 1.0,
    } * device_pixel_ratio;
    let requested_pct = (requested * 100.0).round() as i64;

    let mut sorted: Vec<u32> = discrete_scales.to_vec();
    sorted.sort_unstable();

    sorted
        .iter()
        .find(|&&s| (s as i64) >= requested_pct)
        .copied()
        .unwrap_or(*sorted.last().unwrap())
}

/// Metadata carried alongside a cached result's encoded bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePayload {
    /// Encoded result bytes.
    pub bytes: Vec<u8>,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Output format (e.g. `"webp"`).
    pub format: String,
}

/// One cached result and its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key this entry was stored under.
    pub fingerprint: Fingerprint,
    /// Encoded result and its metadata.
    pub payload: CachePayload,
    /// Unix epoch millis when first inserted.
    pub inserted_at: u64,
    /// Unix epoch millis of the most recent access.
    pub last_accessed_at: u64,
    /// Number of cache hits served from this entry.
    pub hit_count: u64,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Entries currently resident in the memory tier.
    pub size: usize,
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub persistent_hits: u64,
    pub persistent_misses: u64,
    pub evictions: u64,
    pub total_hits: u64,
    pub total_misses: u64,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Two-tier result cache: a bounded in-memory LRU backed by an optional
/// filesystem-persisted tier.
pub struct ImageCache {
    memory: LruCache<Fingerprint, CacheEntry>,
    persistent_dir: Option<PathBuf>,
    storage_type: StorageType,
    stats: CacheStats,
    metrics: Option<Arc<Metrics>>,
}

impl ImageCache {
    /// Build a cache from [`ImageCacheSettings`], optionally wired to a
    /// shared [`Metrics`] registry for Prometheus export.
    pub fn new(settings: &ImageCacheSettings, metrics: Option<Arc<Metrics>>) -> Self {
        let capacity = NonZeroUsize::new(settings.memory_capacity.max(1)).unwrap();
        Self {
            memory: LruCache::new(capacity),
            persistent_dir: settings.persistent_dir.clone(),
            storage_type: StorageType::Both,
            stats: CacheStats::default(),
            metrics,
        }
    }

    /// Change which tier(s) `set` writes to going forward. Does not move
    /// entries already stored under the previous policy.
    pub fn set_storage_type(&mut self, storage_type: StorageType) {
        self.storage_type = storage_type;
    }

    fn namespaced_path(&self, namespace: &str, fp: &Fingerprint) -> Option<PathBuf> {
        self.persistent_dir.as_ref().map(|dir| dir.join(namespace).join(format!("{fp}.json")))
    }

    /// Look up a fingerprint. Checks MEMORY first; a MEMORY hit never
    /// touches the persistent tier. A PERSISTENT hit promotes the entry
    /// into MEMORY before returning it.
    pub async fn get(&mut self, namespace: &str, fp: &Fingerprint) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.get_mut(fp) {
            entry.hit_count += 1;
            entry.last_accessed_at = now_ms();
            self.stats.memory_hits += 1;
            self.stats.total_hits += 1;
            if let Some(m) = &self.metrics {
                m.cache.memory_hits_total.inc();
            }
            return Some(entry.clone());
        }
        self.stats.memory_misses += 1;

        if self.storage_type == StorageType::Memory || self.persistent_dir.is_none() {
            self.stats.total_misses += 1;
            return None;
        }

        let Some(path) = self.namespaced_path(namespace, fp) else {
            self.stats.total_misses += 1;
            return None;
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(mut entry) => {
                    entry.hit_count += 1;
                    entry.last_accessed_at = now_ms();
                    self.stats.persistent_hits += 1;
                    self.stats.total_hits += 1;
                    if let Some(m) = &self.metrics {
                        m.cache.persistent_hits_total.inc();
                    }
                    self.promote(entry.clone());
                    Some(entry)
                }
                Err(e) => {
                    warn!(error = %e, "corrupt persistent cache entry, treating as miss");
                    self.stats.persistent_misses += 1;
                    self.stats.total_misses += 1;
                    None
                }
            },
            Err(_) => {
                self.stats.persistent_misses += 1;
                self.stats.total_misses += 1;
                None
            }
        }
    }

    fn promote(&mut self, entry: CacheEntry) {
        if self.memory.put(entry.fingerprint.clone(), entry).is_some() {
            self.stats.evictions += 1;
        }
    }

    /// Store `payload` under `fp`, writing to the tier(s) selected by
    /// [`ImageCache::set_storage_type`] (`Both` writes to memory then the
    /// persistent directory, if configured).
    pub async fn set(&mut self, namespace: &str, fp: Fingerprint, payload: CachePayload) {
        let entry = CacheEntry { fingerprint: fp.clone(), payload, inserted_at: now_ms(), last_accessed_at: now_ms(), hit_count: 0 };

        if matches!(self.storage_type, StorageType::Memory | StorageType::Both) {
            if self.memory.put(fp.clone(), entry.clone()).is_some() {
                self.stats.evictions += 1;
            }
        }

        if matches!(self.storage_type, StorageType::Persistent | StorageType::Both) {
            if let Some(path) = self.namespaced_path(namespace, &fp) {
                if let Err(e) = self.write_persistent(&path, &entry).await {
                    warn!(error = %e, fingerprint = %fp, "failed to write persistent cache entry, continuing as memory-only");
                }
            }
        }

        if let Some(m) = &self.metrics {
            m.cache.writes_total.inc();
        }
    }

    async fn write_persistent(&self, path: &Path, entry: &CacheEntry) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(path, bytes).await
    }

    /// Discard every entry from both tiers, atomically from the caller's
    /// point of view (memory is cleared first, so no racing `get` can see a
    /// half-cleared cache once this returns).
    pub async fn clear(&mut self, namespace: &str) {
        self.memory.clear();
        if let Some(dir) = self.persistent_dir.clone() {
            let ns_dir = dir.join(namespace);
            if ns_dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&ns_dir).await {
                    warn!(error = %e, "failed to clear persistent cache directory");
                }
            }
        }
    }

    /// Snapshot of aggregate counters.
    pub fn get_stats(&self) -> CacheStats {
        CacheStats { size: self.memory.len(), ..self.stats.clone() }
    }

    /// Release any resources the cache holds open. No-op for this
    /// implementation — the persistent tier is opened per-operation, so
    /// there is nothing held open to release beyond the memory tier.
    pub fn dispose(&mut self) {
        self.memory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts(scale_pct: u32) -> ProcessingOptions {
        ProcessingOptions { format: Some("webp".into()), quality: Some(80), discrete_scale_pct: scale_pct, extra: Default::default() }
    }

    fn identity(url: &str) -> ImageIdentity {
        ImageIdentity::Url { url: url.to_string(), byte_len: 1024, mime: "image/png".into() }
    }

    #[tokio::test]
    async fn round_trip_memory_hit() {
        let settings = ImageCacheSettings { enabled: true, memory_capacity: 4, persistent_dir: None, discrete_scales: vec![25, 50, 100] };
        let mut cache = ImageCache::new(&settings, None);
        let fp = fingerprint(&identity("https://x/a.png"), &opts(50));
        let payload = CachePayload { bytes: vec![1, 2, 3], width: 10, height: 10, format: "webp".into() };
        cache.set("ns", fp.clone(), payload.clone()).await;

        let hit = cache.get("ns", &fp).await.unwrap();
        assert_eq!(hit.payload.bytes, payload.bytes);
        assert_eq!(cache.get_stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn miss_after_clear() {
        let settings = ImageCacheSettings::default();
        let mut cache = ImageCache::new(&settings, None);
        let fp = fingerprint(&identity("https://x/a.png"), &opts(100));
        cache.set("ns", fp.clone(), CachePayload { bytes: vec![9], width: 1, height: 1, format: "png".into() }).await;
        cache.clear("ns").await;
        assert!(cache.get("ns", &fp).await.is_none());
    }

    #[tokio::test]
    async fn persistent_hit_promotes_to_memory() {
        let dir = tempdir().unwrap();
        let settings = ImageCacheSettings { enabled: true, memory_capacity: 4, persistent_dir: Some(dir.path().to_path_buf()), discrete_scales: vec![100] };
        let mut cache = ImageCache::new(&settings, None);
        let fp = fingerprint(&identity("https://x/b.png"), &opts(100));
        cache.set("ns", fp.clone(), CachePayload { bytes: vec![7], width: 2, height: 2, format: "png".into() }).await;

        // Evict the memory-resident copy directly, leaving only the file on disk.
        cache.memory.clear();

        let hit = cache.get("ns", &fp).await.unwrap();
        assert_eq!(hit.payload.bytes, vec![7]);
        assert_eq!(cache.get_stats().persistent_hits, 1);
        assert_eq!(cache.memory.len(), 1);
    }

    #[test]
    fn discrete_scale_rounds_up_to_nearest_table_entry() {
        let scales = vec![10, 25, 50, 100];
        let s = calculate_discrete_scale(1000, 800, Some(480), None, 1.0, &scales);
        assert_eq!(s, 50);
    }

    #[test]
    fn discrete_scale_falls_back_to_largest_when_request_exceeds_every_entry() {
        let scales = vec![10, 25, 50];
        let s = calculate_discrete_scale(1000, 800, Some(900), None, 1.0, &scales);
        assert_eq!(s, 50);
    }

    #[test]
    fn discrete_scale_picks_smallest_entry_when_request_is_tiny() {
        let scales = vec![50, 100];
        let s = calculate_discrete_scale(1000, 800, Some(10), None, 1.0, &scales);
        assert_eq!(s, 50);
    }

    #[test]
    fn sampled_hash_is_deterministic() {
        let bytes = vec![1u8; 20_000];
        assert_eq!(sampled_hash(&bytes), sampled_hash(&bytes));
    }

    #[quickcheck_macros::quickcheck]
    fn discrete_scale_never_exceeds_the_configured_table(original_w: u32, original_h: u32, target_w: u32) -> quickcheck::TestResult {
        if original_w == 0 || original_h == 0 {
            return quickcheck::TestResult::discard();
        }
        let scales = vec![10, 25, 50, 75, 100, 150, 200];
        let result = calculate_discrete_scale(original_w, original_h, Some(target_w), None, 1.0, &scales);
        quickcheck::TestResult::from_bool(scales.contains(&result))
    }
}

use crate::cache_validator::{IntegrityError, ValidatedCacheEntry};
use crate::config::Config;
use crate::knowledge_map::MapSnapshot;
use crate::models::SubjectStatistics;
use moka::future::Cache;
use moka::Expiry;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Namespace shared by every cache key.
pub const KEY_PREFIX: &str = "mindmap_pro";

pub const USER_DATA_TTL: Duration = Duration::from_secs(3600);
pub const KNOWLEDGE_MAP_TTL: Duration = Duration::from_secs(3600);
pub const ANALYSIS_TTL: Duration = Duration::from_secs(1800);
pub const STUDY_STATS_TTL: Duration = Duration::from_secs(3600);

/// Builds `mindmap_pro:{prefix}:{identifier}`.
pub fn cache_key(prefix: &str, identifier: impl std::fmt::Display) -> String {
    format!("{}:{}:{}", KEY_PREFIX, prefix, identifier)
}

/// Compiles a glob (`*` = any run, `?` = one char) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

#[derive(Debug, Clone)]
struct CachedPayload {
    payload: Arc<str>,
    ttl: Duration,
}

/// Each entry carries its own TTL; rewriting a key restarts its clock.
struct PerEntryTtl;

impl Expiry<String, CachedPayload> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedPayload,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedPayload,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Snapshot of cache health.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub used_memory: String,
    pub used_memory_bytes: u64,
    pub total_keys: u64,
    pub hits: u64,
    pub misses: u64,
    pub integrity_failures: u64,
    pub uptime_days: u64,
}

/// In-process TTL cache for user data, knowledge maps and analysis results.
///
/// Values are stored as checksummed JSON. Cache failures are never fatal:
/// a write that cannot be serialised is skipped and a corrupt read is
/// reported as a miss and evicted.
pub struct CacheManager {
    entries: Cache<String, CachedPayload>,
    default_ttl: Duration,
    started_at: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    integrity_failures: AtomicU64,
}

impl CacheManager {
    /// `max_capacity` is a budget in bytes of key plus stored payload.
    pub fn new(max_capacity: u64, default_ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .weigher(|key: &String, value: &CachedPayload| -> u32 {
                (key.len() + value.payload.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryTtl)
            .build();

        Self {
            entries,
            default_ttl,
            started_at: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.cache_max_capacity,
            Duration::from_secs(config.cache_default_timeout),
        )
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    // ============ Generic JSON access ============

    /// Stores `value` under `key`. Returns false if it could not be serialised.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let payload = serde_json::to_string(value)
            .and_then(|json| ValidatedCacheEntry::new(json).to_payload());

        match payload {
            Ok(payload) => {
                self.entries
                    .insert(
                        key.to_string(),
                        CachedPayload {
                            payload: Arc::from(payload),
                            ttl: ttl.unwrap_or(self.default_ttl),
                        },
                    )
                    .await;
                true
            }
            Err(e) => {
                tracing::error!("Error caching {}: {}", key, e);
                false
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(entry) = self.entries.get(key).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let decoded = ValidatedCacheEntry::open(&entry.payload)
            .map_err(|e| {
                self.integrity_failures.fetch_add(1, Ordering::Relaxed);
                match e {
                    IntegrityError::Malformed => format!("malformed entry for {}", key),
                    IntegrityError::ChecksumMismatch { .. } => {
                        format!("checksum mismatch for {}", key)
                    }
                }
            })
            .and_then(|json| {
                serde_json::from_str::<T>(&json)
                    .map_err(|e| format!("cannot decode {}: {}", key, e))
            });

        match decoded {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache HIT: {}", key);
                Some(value)
            }
            Err(reason) => {
                tracing::warn!("Evicting cache entry: {}", reason);
                self.entries.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Removes one key. Returns whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).await.is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Live keys matching a glob pattern.
    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let matcher = match glob_to_regex(pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::error!("Invalid cache key pattern {}: {}", pattern, e);
                return Vec::new();
            }
        };

        self.entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Deletes every key matching `pattern` and returns how many were removed.
    pub async fn delete_matching(&self, pattern: &str) -> usize {
        let keys = self.keys_matching(pattern);
        for key in &keys {
            self.entries.invalidate(key).await;
        }
        keys.len()
    }

    // ============ Typed entries ============

    pub async fn set_user_data<T: Serialize>(
        &self,
        user_id: i64,
        data: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_json(
            &cache_key("user", user_id),
            data,
            Some(ttl.unwrap_or(USER_DATA_TTL)),
        )
        .await
    }

    pub async fn get_user_data<T: DeserializeOwned>(&self, user_id: i64) -> Option<T> {
        self.get_json(&cache_key("user", user_id)).await
    }

    pub async fn cache_knowledge_map(
        &self,
        map_id: i64,
        snapshot: &MapSnapshot,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_json(
            &cache_key("knowledge_map", map_id),
            snapshot,
            Some(ttl.unwrap_or(KNOWLEDGE_MAP_TTL)),
        )
        .await
    }

    pub async fn get_cached_knowledge_map(&self, map_id: i64) -> Option<MapSnapshot> {
        self.get_json(&cache_key("knowledge_map", map_id)).await
    }

    pub async fn cache_analysis_results<T: Serialize>(
        &self,
        user_id: i64,
        analysis_type: &str,
        results: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_json(
            &cache_key(&format!("analysis:{}", analysis_type), user_id),
            results,
            Some(ttl.unwrap_or(ANALYSIS_TTL)),
        )
        .await
    }

    pub async fn get_cached_analysis<T: DeserializeOwned>(
        &self,
        user_id: i64,
        analysis_type: &str,
    ) -> Option<T> {
        self.get_json(&cache_key(&format!("analysis:{}", analysis_type), user_id))
            .await
    }

    pub async fn cache_study_statistics(
        &self,
        user_id: i64,
        stats: &[SubjectStatistics],
        ttl: Option<Duration>,
    ) -> bool {
        self.set_json(
            &cache_key("study_stats", user_id),
            stats,
            Some(ttl.unwrap_or(STUDY_STATS_TTL)),
        )
        .await
    }

    pub async fn get_cached_study_statistics(
        &self,
        user_id: i64,
    ) -> Option<Vec<SubjectStatistics>> {
        self.get_json(&cache_key("study_stats", user_id)).await
    }

    // ============ Maintenance ============

    /// Drops every entry whose key ends in `:{user_id}`.
    pub async fn invalidate_user_cache(&self, user_id: i64) -> usize {
        self.delete_matching(&cache_key("*", user_id)).await
    }

    pub async fn clear_all_cache(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        tracing::info!("Cache cleared");
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.entries.run_pending_tasks().await;

        let used_memory_bytes = self.entries.weighted_size();

        CacheStats {
            used_memory: human_bytes(used_memory_bytes),
            used_memory_bytes,
            total_keys: self.entries.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            uptime_days: self.started_at.elapsed().as_secs() / 86_400,
        }
    }
}

/// Formats a byte count the way `redis INFO` reports `used_memory_human`.
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["K", "M", "G", "T"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.2}{}", value, unit)
}

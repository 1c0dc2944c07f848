use crate::cache_manager::{cache_key, CacheManager};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Dependency-aware invalidation on top of [`CacheManager`].
///
/// A key can declare dependents; invalidating it also drops every key
/// reachable through the dependency graph. Cycles are fine.
pub struct CacheInvalidator {
    cache: Arc<CacheManager>,
    dependencies: RwLock<HashMap<String, HashSet<String>>>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            dependencies: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Records that `dependents` must be dropped whenever `key` is.
    pub async fn register_dependency<I, S>(&self, key: &str, dependents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = self.dependencies.write().await;
        graph
            .entry(key.to_string())
            .or_default()
            .extend(dependents.into_iter().map(Into::into));
    }

    /// Every key reachable from `key`, excluding `key` itself unless a
    /// cycle leads back to it.
    async fn dependent_keys(&self, key: &str) -> HashSet<String> {
        let graph = self.dependencies.read().await;
        let mut visited = HashSet::new();
        let mut stack: Vec<&str> = vec![key];

        while let Some(current) = stack.pop() {
            if let Some(children) = graph.get(current) {
                for child in children {
                    if visited.insert(child.clone()) {
                        stack.push(child.as_str());
                    }
                }
            }
        }
        visited
    }

    /// Drops `key` and all of its transitive dependents. Returns the keys
    /// that were invalidated, sorted.
    pub async fn invalidate_with_dependencies(&self, key: &str) -> Vec<String> {
        let mut keys: Vec<String> = self.dependent_keys(key).await.into_iter().collect();
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
        keys.sort();

        for k in &keys {
            self.cache.delete(k).await;
            tracing::info!("Invalidated cache key: {}", k);
        }
        keys
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self.cache.delete_matching(pattern).await;
        if removed > 0 {
            tracing::info!("Invalidated {} keys matching pattern: {}", removed, pattern);
        }
        removed
    }

    /// Drops every key of the form `mindmap_pro:*:{user_id}`.
    pub async fn invalidate_user_data(&self, user_id: i64) -> usize {
        self.invalidate_pattern(&cache_key("*", user_id)).await
    }

    pub async fn invalidate_knowledge_map(&self, map_id: i64) -> Vec<String> {
        self.invalidate_with_dependencies(&cache_key("knowledge_map", map_id))
            .await
    }

    /// Drops one analysis type for the user, or all of them when `None`.
    pub async fn invalidate_analysis_cache(
        &self,
        user_id: i64,
        analysis_type: Option<&str>,
    ) -> usize {
        let prefix = format!("analysis:{}", analysis_type.unwrap_or("*"));
        self.invalidate_pattern(&cache_key(&prefix, user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn invalidator() -> CacheInvalidator {
        CacheInvalidator::new(Arc::new(CacheManager::new(1 << 20, Duration::from_secs(60))))
    }

    #[tokio::test]
    async fn transitive_dependents_are_dropped() {
        let inv = invalidator();
        let cache = inv.cache().clone();
        for key in ["a", "b", "c", "unrelated"] {
            cache.set_json(key, &1, None).await;
        }
        inv.register_dependency("a", ["b"]).await;
        inv.register_dependency("b", ["c"]).await;

        let dropped = inv.invalidate_with_dependencies("a").await;

        assert_eq!(dropped, vec!["a", "b", "c"]);
        assert!(!cache.contains("c"));
        assert!(cache.contains("unrelated"));
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let inv = invalidator();
        inv.register_dependency("x", ["y"]).await;
        inv.register_dependency("y", ["x"]).await;

        let dropped = inv.invalidate_with_dependencies("x").await;
        assert_eq!(dropped, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn map_invalidation_follows_registered_views() {
        let inv = invalidator();
        let cache = inv.cache().clone();
        let map_key = cache_key("knowledge_map", 7);
        let layout_key = cache_key("map_layout", 7);
        cache.set_json(&map_key, &"map", None).await;
        cache.set_json(&layout_key, &"layout", None).await;
        inv.register_dependency(&map_key, [layout_key.clone()]).await;

        inv.invalidate_knowledge_map(7).await;

        assert!(!cache.contains(&map_key));
        assert!(!cache.contains(&layout_key));
    }

    #[tokio::test]
    async fn analysis_invalidation_by_type() {
        let inv = invalidator();
        let cache = inv.cache().clone();
        cache.cache_analysis_results(3, "patterns", &1, None).await;
        cache.cache_analysis_results(3, "learning", &2, None).await;
        cache.cache_analysis_results(33, "patterns", &3, None).await;

        assert_eq!(inv.invalidate_analysis_cache(3, Some("patterns")).await, 1);
        assert_eq!(inv.invalidate_analysis_cache(3, None).await, 1);
        assert!(cache
            .get_cached_analysis::<i32>(33, "patterns")
            .await
            .is_some());
    }
}

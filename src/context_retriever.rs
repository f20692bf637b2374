//! Two-layer progressive retrieval of prior orchestration context, bounded by
//! a token budget and served through an LRU cache (spec §4.M).
//!
//! Layer 1 is a cheap index lookup against the vector store; Layer 2 expands
//! a subset of those hits to full detail, truncating or skipping entries that
//! do not fit in the remaining budget. Both collaborators are external to the
//! core (spec §6) and are modeled here only as the trait boundary they need.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};

use crate::config::ContextRetrieverConfig;

/// Estimates a token count from text length. A real tokenizer is an external
/// concern; this crate only needs a stable, monotonic proxy for budgeting.
fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

fn estimate_tokens_json(value: &serde_json::Value) -> usize {
    estimate_tokens(&value.to_string())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub include_observations: bool,
    pub search_mode: String,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub task: String,
    pub pattern: String,
    pub relevance: f64,
    pub agent_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub token_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullOrchestration {
    pub id: String,
    pub pattern: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub agent_ids: Vec<String>,
    pub task: String,
    pub observations: Vec<String>,
    pub result_summary: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// The vector/embedding store: black-box similarity search (spec §6).
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search_similar(&self, query: &str, options: SearchOptions) -> Result<Vec<Candidate>, String>;
}

/// The memory store backing full orchestration detail (spec §6).
#[async_trait]
pub trait OrchestrationStore: Send + Sync {
    async fn get_orchestration_by_id(&self, id: &str) -> Option<FullOrchestration>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer1Summary {
    pub id: String,
    pub pattern: String,
    pub task: String,
    pub summary: String,
    pub relevance: f64,
    pub success: bool,
    pub agent_ids: Vec<String>,
    pub token_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer1Result {
    pub orchestrations: Vec<Layer1Summary>,
    pub total_found: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer2Entry {
    pub id: String,
    pub orchestration: serde_json::Value,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer2Result {
    pub loaded: usize,
    pub entries: Vec<Layer2Entry>,
    pub truncations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub loaded: bool,
    pub progressive: bool,
    pub layer1: Layer1Result,
    pub layer2: Option<Layer2Result>,
    pub token_count: usize,
    pub retrieval_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub task: String,
    pub agent_ids: Vec<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub max_tokens: Option<usize>,
    pub progressive: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self { max_tokens: None, progressive: true }
    }
}

struct CacheEntry {
    value: RetrievalResult,
    pattern: Option<String>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetrieverMetrics {
    pub retrievals: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub layer1_loads: u64,
    pub layer2_loads: u64,
    pub total_tokens_served: u64,
    pub truncations: u64,
    total_retrieval_ms: u64,
}

impl RetrieverMetrics {
    pub fn avg_retrieval_time_ms(&self) -> f64 {
        if self.retrievals == 0 { 0.0 } else { self.total_retrieval_ms as f64 / self.retrievals as f64 }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 { 0.0 } else { self.cache_hits as f64 / total as f64 }
    }
}

/// Deterministic cache key: hashes `task`, `pattern`, and the agent-id list
/// sorted first so permutations of the same set collide (spec §9).
fn cache_key(task: &str, pattern: Option<&str>, agent_ids: &[String]) -> u64 {
    let mut sorted = agent_ids.to_vec();
    sorted.sort();
    let mut hasher = FxHasher::default();
    task.hash(&mut hasher);
    pattern.unwrap_or("").hash(&mut hasher);
    sorted.hash(&mut hasher);
    hasher.finish()
}

pub struct ContextRetriever {
    config: ContextRetrieverConfig,
    vector_store: Option<Arc<dyn VectorStore>>,
    orchestration_store: Option<Arc<dyn OrchestrationStore>>,
    cache: RwLock<FxHashMap<u64, CacheEntry>>,
    cache_order: RwLock<Vec<u64>>,
    metrics: RwLock<RetrieverMetrics>,
}

impl ContextRetriever {
    pub fn new(config: ContextRetrieverConfig) -> Self {
        Self {
            config,
            vector_store: None,
            orchestration_store: None,
            cache: RwLock::new(FxHashMap::default()),
            cache_order: RwLock::new(Vec::new()),
            metrics: RwLock::new(RetrieverMetrics::default()),
        }
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn with_orchestration_store(mut self, store: Arc<dyn OrchestrationStore>) -> Self {
        self.orchestration_store = Some(store);
        self
    }

    pub fn metrics(&self) -> RetrieverMetrics {
        *self.metrics.read()
    }

    pub fn clear_cache(&self, pattern: Option<&str>) {
        match pattern {
            None => {
                self.cache.write().clear();
                self.cache_order.write().clear();
            }
            Some(p) => {
                let mut cache = self.cache.write();
                let matching: Vec<u64> = cache
                    .iter()
                    .filter(|(_, entry)| entry.pattern.as_deref() == Some(p))
                    .map(|(key, _)| *key)
                    .collect();
                for key in &matching {
                    cache.remove(key);
                }
                drop(cache);
                self.cache_order.write().retain(|key| !matching.contains(key));
            }
        }
    }

    pub async fn retrieve_context(&self, request: RetrieveRequest, options: RetrieveOptions) -> RetrievalResult {
        let started = Instant::now();
        let key = cache_key(&request.task, request.pattern.as_deref(), &request.agent_ids);

        if let Some(result) = self.cache_lookup(key) {
            let mut metrics = self.metrics.write();
            metrics.retrievals += 1;
            metrics.cache_hits += 1;
            return result;
        }
        {
            let mut metrics = self.metrics.write();
            metrics.cache_misses += 1;
        }

        let effective_budget = ((options.max_tokens.unwrap_or(self.config.max_tokens)) as f64
            * (1.0 - self.config.buffer_percent)) as usize;

        let layer1 = self.load_layer1(&request).await;
        let layer1_tokens: usize = layer1.orchestrations.iter().map(|o| o.token_count).sum();

        let result = if options.progressive {
            let remaining_budget = effective_budget.saturating_sub(layer1_tokens);
            let layer2 = self.load_layer2(&layer1, remaining_budget).await;
            let token_count = layer1_tokens + layer2.entries.iter().map(|e| estimate_tokens_json(&e.orchestration)).sum::<usize>();
            RetrievalResult {
                loaded: true,
                progressive: true,
                layer1,
                layer2: Some(layer2),
                token_count,
                retrieval_time_ms: started.elapsed().as_millis() as i64,
            }
        } else {
            // Eager mode: honor the whole-result token budget, trimming Layer 1
            // entries from the tail if even the index overshoots it.
            let mut trimmed = layer1;
            let mut running = 0usize;
            let mut kept = Vec::new();
            for entry in trimmed.orchestrations.drain(..) {
                if running + entry.token_count > effective_budget {
                    break;
                }
                running += entry.token_count;
                kept.push(entry);
            }
            trimmed.orchestrations = kept;
            RetrievalResult {
                loaded: true,
                progressive: false,
                layer1: trimmed,
                layer2: None,
                token_count: running,
                retrieval_time_ms: started.elapsed().as_millis() as i64,
            }
        };

        {
            let mut metrics = self.metrics.write();
            metrics.retrievals += 1;
            metrics.total_retrieval_ms += result.retrieval_time_ms.max(0) as u64;
            metrics.total_tokens_served += result.token_count as u64;
        }
        self.cache_insert(key, request.pattern.clone(), result.clone());
        result
    }

    async fn load_layer1(&self, request: &RetrieveRequest) -> Layer1Result {
        let Some(store) = &self.vector_store else {
            return Layer1Result { orchestrations: Vec::new(), total_found: 0, error: Some("no vector store configured".to_string()) };
        };
        let options = SearchOptions {
            limit: self.config.layer1_limit,
            include_observations: false,
            search_mode: "hybrid".to_string(),
            pattern: request.pattern.clone(),
        };
        match store.search_similar(&request.task, options).await {
            Ok(candidates) => {
                self.metrics.write().layer1_loads += 1;
                let total_found = candidates.len();
                let orchestrations = candidates
                    .into_iter()
                    .map(|c| {
                        let task = truncate_chars(&c.task, 100);
                        let summary = truncate_chars(&c.task, 150);
                        let base_tokens = c.token_count.unwrap_or_else(|| estimate_tokens(&task) + estimate_tokens(&summary));
                        Layer1Summary {
                            id: c.id,
                            pattern: c.pattern,
                            task,
                            summary,
                            relevance: c.relevance,
                            success: c.success,
                            agent_ids: c.agent_ids,
                            token_count: base_tokens,
                        }
                    })
                    .collect();
                Layer1Result { orchestrations, total_found, error: None }
            }
            Err(err) => Layer1Result { orchestrations: Vec::new(), total_found: 0, error: Some(err) },
        }
    }

    async fn load_layer2(&self, layer1: &Layer1Result, mut remaining_budget: usize) -> Layer2Result {
        let Some(store) = &self.orchestration_store else {
            return Layer2Result::default();
        };
        let mut entries = Vec::new();
        let mut truncations = 0usize;

        for summary in &layer1.orchestrations {
            if remaining_budget == 0 {
                break;
            }
            let Some(full) = store.get_orchestration_by_id(&summary.id).await else { continue };
            let full_value = serde_json::to_value(&full).unwrap_or(serde_json::Value::Null);
            let full_tokens = estimate_tokens_json(&full_value);

            if full_tokens <= remaining_budget {
                remaining_budget -= full_tokens;
                entries.push(Layer2Entry { id: summary.id.clone(), orchestration: full_value, truncated: false });
                continue;
            }

            let core = serde_json::json!({
                "id": full.id,
                "pattern": full.pattern,
                "success": full.success,
                "timestamp": full.timestamp,
                "agent_ids": full.agent_ids,
                "task": full.task,
            });
            let core_tokens = estimate_tokens_json(&core);
            if core_tokens > remaining_budget {
                truncations += 1;
                continue;
            }

            let mut merged = core;
            let mut used = core_tokens;
            let optional_fields: [(&str, serde_json::Value); 3] = [
                ("observations", serde_json::to_value(&full.observations).unwrap_or(serde_json::Value::Null)),
                ("result_summary", serde_json::to_value(&full.result_summary).unwrap_or(serde_json::Value::Null)),
                ("metadata", full.metadata.clone().unwrap_or(serde_json::Value::Null)),
            ];
            for (field, value) in optional_fields {
                let field_tokens = estimate_tokens_json(&value);
                if used + field_tokens <= remaining_budget {
                    merged.as_object_mut().expect("core is an object").insert(field.to_string(), value);
                    used += field_tokens;
                }
            }
            remaining_budget -= used.saturating_sub(core_tokens);
            truncations += 1;
            entries.push(Layer2Entry { id: summary.id.clone(), orchestration: merged, truncated: true });
        }

        if !entries.is_empty() {
            self.metrics.write().layer2_loads += 1;
        }
        if truncations > 0 {
            self.metrics.write().truncations += truncations as u64;
        }
        Layer2Result { loaded: entries.len(), entries, truncations }
    }

    fn cache_lookup(&self, key: u64) -> Option<RetrievalResult> {
        let ttl = self.config.cache_ttl;
        let expired = {
            let cache = self.cache.read();
            match cache.get(&key) {
                Some(entry) => entry.inserted_at.elapsed() > ttl,
                None => return None,
            }
        };
        if expired {
            self.cache.write().remove(&key);
            self.cache_order.write().retain(|k| *k != key);
            return None;
        }
        let mut order = self.cache_order.write();
        order.retain(|k| *k != key);
        order.push(key);
        self.cache.read().get(&key).map(|e| e.value.clone())
    }

    fn cache_insert(&self, key: u64, pattern: Option<String>, value: RetrievalResult) {
        {
            let mut cache = self.cache.write();
            cache.insert(key, CacheEntry { value, pattern, inserted_at: Instant::now() });
        }
        let mut order = self.cache_order.write();
        order.retain(|k| *k != key);
        order.push(key);
        while order.len() > self.config.cache_size {
            let evict = order.remove(0);
            self.cache.write().remove(&evict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeVectorStore {
        candidates: Vec<Candidate>,
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn search_similar(&self, _query: &str, _options: SearchOptions) -> Result<Vec<Candidate>, String> {
            Ok(self.candidates.clone())
        }
    }

    struct FailingVectorStore;

    #[async_trait]
    impl VectorStore for FailingVectorStore {
        async fn search_similar(&self, _query: &str, _options: SearchOptions) -> Result<Vec<Candidate>, String> {
            Err("store unavailable".to_string())
        }
    }

    struct FakeOrchestrationStore {
        calls: AtomicUsize,
        orchestrations: FxHashMap<String, FullOrchestration>,
    }

    #[async_trait]
    impl OrchestrationStore for FakeOrchestrationStore {
        async fn get_orchestration_by_id(&self, id: &str) -> Option<FullOrchestration> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.orchestrations.get(id).cloned()
        }
    }

    fn candidate(id: &str, task_len: usize) -> Candidate {
        Candidate {
            id: id.to_string(),
            task: "x".repeat(task_len),
            pattern: "parallel".to_string(),
            relevance: 0.9,
            agent_ids: vec!["a1".to_string()],
            timestamp: Utc::now(),
            success: true,
            token_count: None,
        }
    }

    #[tokio::test]
    async fn cache_key_is_insensitive_to_agent_id_order() {
        let key_a = cache_key("task", Some("p"), &["a1".to_string(), "a2".to_string()]);
        let key_b = cache_key("task", Some("p"), &["a2".to_string(), "a1".to_string()]);
        assert_eq!(key_a, key_b);
    }

    #[tokio::test]
    async fn progressive_retrieval_loads_both_layers_under_budget() {
        let mut orchestrations = FxHashMap::default();
        orchestrations.insert(
            "o1".to_string(),
            FullOrchestration {
                id: "o1".to_string(),
                pattern: "parallel".to_string(),
                success: true,
                timestamp: Utc::now(),
                agent_ids: vec!["a1".to_string()],
                task: "do the thing".to_string(),
                observations: vec!["obs".to_string()],
                result_summary: Some("done".to_string()),
                metadata: None,
            },
        );
        orchestrations.insert(
            "o2".to_string(),
            FullOrchestration {
                id: "o2".to_string(),
                pattern: "parallel".to_string(),
                success: true,
                timestamp: Utc::now(),
                agent_ids: vec!["a1".to_string()],
                task: "do another thing".to_string(),
                observations: vec![],
                result_summary: None,
                metadata: None,
            },
        );

        let retriever = ContextRetriever::new(ContextRetrieverConfig { max_tokens: 1000, ..ContextRetrieverConfig::default() })
            .with_vector_store(Arc::new(FakeVectorStore { candidates: vec![candidate("o1", 20), candidate("o2", 20)] }))
            .with_orchestration_store(Arc::new(FakeOrchestrationStore { calls: AtomicUsize::new(0), orchestrations }));

        let result = retriever
            .retrieve_context(
                RetrieveRequest { task: "do the thing".to_string(), agent_ids: vec!["a1".to_string()], pattern: Some("parallel".to_string()) },
                RetrieveOptions::default(),
            )
            .await;

        assert!(result.loaded);
        assert!(result.progressive);
        let layer2 = result.layer2.unwrap();
        assert_eq!(layer2.loaded, 2);
        assert!(result.token_count <= 1000);
    }

    #[tokio::test]
    async fn layer1_error_does_not_fail_progressive_retrieval() {
        let retriever = ContextRetriever::new(ContextRetrieverConfig::default()).with_vector_store(Arc::new(FailingVectorStore));
        let result = retriever
            .retrieve_context(
                RetrieveRequest { task: "t".to_string(), agent_ids: vec![], pattern: None },
                RetrieveOptions::default(),
            )
            .await;
        assert!(result.loaded);
        assert!(result.layer1.error.is_some());
    }

    #[tokio::test]
    async fn repeated_calls_hit_cache() {
        let retriever = ContextRetriever::new(ContextRetrieverConfig::default())
            .with_vector_store(Arc::new(FakeVectorStore { candidates: vec![candidate("o1", 10)] }));
        let req = || RetrieveRequest { task: "t".to_string(), agent_ids: vec!["a2".to_string(), "a1".to_string()], pattern: None };

        retriever.retrieve_context(req(), RetrieveOptions::default()).await;
        retriever.retrieve_context(req(), RetrieveOptions::default()).await;

        let metrics = retriever.metrics();
        assert_eq!(metrics.retrievals, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }
}

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use swarmctl::config::ContextRetrieverConfig;
use swarmctl::context_retriever::{
    Candidate, ContextRetriever, FullOrchestration, OrchestrationStore, RetrieveOptions, RetrieveRequest, SearchOptions, VectorStore,
};

struct FixedVectorStore {
    candidates: Vec<Candidate>,
}

#[async_trait]
impl VectorStore for FixedVectorStore {
    async fn search_similar(&self, _query: &str, _options: SearchOptions) -> Result<Vec<Candidate>, String> {
        Ok(self.candidates.clone())
    }
}

struct FixedOrchestrationStore {
    orchestrations: FxHashMap<String, FullOrchestration>,
}

#[async_trait]
impl OrchestrationStore for FixedOrchestrationStore {
    async fn get_orchestration_by_id(&self, id: &str) -> Option<FullOrchestration> {
        self.orchestrations.get(id).cloned()
    }
}

fn candidate(id: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        task: "do the thing".repeat(4),
        pattern: "parallel".to_string(),
        relevance: 0.9,
        agent_ids: vec!["a1".to_string()],
        timestamp: Utc::now(),
        success: true,
        token_count: None,
    }
}

fn orchestration(id: &str) -> FullOrchestration {
    FullOrchestration {
        id: id.to_string(),
        pattern: "parallel".to_string(),
        success: true,
        timestamp: Utc::now(),
        agent_ids: vec!["a1".to_string()],
        task: "do the thing".to_string(),
        observations: vec!["observed something relevant".to_string()],
        result_summary: Some("completed cleanly".to_string()),
        metadata: None,
    }
}

#[tokio::test]
async fn two_candidates_both_expand_to_full_detail_within_a_thousand_token_budget() {
    let mut orchestrations = FxHashMap::default();
    orchestrations.insert("o1".to_string(), orchestration("o1"));
    orchestrations.insert("o2".to_string(), orchestration("o2"));

    let retriever = ContextRetriever::new(ContextRetrieverConfig { max_tokens: 1000, ..ContextRetrieverConfig::default() })
        .with_vector_store(Arc::new(FixedVectorStore { candidates: vec![candidate("o1"), candidate("o2")] }))
        .with_orchestration_store(Arc::new(FixedOrchestrationStore { orchestrations }));

    let result = retriever
        .retrieve_context(
            RetrieveRequest { task: "do the thing".to_string(), agent_ids: vec!["a1".to_string()], pattern: Some("parallel".to_string()) },
            RetrieveOptions::default(),
        )
        .await;

    assert!(result.loaded);
    let layer2 = result.layer2.expect("progressive retrieval loads layer 2");
    assert_eq!(layer2.loaded, 2);
    assert_eq!(layer2.truncations, 0);
    assert!(result.token_count <= 1000);
}

#[tokio::test]
async fn agent_id_order_does_not_change_which_cache_slot_a_retrieval_lands_in() {
    let retriever = ContextRetriever::new(ContextRetrieverConfig::default())
        .with_vector_store(Arc::new(FixedVectorStore { candidates: vec![candidate("o1")] }));

    retriever
        .retrieve_context(
            RetrieveRequest { task: "t".to_string(), agent_ids: vec!["a1".to_string(), "a2".to_string()], pattern: None },
            RetrieveOptions::default(),
        )
        .await;
    retriever
        .retrieve_context(
            RetrieveRequest { task: "t".to_string(), agent_ids: vec!["a2".to_string(), "a1".to_string()], pattern: None },
            RetrieveOptions::default(),
        )
        .await;

    let metrics = retriever.metrics();
    assert_eq!(metrics.retrievals, 2);
    assert_eq!(metrics.cache_hits, 1);
}

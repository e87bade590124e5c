use std::{env, sync::Arc};

use librarian::{
    config::Config,
    index::{IndexFilter, QdrantIndex, QdrantSettings, SimilarityMetric, VectorIndex, VectorRecord},
    providers::{
        GenerationRequest, OllamaProvider, Provider, ProviderRequest, ProviderResponse,
        ProviderRouter, RouterSettings,
    },
};

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::test]
#[ignore = "Requires live Qdrant"]
async fn live_qdrant_upsert_and_query() {
    let dimension = 8;
    let index = QdrantIndex::connect(QdrantSettings {
        url: env_or("QDRANT_URL", "http://127.0.0.1:6333"),
        collection: env_or("QDRANT_COLLECTION_NAME", "librarian-live"),
        api_key: env::var("QDRANT_API_KEY").ok(),
        dimension,
        metric: SimilarityMetric::Cosine,
    })
    .await
    .expect("Qdrant should be reachable");

    let mut vector = vec![0.0; dimension];
    vector[0] = 1.0;
    index
        .upsert(vec![VectorRecord {
            chunk_id: "live-validation-chunk".into(),
            document_id: "live-validation".into(),
            vector: vector.clone(),
            dimension,
            model: "live".into(),
        }])
        .await
        .expect("upsert");

    let hits = index
        .query(
            &vector,
            1,
            &IndexFilter {
                document_ids: vec!["live-validation".into()],
            },
        )
        .await
        .expect("query");
    assert_eq!(hits.len(), 1, "expected the record just written");
    assert_eq!(hits[0].record.chunk_id, "live-validation-chunk");
}

#[tokio::test]
#[ignore = "Requires live Ollama"]
async fn live_ollama_generation_through_router() {
    let config = Config::default();
    let ollama: Arc<dyn Provider> = Arc::new(
        OllamaProvider::new(
            "ollama",
            100,
            env_or("OLLAMA_URL", "http://127.0.0.1:11434"),
            Some(env_or("OLLAMA_GENERATION_MODEL", "llama3.2")),
            None,
        )
        .expect("ollama client"),
    );
    let router = ProviderRouter::new(
        vec![ollama],
        RouterSettings {
            call_timeout: config.provider_timeout,
            ..RouterSettings::default()
        },
    );

    let routed = router
        .route(ProviderRequest::Generate(GenerationRequest::new(
            "Reply with the single word: ready",
        )))
        .await
        .expect("failed to route generation to Ollama");
    assert_eq!(routed.decision.served_by.as_deref(), Some("ollama"));
    match routed.response {
        ProviderResponse::Text(text) => assert!(!text.is_empty()),
        other => panic!("unexpected response: {other:?}"),
    }
}

//! End-to-end ingestion flows over an in-memory store and deterministic
//! in-process backends: classify → create/merge → report.

mod support;

use std::sync::Arc;

use topic_curator::completion::CompletionClient;
use topic_curator::embedding::EmbeddingClient;
use topic_curator::ingest::{IngestOptions, IngestPipeline};
use topic_curator::models::{DecisionAction, FailureStage};
use topic_curator::store::DocumentStore;

use support::{
    memory_store, seed_document, test_config, topic, KeywordEmbedder, ScriptedCompletion, DIMS,
};

struct Harness {
    store: DocumentStore,
    embedder: Arc<KeywordEmbedder>,
    completion: Arc<ScriptedCompletion>,
    pipeline: IngestPipeline,
}

async fn harness(completion_backend: ScriptedCompletion) -> Harness {
    let store = memory_store().await;
    let embedder = Arc::new(KeywordEmbedder::new());
    let completion = Arc::new(completion_backend);

    let embedding_client = Arc::new(EmbeddingClient::new(embedder.clone(), 64, 0));
    let completion_client = Arc::new(CompletionClient::new(completion.clone(), 0));

    let config = test_config();
    let pipeline = IngestPipeline::new(&config, store.clone(), embedding_client, completion_client);

    Harness {
        store,
        embedder,
        completion,
        pipeline,
    }
}

#[tokio::test]
async fn test_empty_batch_reports_nothing() {
    let h = harness(ScriptedCompletion::new()).await;
    let report = h
        .pipeline
        .run(vec![], &IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(report.topics_seen, 0);
    assert_eq!(report.created_count(), 0);
    assert_eq!(report.merged_count(), 0);
}

#[tokio::test]
async fn test_distinct_topics_create_distinct_documents() {
    let h = harness(ScriptedCompletion::new()).await;
    let topics = vec![
        topic("Alpha basics", "alpha material about the first subject"),
        topic("Beta basics", "beta material about the second subject"),
    ];

    let report = h
        .pipeline
        .run(topics, &IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.created_count(), 2);
    assert_eq!(report.merged_count(), 0);
    assert_eq!(report.failed_count(), 0);
    assert_eq!(report.llm_verifications, 0);

    let docs = h.store.list_with_embeddings(None).await.unwrap();
    assert_eq!(docs.len(), 2);
    for stored in &docs {
        assert!(!stored.embeddings.is_empty());
        for embedding in &stored.embeddings {
            assert_eq!(embedding.len(), DIMS);
        }
    }
}

#[tokio::test]
async fn test_similar_topic_merges_preserving_identity() {
    let h = harness(ScriptedCompletion::new()).await;

    // First run creates the document
    let report = h
        .pipeline
        .run(
            vec![topic("Alpha basics", "alpha material one")],
            &IngestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.created_count(), 1);
    let doc_id = report.created[0].clone();

    // Second run with a same-subject topic merges into it
    let report = h
        .pipeline
        .run(
            vec![topic("More alpha", "alpha material two")],
            &IngestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.created_count(), 0);
    assert_eq!(report.merged_count(), 1);
    assert_eq!(report.merged[0], doc_id);
    assert_eq!(report.llm_verifications, 0, "clear merge needs no llm");

    let docs = h.store.list_with_embeddings(None).await.unwrap();
    assert_eq!(docs.len(), 1, "no duplicate document");

    let doc = h.store.get(&doc_id).await.unwrap().unwrap();
    assert_eq!(doc.id, doc_id);
    assert_eq!(doc.merge_history.len(), 1);
    assert_eq!(doc.merge_history[0].topic_title, "More alpha");
    assert!(doc.content.contains("alpha material one"));
    assert!(doc.content.contains("alpha material two"));

    // Chunk set reflects the merged content, contiguous from 0
    let chunks = h.store.get_chunks(&doc_id).await.unwrap();
    assert!(!chunks.is_empty());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        assert!(chunk.embedding.is_some());
    }
}

#[tokio::test]
async fn test_duplicate_titles_in_one_run_get_distinct_ids() {
    let h = harness(ScriptedCompletion::new()).await;
    let topics = vec![
        topic("Alpha guide", "alpha material one"),
        topic("Alpha guide", "alpha material one"),
    ];

    let report = h
        .pipeline
        .run(topics, &IngestOptions::default())
        .await
        .unwrap();

    // Corpus is loaded once per batch, so both classify as create
    assert_eq!(report.created_count(), 2);
    assert_ne!(report.created[0], report.created[1]);

    let docs = h.store.list_with_embeddings(None).await.unwrap();
    assert_eq!(docs.len(), 2);
}

#[tokio::test]
async fn test_verify_band_merge_verdict() {
    let h = harness(ScriptedCompletion::with_verdict("MERGE")).await;
    seed_document(&h.store, "alpha-doc", "Alpha things", "alpha seed content").await;

    let report = h
        .pipeline
        .run(
            vec![topic("Hybrid topic", "hybrid material")],
            &IngestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.llm_verifications, 1);
    assert_eq!(h.completion.verdict_call_count(), 1);
    assert_eq!(report.merged_count(), 1);
    assert_eq!(report.merged[0], "alpha-doc");

    let (_, decision) = &report.decisions[0];
    assert_eq!(decision.action, DecisionAction::Merge);
    assert!(decision.llm_used);

    let doc = h.store.get("alpha-doc").await.unwrap().unwrap();
    assert_eq!(doc.merge_history.len(), 1);
}

#[tokio::test]
async fn test_verify_band_failure_defaults_to_create() {
    // No verdict scripted: verification calls fail
    let h = harness(ScriptedCompletion::new()).await;
    seed_document(&h.store, "alpha-doc", "Alpha things", "alpha seed content").await;

    let report = h
        .pipeline
        .run(
            vec![topic("Hybrid topic", "hybrid material")],
            &IngestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.llm_verifications, 1);
    assert_eq!(report.created_count(), 1, "failed verification must create");
    assert_eq!(report.merged_count(), 0);

    let (_, decision) = &report.decisions[0];
    assert_eq!(decision.action, DecisionAction::Create);
    assert!(!decision.llm_used);

    // The seeded document was never touched
    let doc = h.store.get("alpha-doc").await.unwrap().unwrap();
    assert!(doc.merge_history.is_empty());
    assert_eq!(doc.content, "alpha seed content");
}

#[tokio::test]
async fn test_group_targeting_one_document_folds_with_single_embed_pass() {
    let h = harness(ScriptedCompletion::new()).await;
    seed_document(&h.store, "alpha-doc", "Alpha things", "alpha seed content").await;

    let topics = vec![
        topic("Alpha one", "alpha first addition"),
        topic("Alpha two", "alpha second addition"),
        topic("Alpha three", "alpha third addition"),
    ];

    let report = h
        .pipeline
        .run(topics, &IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.merged_count(), 3);
    assert!(report.merged.iter().all(|id| id == "alpha-doc"));
    assert_eq!(report.created_count(), 0);

    let doc = h.store.get("alpha-doc").await.unwrap().unwrap();
    assert_eq!(doc.merge_history.len(), 3);
    assert!(doc.content.contains("alpha first addition"));
    assert!(doc.content.contains("alpha second addition"));
    assert!(doc.content.contains("alpha third addition"));

    // Exactly two embedding calls: one for the topic batch, one for the
    // final chunk set. Folding per-topic would have produced four.
    assert_eq!(h.embedder.call_count(), 2);
}

#[tokio::test]
async fn test_content_failures_are_isolated_per_topic() {
    let h = harness(ScriptedCompletion::failing_content()).await;
    seed_document(&h.store, "alpha-doc", "Alpha things", "alpha seed content").await;

    let topics = vec![
        // Merge path: the fold call fails, topic is lost
        topic("Alpha addition", "alpha new material"),
        // Create path: generation fails, topic content is stored verbatim
        topic("Beta piece", "beta standalone material"),
    ];

    let report = h
        .pipeline
        .run(topics, &IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.created_count(), 1);
    assert_eq!(report.merged_count(), 0);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.failed[0].topic_title, "Alpha addition");
    assert_eq!(report.failed[0].stage, FailureStage::Fold);

    // The merge target was left untouched
    let doc = h.store.get("alpha-doc").await.unwrap().unwrap();
    assert!(doc.merge_history.is_empty());
    assert_eq!(doc.content, "alpha seed content");

    // The created document fell back to the raw topic content
    let created = h.store.get(&report.created[0]).await.unwrap().unwrap();
    assert_eq!(created.content, "beta standalone material");
}

#[tokio::test]
async fn test_dry_run_classifies_without_writing() {
    let h = harness(ScriptedCompletion::new()).await;
    seed_document(&h.store, "alpha-doc", "Alpha things", "alpha seed content").await;

    let topics = vec![
        topic("Alpha again", "alpha repeat material"),
        topic("Beta fresh", "beta new material"),
    ];

    let options = IngestOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = h.pipeline.run(topics, &options).await.unwrap();

    assert_eq!(report.topics_seen, 2);
    assert_eq!(report.decisions.len(), 2);
    assert_eq!(report.created_count(), 0);
    assert_eq!(report.merged_count(), 0);

    let actions: Vec<DecisionAction> =
        report.decisions.iter().map(|(_, d)| d.action).collect();
    assert_eq!(actions, vec![DecisionAction::Merge, DecisionAction::Create]);

    // Nothing written: still just the seeded document, untouched
    let docs = h.store.list_with_embeddings(None).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0].document.merge_history.is_empty());
}

#[tokio::test]
async fn test_limit_truncates_batch() {
    let h = harness(ScriptedCompletion::new()).await;
    let topics = vec![
        topic("Alpha piece", "alpha material"),
        topic("Beta piece", "beta material"),
        topic("Gamma piece", "gamma material"),
    ];

    let options = IngestOptions {
        limit: Some(1),
        ..Default::default()
    };
    let report = h.pipeline.run(topics, &options).await.unwrap();

    assert_eq!(report.topics_seen, 1);
    assert_eq!(report.created_count(), 1);
    let docs = h.store.list_with_embeddings(None).await.unwrap();
    assert_eq!(docs.len(), 1);
}

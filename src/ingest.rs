//! Ingestion pipeline orchestration.
//!
//! Coordinates one batch: embed all topics up front (one batch call),
//! classify each against the stored corpus, partition into creates and
//! per-target merge groups, then materialize under a bounded worker pool.
//! Pre-grouping by target id guarantees at most one writer per document;
//! distinct documents proceed in parallel.
//!
//! Per-topic failures are isolated and collected into the
//! [`IngestReport`]; nothing short of a config or database error aborts
//! the batch.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::completion::CompletionClient;
use crate::config::Config;
use crate::creator::DocumentCreator;
use crate::decision::DecisionEngine;
use crate::embedding::EmbeddingClient;
use crate::merger::DocumentMerger;
use crate::models::{
    DecisionAction, Document, FailureStage, IngestReport, Topic, TopicFailure,
};
use crate::store::DocumentStore;

#[derive(Default)]
pub struct IngestOptions {
    /// Classify and report without writing.
    pub dry_run: bool,
    /// Process at most this many topics.
    pub limit: Option<usize>,
    /// Cooperative cancellation flag, checked between units of work.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl IngestOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

pub struct IngestPipeline {
    store: DocumentStore,
    embedding: Arc<EmbeddingClient>,
    engine: Arc<DecisionEngine>,
    creator: DocumentCreator,
    merger: DocumentMerger,
    concurrency: usize,
}

enum TaskResult {
    Created { id: String },
    Merged { id: String, merged_topics: usize, failures: Vec<TopicFailure> },
    Failed(TopicFailure),
}

impl IngestPipeline {
    pub fn new(
        config: &Config,
        store: DocumentStore,
        embedding: Arc<EmbeddingClient>,
        completion: Arc<CompletionClient>,
    ) -> Self {
        let engine = Arc::new(DecisionEngine::new(
            config.decision.clone(),
            completion.clone(),
        ));
        let creator = DocumentCreator::new(
            store.clone(),
            embedding.clone(),
            completion.clone(),
            config.chunking.clone(),
            config.generation.clone(),
        );
        let merger = DocumentMerger::new(
            store.clone(),
            embedding.clone(),
            completion,
            config.chunking.clone(),
            config.generation.clone(),
        );

        Self {
            store,
            embedding,
            engine,
            creator,
            merger,
            concurrency: config.ingest.concurrency,
        }
    }

    /// Run one ingestion batch.
    pub async fn run(&self, mut topics: Vec<Topic>, options: &IngestOptions) -> Result<IngestReport> {
        if let Some(limit) = options.limit {
            topics.truncate(limit);
        }

        let mut report = IngestReport {
            topics_seen: topics.len(),
            ..Default::default()
        };

        if topics.is_empty() {
            return Ok(report);
        }

        // Existing corpus with its stored embeddings, loaded once per batch
        let corpus = self.store.list_with_embeddings(None).await?;
        info!(
            topics = topics.len(),
            corpus = corpus.len(),
            "starting ingestion batch"
        );

        // One batch embedding pass over every topic
        let texts: Vec<String> = topics.iter().map(|t| t.embedding_text()).collect();
        let topic_embeddings = match self.embedding.embed_many(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(error = %e, "topic embedding failed for the whole batch");
                for topic in &topics {
                    report.failed.push(TopicFailure {
                        topic_title: topic.title.clone(),
                        stage: FailureStage::Embedding,
                        reason: format!("{:#}", e),
                    });
                }
                return Ok(report);
            }
        };

        // Classify and partition
        let verify_calls_before = self.engine.verify_call_count();
        let mut creates: Vec<Topic> = Vec::new();
        let mut merge_targets: HashMap<String, Vec<Topic>> = HashMap::new();

        for (topic, embedding) in topics.into_iter().zip(topic_embeddings.iter()) {
            if options.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let decision = self.engine.decide(&topic, embedding, &corpus).await;
            report.decisions.push((topic.title.clone(), decision.clone()));

            match decision.action {
                DecisionAction::Create => creates.push(topic),
                DecisionAction::Merge => {
                    // target_document_id is always present on merge decisions
                    let target = decision.target_document_id.clone().unwrap_or_default();
                    merge_targets.entry(target).or_default().push(topic);
                }
            }
        }
        report.llm_verifications = self.engine.verify_call_count() - verify_calls_before;

        if options.dry_run || report.cancelled {
            return Ok(report);
        }

        // Resolve merge targets to their stored documents
        let doc_lookup: HashMap<&str, &Document> = corpus
            .iter()
            .map(|stored| (stored.document.id.as_str(), &stored.document))
            .collect();

        let mut merge_groups: Vec<(Document, Vec<Topic>)> = Vec::new();
        for (target_id, group) in merge_targets {
            match doc_lookup.get(target_id.as_str()) {
                Some(document) => merge_groups.push(((*document).clone(), group)),
                None => {
                    for topic in group {
                        report.failed.push(TopicFailure {
                            topic_title: topic.title.clone(),
                            stage: FailureStage::Store,
                            reason: format!("merge target {} not found", target_id),
                        });
                    }
                }
            }
        }

        // Materialize under a bounded worker pool; distinct documents in
        // parallel, same-target topics already serialized by grouping
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();

        for topic in creates {
            if options.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let creator = self.creator.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return TaskResult::Failed(TopicFailure {
                            topic_title: topic.title.clone(),
                            stage: FailureStage::Store,
                            reason: "worker pool closed".to_string(),
                        });
                    }
                };
                match creator.create_one(&topic).await {
                    Ok(document) => TaskResult::Created { id: document.id },
                    Err(e) => TaskResult::Failed(e.into_failure(&topic.title)),
                }
            });
        }

        for (target, group) in merge_groups {
            if options.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let merger = self.merger.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let failures = group
                            .iter()
                            .map(|topic| TopicFailure {
                                topic_title: topic.title.clone(),
                                stage: FailureStage::Store,
                                reason: "worker pool closed".to_string(),
                            })
                            .collect();
                        return TaskResult::Merged {
                            id: target.id.clone(),
                            merged_topics: 0,
                            failures,
                        };
                    }
                };
                let id = target.id.clone();
                let group_size = group.len();
                let (updated, failures) = merger.merge_group(target, &group).await;
                let merged_topics = if updated.is_some() {
                    group_size - failures.len()
                } else {
                    0
                };
                TaskResult::Merged {
                    id,
                    merged_topics,
                    failures,
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(TaskResult::Created { id }) => report.created.push(id),
                Ok(TaskResult::Merged {
                    id,
                    merged_topics,
                    mut failures,
                }) => {
                    for _ in 0..merged_topics {
                        report.merged.push(id.clone());
                    }
                    report.failed.append(&mut failures);
                }
                Ok(TaskResult::Failed(failure)) => report.failed.push(failure),
                Err(join_err) => {
                    report.failed.push(TopicFailure {
                        topic_title: "<unknown>".to_string(),
                        stage: FailureStage::Store,
                        reason: format!("worker task aborted: {}", join_err),
                    });
                }
            }
        }

        info!(
            created = report.created_count(),
            merged = report.merged_count(),
            failed = report.failed_count(),
            "ingestion batch finished"
        );

        Ok(report)
    }
}

//! Embedding stage: reuse, compute, normalize, compare.
//!
//! Every post (and, when `embedding.embed_media` is set, every media item)
//! ends up with at most one L2-normalized vector keyed by content hash.
//! Vectors from the previous build are reused verbatim when the hash is
//! unchanged. Everything else is chunked, embedded in bounded concurrent
//! batches, averaged per item and normalized.
//!
//! The stage never fails the build. Provider errors and timeouts drop the
//! affected batch and are recorded as `EmbeddingError` issues.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::{chunk_text, Chunk};
use crate::config::EmbeddingConfig;
use crate::embedding::{l2_normalize, mean_vector, EmbeddingProvider};
use crate::issues::{examples, Issue, IssueCategory, IssueCollector};
use crate::models::{Media, Post};
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::similarity::{ambiguous_hashes, pairwise_similarity, top_k, Neighbor};

/// Vectors keyed by content hash.
pub type VectorMap = HashMap<String, Vec<f32>>;

/// Source of the previous build's vectors.
#[async_trait]
pub trait PreviousEmbeddings: Send + Sync {
    async fn load(&self) -> Result<VectorMap>;
}

/// First build: nothing to reuse.
pub struct NoPrevious;

#[async_trait]
impl PreviousEmbeddings for NoPrevious {
    async fn load(&self) -> Result<VectorMap> {
        Ok(VectorMap::new())
    }
}

/// Vectors handed in by the caller.
pub struct InMemoryPrevious(pub VectorMap);

#[async_trait]
impl PreviousEmbeddings for InMemoryPrevious {
    async fn load(&self) -> Result<VectorMap> {
        Ok(self.0.clone())
    }
}

/// Vectors read back from earlier build artifacts.
///
/// A missing file means there was no earlier build. A file that exists but
/// cannot be read or parsed is an error.
pub struct ArtifactPrevious {
    paths: Vec<PathBuf>,
}

impl ArtifactPrevious {
    /// Read a single `hash → vector` JSON file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
        }
    }

    /// Read both the post and media vector artifacts of an output directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            paths: vec![
                dir.join(crate::artifacts::POST_EMBEDDINGS),
                dir.join(crate::artifacts::MEDIA_EMBEDDINGS),
            ],
        }
    }
}

#[async_trait]
impl PreviousEmbeddings for ArtifactPrevious {
    async fn load(&self) -> Result<VectorMap> {
        let mut map = VectorMap::new();
        for path in &self.paths {
            let raw = match tokio::fs::read_to_string(path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to read previous embeddings {}", path.display())
                    })
                }
            };
            let vectors: VectorMap = serde_json::from_str(&raw).with_context(|| {
                format!("Invalid previous embeddings file {}", path.display())
            })?;
            map.extend(vectors);
        }
        Ok(map)
    }
}

/// Counters reported in the build summary.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingCounts {
    pub reused: usize,
    pub computed: usize,
    pub failed: usize,
    /// Items left without a vector: no text, or the provider is disabled.
    pub skipped: usize,
    pub dims: Option<usize>,
}

/// Everything the stage produces.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutputs {
    /// Post vectors by content hash.
    pub hash_map: BTreeMap<String, Vec<f32>>,
    /// Post vectors by slug (first post wins on duplicate slugs).
    pub slug_map: BTreeMap<String, Vec<f32>>,
    /// Media vectors by identity.
    pub media_map: BTreeMap<String, Vec<f32>>,
    pub similarity: BTreeMap<String, f32>,
    pub top_k: BTreeMap<String, Vec<Neighbor>>,
    pub counts: EmbeddingCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Post,
    Media,
}

struct Item<'a> {
    kind: ItemKind,
    hash: &'a str,
    slug: Option<&'a str>,
    text: String,
}

/// Runs the embedding stage for one build.
pub struct EmbeddingStage<'a> {
    pub config: &'a EmbeddingConfig,
    pub top_k: usize,
    pub provider: &'a dyn EmbeddingProvider,
    pub progress: &'a dyn BuildProgressReporter,
    pub job_id: &'a str,
}

impl EmbeddingStage<'_> {
    pub async fn run(
        &self,
        posts: &[Post],
        media: &[Media],
        previous: &dyn PreviousEmbeddings,
        issues: &mut IssueCollector,
    ) -> EmbeddingOutputs {
        let previous = match previous.load().await {
            Ok(map) => map,
            Err(e) => {
                issues.push(Issue::warning(
                    IssueCategory::EmbeddingError,
                    format!("Could not load previous embeddings: {:#}", e),
                    "Embeddings, similarity and related posts are empty for this build; \
                     fix or delete the previous embedding artifacts",
                ));
                return EmbeddingOutputs::default();
            }
        };

        let enabled = self.provider.is_enabled();
        let provider_dims = Some(self.provider.dims()).filter(|d| enabled && *d > 0);

        // A cached vector of another length than the provider produces is a miss
        let items = self.collect_items(posts, media);
        let stale: HashSet<&str> = items
            .iter()
            .filter(|item| {
                previous
                    .get(item.hash)
                    .is_some_and(|v| provider_dims.is_some_and(|d| d != v.len()))
            })
            .map(|item| item.hash)
            .collect();
        if !stale.is_empty() {
            tracing::info!(
                job_id = self.job_id,
                stale = stale.len(),
                dims = ?provider_dims,
                "cached vectors have another dimension; re-embedding"
            );
        }
        let pending: Vec<&Item> = items
            .iter()
            .filter(|item| !previous.contains_key(item.hash) || stale.contains(item.hash))
            .collect();

        let (sendable, empty): (Vec<&Item>, Vec<&Item>) = pending
            .into_iter()
            .partition(|item| !item.text.trim().is_empty());

        let mut counts = EmbeddingCounts {
            skipped: empty.len(),
            ..Default::default()
        };
        let computed = if sendable.is_empty() {
            HashMap::new()
        } else if !enabled {
            tracing::info!(
                job_id = self.job_id,
                items = sendable.len(),
                "embedding provider disabled; new items left without vectors"
            );
            counts.skipped += sendable.len();
            HashMap::new()
        } else {
            let computed = self.compute(&sendable, issues).await;
            counts.failed = sendable.len() - computed.len();
            computed
        };

        // Fresh vectors define the dimension; cached ones only when nothing was computed
        let dims = items
            .iter()
            .find_map(|item| computed.get(item.hash))
            .map(Vec::len)
            .or(provider_dims)
            .or_else(|| {
                items
                    .iter()
                    .find_map(|item| previous.get(item.hash))
                    .map(Vec::len)
            });

        let mut outputs = EmbeddingOutputs::default();
        let mut mismatched = Vec::new();

        for item in &items {
            let (vector, reused) = match computed.get(item.hash) {
                Some(v) => (v.clone(), false),
                None => match previous.get(item.hash) {
                    Some(v) if !stale.contains(item.hash) => (v.clone(), true),
                    _ => continue,
                },
            };

            if dims.is_some_and(|d| d != vector.len()) {
                mismatched.push(item.hash.to_string());
                continue;
            }

            if reused {
                counts.reused += 1;
            } else {
                counts.computed += 1;
            }

            match item.kind {
                ItemKind::Post => {
                    if let Some(slug) = item.slug {
                        outputs
                            .slug_map
                            .entry(slug.to_string())
                            .or_insert_with(|| vector.clone());
                    }
                    outputs.hash_map.insert(item.hash.to_string(), vector);
                }
                ItemKind::Media => {
                    outputs.media_map.insert(item.hash.to_string(), vector);
                }
            }
        }

        if !mismatched.is_empty() {
            issues.push(
                Issue::warning(
                    IssueCategory::EmbeddingError,
                    format!(
                        "{} vectors dropped: dimension differs from {}",
                        mismatched.len(),
                        dims.unwrap_or_default()
                    ),
                    "Previous embeddings may come from a different model; delete them to recompute",
                )
                .with_context(json!({
                    "expectedDims": dims,
                    "examples": examples(mismatched.iter().cloned()),
                })),
            );
            counts.failed += mismatched.len();
        }

        counts.dims = dims;

        if outputs.hash_map.len() < 2 {
            tracing::info!(
                job_id = self.job_id,
                posts = outputs.hash_map.len(),
                "fewer than two post vectors; similarity skipped"
            );
        } else {
            let ambiguous = ambiguous_hashes(outputs.hash_map.keys());
            if !ambiguous.is_empty() {
                issues.push(
                    Issue::warning(
                        IssueCategory::ContentWarning,
                        format!(
                            "{} post hashes contain '-'; similarity keys may be ambiguous",
                            ambiguous.len()
                        ),
                        "Use hex content hashes for posts",
                    )
                    .with_context(json!({
                        "examples": examples(ambiguous.iter().copied()),
                    })),
                );
            }
            outputs.similarity = pairwise_similarity(&outputs.hash_map);
            outputs.top_k = top_k(&outputs.hash_map, self.top_k);
        }

        tracing::info!(
            job_id = self.job_id,
            reused = counts.reused,
            computed = counts.computed,
            failed = counts.failed,
            pairs = outputs.similarity.len(),
            "embedding stage finished"
        );

        outputs.counts = counts;
        outputs
    }

    fn collect_items<'p>(&self, posts: &'p [Post], media: &'p [Media]) -> Vec<Item<'p>> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(posts.len());

        for post in posts {
            if !seen.insert(post.hash.as_str()) {
                continue;
            }
            let text = if post.title.is_empty() {
                post.text().to_string()
            } else {
                format!("{}\n\n{}", post.title, post.text())
            };
            items.push(Item {
                kind: ItemKind::Post,
                hash: &post.hash,
                slug: Some(&post.slug),
                text,
            });
        }

        if self.config.embed_media {
            for m in media {
                if !seen.insert(m.identity()) {
                    continue;
                }
                let text = match &m.mime_type {
                    Some(mime) => format!("{} {}", m.filename, mime),
                    None => m.filename.clone(),
                };
                items.push(Item {
                    kind: ItemKind::Media,
                    hash: m.identity(),
                    slug: None,
                    text,
                });
            }
        }

        items
    }

    /// Embed `pending` items. Items of failed batches are absent from the
    /// returned map.
    async fn compute(&self, pending: &[&Item<'_>], issues: &mut IssueCollector) -> VectorMap {
        let chunks: Vec<Chunk> = pending
            .iter()
            .flat_map(|item| chunk_text(item.hash, &item.text, self.config.max_tokens))
            .collect();
        let batches: Vec<&[Chunk]> = chunks.chunks(self.config.batch_size.max(1)).collect();
        let total = batches.len() as u64;
        let limit = batch_timeout(self.config);
        let provider = self.provider;

        let mut results = futures::stream::iter(batches.iter().copied().enumerate().map(
            |(index, batch)| {
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                async move {
                    let result = tokio::time::timeout(limit, provider.embed(&texts)).await;
                    (index, result)
                }
            },
        ))
        .buffered(self.config.concurrency.max(1));

        let mut chunk_vectors: HashMap<&str, Vec<Vec<f32>>> = HashMap::new();
        let mut failed: HashSet<&str> = HashSet::new();
        let mut done = 0u64;

        while let Some((index, result)) = results.next().await {
            done += 1;
            self.progress.report(BuildProgressEvent::EmbeddingBatches {
                job_id: self.job_id.to_string(),
                n: done,
                total,
            });

            let batch = batches[index];
            let error = match result {
                Ok(Ok(vectors)) if vectors.len() == batch.len() => {
                    for (chunk, vector) in batch.iter().zip(vectors) {
                        chunk_vectors
                            .entry(chunk.item.as_str())
                            .or_default()
                            .push(vector);
                    }
                    continue;
                }
                Ok(Ok(vectors)) => format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                ),
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("timed out after {}s", limit.as_secs()),
            };

            let mut affected: Vec<&str> = batch.iter().map(|c| c.item.as_str()).collect();
            affected.dedup();
            failed.extend(affected.iter().copied());
            issues.push(
                Issue::warning(
                    IssueCategory::EmbeddingError,
                    format!("Embedding batch {} of {} failed: {}", index + 1, total, error),
                    "Affected items have no vector in this build and are retried next build",
                )
                .with_context(json!({
                    "batch": index,
                    "items": affected.len(),
                    "examples": examples(affected.iter().copied()),
                })),
            );
        }

        let mut vectors = VectorMap::new();
        for item in pending {
            if failed.contains(item.hash) {
                continue;
            }
            let Some(parts) = chunk_vectors.get(item.hash) else {
                continue;
            };
            match mean_vector(parts) {
                Some(mean) => {
                    vectors.insert(item.hash.to_string(), l2_normalize(mean));
                }
                None => {
                    tracing::warn!(item = item.hash, "chunk vectors disagree on dimension");
                }
            }
        }
        vectors
    }
}

/// Upper bound for one provider call including its retries and backoff.
fn batch_timeout(config: &EmbeddingConfig) -> Duration {
    let attempts = u64::from(config.max_retries) + 1;
    let backoff: u64 = (1..attempts).map(|a| 1u64 << (a - 1).min(5)).sum();
    Duration::from_secs(config.timeout_secs.max(1) * attempts + backoff)
}

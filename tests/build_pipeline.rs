//! End-to-end builds driven through `run_build`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use content_snapshot::artifacts;
use content_snapshot::config::BuildConfig;
use content_snapshot::db;
use content_snapshot::embed_stage::InMemoryPrevious;
use content_snapshot::embedding::EmbeddingProvider;
use content_snapshot::issues::{IssueCategory, IssueReport};
use content_snapshot::models::{Corpus, Media, Post};
use content_snapshot::pipeline::{run_build, BuildJob, BuildStage};

/// Deterministic provider: the vector depends only on the text.
struct MockProvider {
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let len = t.len() as f32;
                let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
                vec![1.0, len, vowels]
            })
            .collect())
    }
}

struct FailingProvider;

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("upstream returned 500")
    }
}

fn config_in(dir: &Path) -> BuildConfig {
    let mut config = BuildConfig::default();
    config.output.dir = dir.to_path_buf();
    config
}

fn post(hash: &str, slug: &str, content: &str, frontmatter: Value) -> Post {
    Post {
        hash: hash.into(),
        slug: slug.into(),
        title: slug.to_uppercase(),
        content: content.into(),
        frontmatter,
        path: format!("content/{}.md", slug),
        ..Default::default()
    }
}

fn count(report: &IssueReport, category: IssueCategory) -> usize {
    report
        .issues
        .iter()
        .filter(|i| i.category == category)
        .count()
}

fn read_json(dir: &Path, name: &str) -> Value {
    let raw = std::fs::read_to_string(dir.join(name)).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn test_similarity_and_top_k_from_known_vectors() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(tmp.path());
    config.similarity.top_k = 1;

    // Unit vectors with e1·e2 = 0.9, e1·e3 = 0.2, e2·e3 = 0.1
    let e1 = vec![1.0f32, 0.0, 0.0];
    let e2 = vec![0.9f32, 0.435_889_9, 0.0];
    let e3 = vec![0.2f32, -0.183_533_4, 0.962_453_2];
    let previous: HashMap<String, Vec<f32>> = [
        ("h1".to_string(), e1.clone()),
        ("h2".to_string(), e2.clone()),
        ("h3".to_string(), e3.clone()),
    ]
    .into_iter()
    .collect();

    let corpus = Corpus::new(
        vec![
            post("h1", "one", "first", Value::Null),
            post("h2", "two", "second", Value::Null),
            post("h3", "three", "third", Value::Null),
        ],
        Vec::new(),
    );
    let job = BuildJob::new(corpus).with_previous(InMemoryPrevious(previous));
    let ctx = run_build(&config, job, None).await.unwrap();

    let embeddings = ctx.embeddings.as_ref().unwrap();
    assert_eq!(embeddings.counts.reused, 3);
    assert_eq!(embeddings.hash_map["h1"], e1);

    let keys: Vec<&str> = embeddings.similarity.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["h1-h2", "h1-h3", "h2-h3"]);
    assert!((embeddings.similarity["h1-h2"] - 0.9).abs() < 1e-4);
    assert!((embeddings.similarity["h1-h3"] - 0.2).abs() < 1e-4);
    assert!((embeddings.similarity["h2-h3"] - 0.1).abs() < 1e-4);

    let neighbors = &embeddings.top_k["h1"];
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].hash, "h2");

    let similar = read_json(tmp.path(), artifacts::SIMILAR_POSTS);
    assert_eq!(similar["h1"], json!(["h2"]));
}

#[tokio::test]
async fn test_mixed_tags_become_arrays_in_snapshot() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let corpus = Corpus::new(
        vec![
            post("ha", "a", "Alpha", json!({"tags": "solo"})),
            post("hb", "b", "Beta", json!({"tags": ["a", "b"]})),
        ],
        Vec::new(),
    );

    let ctx = run_build(&config, BuildJob::new(corpus), None).await.unwrap();

    let schema = ctx.schema.as_ref().unwrap();
    let tags = schema.property("tags").unwrap();
    let type_names: Vec<String> = tags.types.iter().map(|t| t.name()).collect();
    assert!(type_names.contains(&"string".to_string()));
    assert!(type_names.contains(&"array<string>".to_string()));
    assert_eq!(tags.recommended_type.name(), "array<string>");

    let report = ctx.issue_report.as_ref().unwrap();
    assert!(count(report, IssueCategory::SchemaConflict) >= 1);

    let pool = db::connect(&config.snapshot_path()).await.unwrap();
    let row = sqlx::query("SELECT tags, frontmatter FROM posts WHERE id = 'ha'")
        .fetch_one(&pool)
        .await
        .unwrap();
    let column: String = row.get("tags");
    assert_eq!(column, "[\"solo\"]");
    let normalized: String = row.get("frontmatter");
    let normalized: Value = serde_json::from_str(&normalized).unwrap();
    assert_eq!(normalized, json!({"tags": ["solo"]}));
    pool.close().await;

    let on_disk = read_json(tmp.path(), artifacts::FRONTMATTER_SCHEMA);
    assert!(on_disk["properties"]["tags"].is_object());
}

#[tokio::test]
async fn test_orphaned_media_reported_with_examples() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let media: Vec<Media> = (0..10)
        .map(|i| Media {
            id: format!("m{}", i),
            hash: format!("mh{}", i),
            filename: format!("photo-{}.jpg", i),
            path: format!("assets/photo-{}.jpg", i),
            ..Default::default()
        })
        .collect();
    let body: String = (0..6)
        .map(|i| format!("![shot](assets/photo-{}.jpg)\n", i))
        .collect();
    let corpus = Corpus::new(
        vec![post("hg", "gallery", &body, json!({"title": "Gallery"}))],
        media,
    );

    let ctx = run_build(&config, BuildJob::new(corpus), None).await.unwrap();

    let health = ctx.health.as_ref().unwrap();
    let orphan = health
        .issues
        .iter()
        .find(|i| i.message.contains("not referenced"))
        .unwrap();
    let context = orphan.context.as_ref().unwrap();
    assert_eq!(context["totalOrphaned"], 4);
    let examples = context["examples"].as_array().unwrap();
    assert!(!examples.is_empty() && examples.len() <= 5);
    assert!(examples.contains(&json!("photo-9.jpg")));

    let on_disk = read_json(tmp.path(), artifacts::CONTENT_HEALTH);
    assert_eq!(on_disk["totalMedia"], 10);
}

#[tokio::test]
async fn test_broken_previous_embeddings_degrade_build() {
    let tmp = TempDir::new().unwrap();
    let previous_dir = tmp.path().join("previous");
    std::fs::create_dir_all(&previous_dir).unwrap();
    std::fs::write(previous_dir.join(artifacts::POST_EMBEDDINGS), "{ not json").unwrap();

    let out = tmp.path().join("out");
    let config = config_in(&out);
    let provider = MockProvider::new();
    let corpus = Corpus::new(
        vec![
            post("h1", "one", "first post", Value::Null),
            post("h2", "two", "second post", Value::Null),
        ],
        Vec::new(),
    );
    let job = BuildJob::new(corpus).with_previous_artifacts(&previous_dir);

    let ctx = run_build(&config, job, Some(&provider)).await.unwrap();

    assert_eq!(ctx.stage, BuildStage::Done);
    let embeddings = ctx.embeddings.as_ref().unwrap();
    assert!(embeddings.hash_map.is_empty());
    assert!(embeddings.similarity.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    let report = ctx.issue_report.as_ref().unwrap();
    assert_eq!(count(report, IssueCategory::EmbeddingError), 1);
    assert!(ctx.snapshot.is_some());
    assert!(out.join(artifacts::BUILD_ISSUES).exists());
}

#[tokio::test]
async fn test_second_build_reuses_vectors_by_hash() {
    let tmp = TempDir::new().unwrap();
    let first_dir = tmp.path().join("first");
    let second_dir = tmp.path().join("second");

    let posts = vec![
        post("h1", "one", "alpha bravo", Value::Null),
        post("h2", "two", "charlie delta echo", Value::Null),
    ];

    let first_provider = MockProvider::new();
    let first = run_build(
        &config_in(&first_dir),
        BuildJob::new(Corpus::new(posts.clone(), Vec::new())),
        Some(&first_provider),
    )
    .await
    .unwrap();
    let first_vectors = first.embeddings.as_ref().unwrap().hash_map.clone();
    assert_eq!(first_vectors.len(), 2);
    assert_eq!(first.embeddings.as_ref().unwrap().counts.computed, 2);

    let mut changed = posts;
    changed.push(post("h3", "three", "foxtrot", Value::Null));
    let second_provider = MockProvider::new();
    let second = run_build(
        &config_in(&second_dir),
        BuildJob::new(Corpus::new(changed, Vec::new())).with_previous_artifacts(&first_dir),
        Some(&second_provider),
    )
    .await
    .unwrap();

    let outputs = second.embeddings.as_ref().unwrap();
    assert_eq!(outputs.counts.reused, 2);
    assert_eq!(outputs.counts.computed, 1);
    assert_eq!(second_provider.texts.load(Ordering::SeqCst), 1);
    for hash in ["h1", "h2"] {
        let before: Vec<u32> = first_vectors[hash].iter().map(|v| v.to_bits()).collect();
        let after: Vec<u32> = outputs.hash_map[hash].iter().map(|v| v.to_bits()).collect();
        assert_eq!(before, after, "vector for {} changed", hash);
    }
    assert_eq!(outputs.similarity.len(), 3);
    assert!(outputs.slug_map.contains_key("three"));
}

#[tokio::test]
async fn test_failing_provider_keeps_build_alive() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(tmp.path());
    config.embedding.batch_size = 1;
    config.embedding.max_retries = 0;

    let corpus = Corpus::new(
        vec![
            post("h1", "one", "first", Value::Null),
            post("h2", "two", "second", Value::Null),
        ],
        Vec::new(),
    );
    let ctx = run_build(&config, BuildJob::new(corpus), Some(&FailingProvider))
        .await
        .unwrap();

    let embeddings = ctx.embeddings.as_ref().unwrap();
    assert!(embeddings.hash_map.is_empty());
    assert!(embeddings.top_k.is_empty());
    assert_eq!(embeddings.counts.failed, 2);

    let report = ctx.issue_report.as_ref().unwrap();
    assert_eq!(count(report, IssueCategory::EmbeddingError), 2);
    assert!(!report.issues.iter().any(|i| i.category == IssueCategory::BuildError));
}

#[tokio::test]
async fn test_summary_lists_verified_artifacts_and_files() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path());
    let provider = MockProvider::new();
    let corpus = Corpus::new(
        vec![
            post("h1", "one", "first", json!({"title": "One", "rating": 4})),
            post("h2", "two", "second", json!({"title": "Two", "rating": 5})),
        ],
        Vec::new(),
    );

    let ctx = run_build(&config, BuildJob::new(corpus), Some(&provider))
        .await
        .unwrap();

    assert!(ctx.finished_at.is_some());
    assert!(ctx.artifacts.iter().all(|a| a.verified));
    let stats = ctx.snapshot_stats.as_ref().unwrap();
    assert_eq!(stats.posts, 2);
    assert_eq!(stats.property_columns, 2);

    let summary = read_json(tmp.path(), artifacts::BUILD_SUMMARY);
    assert_eq!(summary["jobId"], ctx.job_id.as_str());
    assert_eq!(summary["posts"], 2);
    assert_eq!(summary["embeddings"]["computed"], 2);
    assert_eq!(summary["similarityPairs"], 1);
    assert_eq!(summary["snapshot"]["posts"], 2);

    let files: Vec<&str> = summary["files"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|f| f["name"].as_str())
        .collect();
    assert!(files.contains(&"snapshot.sqlite"));
    assert!(files.contains(&artifacts::SIMILARITY));
    assert!(!files.contains(&artifacts::BUILD_SUMMARY));

    let issues = read_json(tmp.path(), artifacts::BUILD_ISSUES);
    assert_eq!(issues["jobId"], ctx.job_id.as_str());
}

#[tokio::test]
async fn test_output_dir_that_is_a_file_fails_build() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("dist");
    std::fs::write(&blocker, "not a directory").unwrap();
    let config = config_in(&blocker);

    let result = run_build(
        &config,
        BuildJob::new(Corpus::new(
            vec![post("h1", "one", "first", Value::Null)],
            Vec::new(),
        )),
        None,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(
        std::fs::read_to_string(&blocker).unwrap(),
        "not a directory"
    );
}

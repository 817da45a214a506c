//! Build orchestration.
//!
//! [`run_build`] sequences the stages of one build job over an additive
//! [`BuildContext`]:
//!
//! ```text
//! Ingested ─┬─ SchemaAnalysis ─┬─ Snapshot ─ Validation ─ Summaries ─ Report ─ Done
//!           └─ Embeddings ─────┘
//! ```
//!
//! Schema analysis and embedding run concurrently with their own issue
//! collectors; the collectors are merged schema-first once both finish.
//! Every later stage only fills in more of the context.
//!
//! Recoverable problems become issues in the final report. Only a failed
//! snapshot load or a failed artifact write aborts the build; in that case
//! a `BuildError` issue is added, `build-issues.json` is flushed on a best
//! effort basis, and the error is returned.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use crate::artifacts::{self, ArtifactRecord, FileSummary};
use crate::config::BuildConfig;
use crate::embed_stage::{
    ArtifactPrevious, EmbeddingCounts, EmbeddingOutputs, EmbeddingStage, NoPrevious,
    PreviousEmbeddings,
};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::issues::{Issue, IssueCategory, IssueCollector, IssueReport, IssueSummary};
use crate::models::Corpus;
use crate::progress::{BuildProgressEvent, BuildProgressReporter, NoProgress, ProgressMode};
use crate::schema::{analyze_frontmatter, FrontmatterSchema};
use crate::similarity::neighbor_hashes;
use crate::snapshot::{build_snapshot, SnapshotSummary};
use crate::stats::{snapshot_stats, SnapshotStats};
use crate::validate::{validate_corpus, HealthReport};

pub use crate::progress::BuildStage;

/// One build request: the corpus plus where to find last build's vectors.
pub struct BuildJob {
    pub corpus: Corpus,
    pub previous: Box<dyn PreviousEmbeddings>,
    pub progress: Box<dyn BuildProgressReporter>,
}

impl BuildJob {
    pub fn new(corpus: Corpus) -> Self {
        Self {
            corpus,
            previous: Box::new(NoPrevious),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_previous(mut self, previous: impl PreviousEmbeddings + 'static) -> Self {
        self.previous = Box::new(previous);
        self
    }

    /// Reuse vectors from the artifacts of an earlier build in `dir`.
    pub fn with_previous_artifacts(self, dir: &Path) -> Self {
        self.with_previous(ArtifactPrevious::in_dir(dir))
    }

    pub fn with_progress(mut self, mode: ProgressMode) -> Self {
        self.progress = mode.reporter();
        self
    }
}

/// Accumulated state of a build. Stages only ever add to it.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub job_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    /// Last stage entered.
    pub stage: BuildStage,
    pub output_dir: PathBuf,
    pub corpus: Arc<Corpus>,
    pub schema: Option<FrontmatterSchema>,
    pub embeddings: Option<EmbeddingOutputs>,
    pub snapshot: Option<SnapshotSummary>,
    pub snapshot_stats: Option<SnapshotStats>,
    pub health: Option<HealthReport>,
    pub artifacts: Vec<ArtifactRecord>,
    pub files: Vec<FileSummary>,
    pub issue_report: Option<IssueReport>,
}

impl BuildContext {
    fn new(corpus: Corpus, output_dir: PathBuf) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            stage: BuildStage::Ingested,
            output_dir,
            corpus: Arc::new(corpus),
            schema: None,
            embeddings: None,
            snapshot: None,
            snapshot_stats: None,
            health: None,
            artifacts: Vec::new(),
            files: Vec::new(),
            issue_report: None,
        }
    }

    fn enter(&mut self, stage: BuildStage, progress: &dyn BuildProgressReporter) {
        self.stage = stage;
        tracing::info!(job_id = %self.job_id, stage = stage.as_str(), "stage started");
        progress.report(BuildProgressEvent::Stage {
            job_id: self.job_id.clone(),
            stage,
        });
    }

    fn record(&mut self, record: ArtifactRecord) {
        self.artifacts.push(record);
    }
}

/// Contents of `build-summary.json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildSummary<'a> {
    job_id: &'a str,
    started_at: &'a str,
    finished_at: String,
    duration_ms: u128,
    posts: usize,
    media: usize,
    schema: serde_json::Value,
    embeddings: EmbeddingCounts,
    similarity_pairs: usize,
    snapshot: Option<&'a SnapshotStats>,
    artifacts: &'a [ArtifactRecord],
    files: &'a [FileSummary],
    issues: IssueSummary,
}

/// Run one build.
///
/// `provider` overrides the provider named in `config.embedding`; pass
/// `None` to construct it from the configuration. A provider that cannot be
/// constructed degrades the embedding stage instead of failing the build.
///
/// The returned context carries the issue report; a successful build may
/// still contain warnings.
pub async fn run_build(
    config: &BuildConfig,
    job: BuildJob,
    provider: Option<&dyn EmbeddingProvider>,
) -> Result<BuildContext> {
    let BuildJob {
        corpus,
        previous,
        progress,
    } = job;

    let mut ctx = BuildContext::new(corpus, config.output.dir.clone());
    let mut issues = IssueCollector::new();
    let span = tracing::info_span!("build", job_id = %ctx.job_id);

    let result = execute(
        &mut ctx,
        config,
        previous.as_ref(),
        provider,
        progress.as_ref(),
        &mut issues,
    )
    .instrument(span)
    .await;

    match result {
        Ok(()) => Ok(ctx),
        Err(e) => {
            tracing::error!(
                job_id = %ctx.job_id,
                stage = ctx.stage.as_str(),
                error = %format!("{:#}", e),
                "build failed"
            );
            issues.push(
                Issue::error(
                    IssueCategory::BuildError,
                    format!("Build failed during {}: {:#}", ctx.stage, e),
                    "See the log for this job id; no artifacts of this build should be published",
                )
                .with_context(json!({
                    "jobId": ctx.job_id,
                    "stage": ctx.stage,
                })),
            );
            flush_issue_report(&ctx.output_dir, &issues.report(&ctx.job_id));
            Err(e.context(format!(
                "Build {} failed at stage {}",
                ctx.job_id, ctx.stage
            )))
        }
    }
}

async fn execute(
    ctx: &mut BuildContext,
    config: &BuildConfig,
    previous: &dyn PreviousEmbeddings,
    provider: Option<&dyn EmbeddingProvider>,
    progress: &dyn BuildProgressReporter,
    issues: &mut IssueCollector,
) -> Result<()> {
    let clock = Instant::now();

    ctx.enter(BuildStage::Ingested, progress);
    tracing::info!(
        posts = ctx.corpus.posts.len(),
        media = ctx.corpus.media.len(),
        "corpus ingested"
    );

    // Schema analysis ‖ embeddings
    ctx.enter(BuildStage::SchemaAnalysis, progress);
    progress.report(BuildProgressEvent::Stage {
        job_id: ctx.job_id.clone(),
        stage: BuildStage::Embeddings,
    });

    let schema_branch = analyze_schema(
        Arc::clone(&ctx.corpus),
        config.schema.rare_property_ratio,
    );
    let embed_branch = embed(ctx, config, previous, provider, progress);
    let ((schema, schema_issues), (embeddings, embed_issues)) =
        tokio::join!(schema_branch, embed_branch);

    issues.merge(schema_issues);
    issues.merge(embed_issues);
    ctx.stage = BuildStage::Embeddings;
    ctx.schema = Some(schema);
    ctx.embeddings = Some(embeddings);

    // Snapshot
    ctx.enter(BuildStage::Snapshot, progress);
    let snapshot_path = config.snapshot_path();
    let summary = build_snapshot(
        &snapshot_path,
        &ctx.corpus.posts,
        &ctx.corpus.media,
        ctx.schema.as_ref(),
        config.snapshot.normalization,
        issues,
    )
    .await?;
    ctx.snapshot = Some(summary);

    // Validation
    ctx.enter(BuildStage::Validation, progress);
    let health = validate_corpus(
        &ctx.corpus.posts,
        &ctx.corpus.media,
        ctx.schema.as_ref(),
        &config.validation,
        issues,
    );
    ctx.health = Some(health);

    // Artifacts and derived-file summaries
    ctx.enter(BuildStage::Summaries, progress);
    write_stage_artifacts(ctx, config, issues)?;

    match snapshot_stats(&snapshot_path).await {
        Ok(stats) => ctx.snapshot_stats = Some(stats),
        Err(e) => issues.push(Issue::warning(
            IssueCategory::FileSystemError,
            format!("Could not read back snapshot statistics: {:#}", e),
            "Open the snapshot file manually to check it is intact",
        )),
    }

    match artifacts::summarize_dir(&ctx.output_dir) {
        Ok(files) => {
            ctx.files = files
                .into_iter()
                .filter(|f| f.name != artifacts::BUILD_SUMMARY && f.name != artifacts::BUILD_ISSUES)
                .collect();
        }
        Err(e) => issues.push(Issue::warning(
            IssueCategory::FileSystemError,
            format!("Could not summarize the output directory: {:#}", e),
            "Check permissions on the output directory",
        )),
    }

    let finished_at = chrono::Utc::now().to_rfc3339();
    let embeddings = ctx.embeddings.as_ref();
    let summary = BuildSummary {
        job_id: &ctx.job_id,
        started_at: &ctx.started_at,
        finished_at: finished_at.clone(),
        duration_ms: clock.elapsed().as_millis(),
        posts: ctx.corpus.posts.len(),
        media: ctx.corpus.media.len(),
        schema: ctx
            .schema
            .as_ref()
            .map(|s| {
                json!({
                    "properties": s.properties.len(),
                    "conflicts": s.conflicts().count(),
                    "degraded": s.degraded,
                })
            })
            .unwrap_or_default(),
        embeddings: embeddings.map(|e| e.counts).unwrap_or_default(),
        similarity_pairs: embeddings.map_or(0, |e| e.similarity.len()),
        snapshot: ctx.snapshot_stats.as_ref(),
        artifacts: &ctx.artifacts,
        files: &ctx.files,
        issues: issues.report(&ctx.job_id).summary,
    };
    let record = artifacts::write_json(&ctx.output_dir, artifacts::BUILD_SUMMARY, &summary, issues)?;
    ctx.record(record);

    // Final report
    ctx.enter(BuildStage::Report, progress);
    let report = issues.report(&ctx.job_id);
    let record = artifacts::write_json(&ctx.output_dir, artifacts::BUILD_ISSUES, &report, issues)?;
    ctx.record(record);
    ctx.issue_report = Some(report);

    ctx.finished_at = Some(finished_at);
    ctx.enter(BuildStage::Done, progress);
    tracing::info!(
        duration_ms = clock.elapsed().as_millis() as u64,
        issues = issues.len(),
        errors = issues.has_errors(),
        "build finished"
    );
    Ok(())
}

/// Schema branch: runs the analyzer off the async runtime's worker.
async fn analyze_schema(
    corpus: Arc<Corpus>,
    rare_ratio: f64,
) -> (FrontmatterSchema, IssueCollector) {
    let mut branch = IssueCollector::new();
    let total = corpus.posts.len();

    let result = tokio::task::spawn_blocking(move || analyze_frontmatter(&corpus.posts)).await;
    let schema = match result {
        Ok(Ok(schema)) => {
            schema.record_issues(rare_ratio, &mut branch);
            schema
        }
        Ok(Err(e)) => degraded_schema(total, format!("{:#}", e), &mut branch),
        Err(e) => degraded_schema(total, e.to_string(), &mut branch),
    };
    (schema, branch)
}

fn degraded_schema(total: usize, reason: String, issues: &mut IssueCollector) -> FrontmatterSchema {
    issues.push(Issue::error(
        IssueCategory::SchemaConflict,
        format!("Frontmatter schema analysis failed: {}", reason),
        "Frontmatter is stored only as raw JSON for this build; fix the offending post",
    ));
    FrontmatterSchema::degraded(total)
}

/// Embedding branch: resolves the provider, then runs the stage.
async fn embed(
    ctx: &BuildContext,
    config: &BuildConfig,
    previous: &dyn PreviousEmbeddings,
    provider: Option<&dyn EmbeddingProvider>,
    progress: &dyn BuildProgressReporter,
) -> (EmbeddingOutputs, IssueCollector) {
    let mut branch = IssueCollector::new();

    let created;
    let provider: &dyn EmbeddingProvider = match provider {
        Some(p) => p,
        None => match create_provider(&config.embedding) {
            Ok(p) => {
                created = p;
                created.as_ref()
            }
            Err(e) => {
                branch.push(Issue::warning(
                    IssueCategory::EmbeddingError,
                    format!("Embedding provider could not be set up: {:#}", e),
                    "Check the [embedding] section of the configuration",
                ));
                return (EmbeddingOutputs::default(), branch);
            }
        },
    };

    let stage = EmbeddingStage {
        config: &config.embedding,
        top_k: config.similarity.top_k,
        provider,
        progress,
        job_id: &ctx.job_id,
    };
    let outputs = stage
        .run(&ctx.corpus.posts, &ctx.corpus.media, previous, &mut branch)
        .await;
    (outputs, branch)
}

/// Per-stage JSON and Markdown artifacts.
fn write_stage_artifacts(
    ctx: &mut BuildContext,
    config: &BuildConfig,
    issues: &mut IssueCollector,
) -> Result<()> {
    let dir = ctx.output_dir.clone();
    let mut records = Vec::new();

    if let Some(schema) = &ctx.schema {
        records.push(artifacts::write_json(&dir, artifacts::FRONTMATTER_SCHEMA, schema, issues)?);
        records.push(artifacts::write_text(
            &dir,
            artifacts::FRONTMATTER_SCHEMA_REPORT,
            &schema.report_markdown(config.schema.rare_property_ratio),
            issues,
        )?);
    }

    if let Some(embeddings) = &ctx.embeddings {
        records.push(artifacts::write_json(
            &dir,
            artifacts::POST_EMBEDDINGS,
            &embeddings.hash_map,
            issues,
        )?);
        records.push(artifacts::write_json(
            &dir,
            artifacts::POST_EMBEDDINGS_BY_SLUG,
            &embeddings.slug_map,
            issues,
        )?);
        records.push(artifacts::write_json(
            &dir,
            artifacts::MEDIA_EMBEDDINGS,
            &embeddings.media_map,
            issues,
        )?);
        records.push(artifacts::write_json(
            &dir,
            artifacts::SIMILARITY,
            &embeddings.similarity,
            issues,
        )?);
        records.push(artifacts::write_json(
            &dir,
            artifacts::SIMILAR_POSTS,
            &neighbor_hashes(&embeddings.top_k),
            issues,
        )?);
    }

    if let Some(health) = &ctx.health {
        records.push(artifacts::write_json(&dir, artifacts::CONTENT_HEALTH, health, issues)?);
    }

    for record in records {
        ctx.record(record);
    }
    Ok(())
}

/// Best-effort write of the issue report after a fatal error.
fn flush_issue_report(dir: &Path, report: &IssueReport) {
    let result = std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))
        .and_then(|_| Ok(serde_json::to_string_pretty(report)?))
        .and_then(|body| {
            let path = dir.join(artifacts::BUILD_ISSUES);
            std::fs::write(&path, body)
                .with_context(|| format!("Failed to write {}", path.display()))
        });
    if let Err(e) = result {
        tracing::error!(error = %format!("{:#}", e), "could not flush build issue report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Post;
    use serde_json::json;
    use tempfile::TempDir;

    fn config_in(dir: &Path) -> BuildConfig {
        let mut config = BuildConfig::default();
        config.output.dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_disabled_build_writes_every_artifact() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let corpus = Corpus::new(
            vec![Post {
                hash: "h1".into(),
                slug: "one".into(),
                title: "One".into(),
                content: "Body".into(),
                frontmatter: json!({"draft": false}),
                ..Default::default()
            }],
            Vec::new(),
        );

        let ctx = run_build(&config, BuildJob::new(corpus), None).await.unwrap();

        assert_eq!(ctx.stage, BuildStage::Done);
        assert!(ctx.schema.is_some());
        assert!(ctx.snapshot.is_some());
        assert!(ctx.health.is_some());
        assert!(ctx.issue_report.is_some());
        for name in [
            "snapshot.sqlite",
            artifacts::FRONTMATTER_SCHEMA,
            artifacts::FRONTMATTER_SCHEMA_REPORT,
            artifacts::POST_EMBEDDINGS,
            artifacts::POST_EMBEDDINGS_BY_SLUG,
            artifacts::MEDIA_EMBEDDINGS,
            artifacts::SIMILARITY,
            artifacts::SIMILAR_POSTS,
            artifacts::CONTENT_HEALTH,
            artifacts::BUILD_SUMMARY,
            artifacts::BUILD_ISSUES,
        ] {
            assert!(tmp.path().join(name).exists(), "missing {}", name);
        }
        assert!(ctx.artifacts.iter().all(|a| a.verified));
        assert!(ctx.files.iter().any(|f| f.name == "snapshot.sqlite"));
    }

    #[tokio::test]
    async fn test_non_object_frontmatter_degrades_schema() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let corpus = Corpus::new(
            vec![Post {
                hash: "h1".into(),
                slug: "one".into(),
                frontmatter: json!(["not", "a", "map"]),
                ..Default::default()
            }],
            Vec::new(),
        );

        let ctx = run_build(&config, BuildJob::new(corpus), None).await.unwrap();
        let schema = ctx.schema.unwrap();
        assert!(schema.degraded);
        let report = ctx.issue_report.unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::SchemaConflict
                && i.severity == crate::issues::Severity::Error));
    }

    #[tokio::test]
    async fn test_fatal_error_flushes_report() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        // A directory where the snapshot file should be makes the load fail
        std::fs::create_dir_all(tmp.path().join("snapshot.sqlite")).unwrap();
        config.snapshot.file_name = "snapshot.sqlite".into();

        let err = run_build(&config, BuildJob::new(Corpus::default()), None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("snapshot"));

        let raw = std::fs::read_to_string(tmp.path().join(artifacts::BUILD_ISSUES)).unwrap();
        let report: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(report["issues"]
            .as_array()
            .unwrap()
            .iter()
            .any(|i| i["category"] == "BuildError" && i["severity"] == "error"));
    }
}

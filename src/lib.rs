//! # Content Snapshot
//!
//! Build and indexing pipeline for a Markdown content corpus.
//!
//! Given parsed posts and media, a build infers a typed schema from the
//! posts' frontmatter, writes a queryable SQLite snapshot, embeds every post
//! (reusing vectors from the previous build when the content hash is
//! unchanged), computes pairwise similarity and top-K neighbors, and runs
//! content health checks. Problems are collected into a structured issue
//! report instead of aborting the build.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────┐
//!          ┌──▶│ Schema analysis  │──┐
//! ┌──────┐ │   └──────────────────┘  │   ┌──────────┐   ┌────────────┐   ┌───────────┐
//! │ Job  │─┤                         ├──▶│ Snapshot │──▶│ Validation │──▶│ Artifacts │
//! └──────┘ │   ┌──────────────────┐  │   │ (SQLite) │   └────────────┘   │ + report  │
//!          └──▶│ Embeddings       │──┘   └──────────┘                    └───────────┘
//!              └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use content_snapshot::config::load_config;
//! use content_snapshot::models::Corpus;
//! use content_snapshot::pipeline::{run_build, BuildJob};
//! use content_snapshot::progress::ProgressMode;
//! # async fn demo() -> anyhow::Result<()> {
//! let config = load_config("snapshot.toml".as_ref())?;
//! let corpus = Corpus::load_dir("content/.parsed".as_ref())?;
//! let job = BuildJob::new(corpus)
//!     .with_previous_artifacts(&config.output.dir)
//!     .with_progress(ProgressMode::default_for_tty());
//! let ctx = run_build(&config, job, None).await?;
//! if let Some(report) = &ctx.issue_report {
//!     println!("{} issues", report.summary.total);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Posts, media and the corpus |
//! | [`issues`] | Issue taxonomy and collector |
//! | [`schema`] | Frontmatter schema inference |
//! | [`normalize`] | Frontmatter normalization modes |
//! | [`lookup`] | Ordered post lookup strategies |
//! | [`db`] | SQLite connection |
//! | [`snapshot`] | Relational snapshot builder |
//! | [`stats`] | Snapshot row counts |
//! | [`chunk`] | Text chunking for embedding |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_stage`] | Embedding reuse and batching |
//! | [`similarity`] | Pairwise similarity and top-K |
//! | [`validate`] | Content health checks |
//! | [`artifacts`] | Artifact writing and verification |
//! | [`progress`] | Build progress reporting |
//! | [`pipeline`] | Build orchestration |
//! | [`logging`] | Log subscriber setup |

pub mod artifacts;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_stage;
pub mod embedding;
pub mod issues;
pub mod logging;
pub mod lookup;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod schema;
pub mod similarity;
pub mod snapshot;
pub mod stats;
pub mod validate;

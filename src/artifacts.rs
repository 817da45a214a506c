//! Build artifact writing and verification.
//!
//! Every artifact is written in full, read back, and compared by SHA-256
//! against the bytes that were meant to land on disk. A failed write aborts
//! the build; a failed verification is only reported.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::issues::{Issue, IssueCategory, IssueCollector};

pub const FRONTMATTER_SCHEMA: &str = "frontmatter-schema.json";
pub const FRONTMATTER_SCHEMA_REPORT: &str = "frontmatter-schema-report.md";
pub const POST_EMBEDDINGS: &str = "post-embeddings.json";
pub const POST_EMBEDDINGS_BY_SLUG: &str = "post-embeddings-by-slug.json";
pub const MEDIA_EMBEDDINGS: &str = "media-embeddings.json";
pub const SIMILARITY: &str = "similarity.json";
pub const SIMILAR_POSTS: &str = "similar-posts.json";
pub const CONTENT_HEALTH: &str = "content-health.json";
pub const BUILD_SUMMARY: &str = "build-summary.json";
pub const BUILD_ISSUES: &str = "build-issues.json";

/// One artifact written by this build.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub verified: bool,
}

/// A file found in the output directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    /// Path relative to the output directory, `/`-separated.
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serialize `value` as pretty JSON into `dir/name`, then verify it.
pub fn write_json<T: Serialize + ?Sized>(
    dir: &Path,
    name: &str,
    value: &T,
    issues: &mut IssueCollector,
) -> Result<ArtifactRecord> {
    let body = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", name))?;
    write_text(dir, name, &body, issues)
}

/// Write `body` into `dir/name`, then verify it.
pub fn write_text(
    dir: &Path,
    name: &str,
    body: &str,
    issues: &mut IssueCollector,
) -> Result<ArtifactRecord> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, body.as_bytes())
        .with_context(|| format!("Failed to write artifact {}", path.display()))?;

    let expected = sha256_hex(body.as_bytes());
    let verified = verify(&path, &expected, issues);

    tracing::debug!(artifact = name, bytes = body.len(), verified, "artifact written");

    Ok(ArtifactRecord {
        name: name.to_string(),
        path,
        size: body.len() as u64,
        sha256: expected,
        verified,
    })
}

fn verify(path: &Path, expected: &str, issues: &mut IssueCollector) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match std::fs::read(path) {
        Ok(bytes) => {
            let actual = sha256_hex(&bytes);
            if actual == expected {
                return true;
            }
            issues.push(
                Issue::warning(
                    IssueCategory::FileSystemError,
                    format!("Artifact {} does not match what was written", name),
                    "Check for concurrent writers or a full disk in the output directory",
                )
                .with_context(json!({
                    "path": path.display().to_string(),
                    "expectedSha256": expected,
                    "actualSha256": actual,
                })),
            );
        }
        Err(e) => {
            issues.push(
                Issue::warning(
                    IssueCategory::FileSystemError,
                    format!("Artifact {} could not be read back: {}", name, e),
                    "Check permissions on the output directory",
                )
                .with_context(json!({"path": path.display().to_string()})),
            );
        }
    }
    false
}

/// Walk `dir` and hash every regular file, sorted by relative path.
pub fn summarize_dir(dir: &Path) -> Result<Vec<FileSummary>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push(FileSummary {
            name,
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

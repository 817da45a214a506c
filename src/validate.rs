//! Content health checks over the finished corpus.
//!
//! Each check is independent and non-fatal. A check that cannot run is
//! marked `skipped` in the [`HealthReport`] and the remaining checks carry
//! on. Every issue lists at most [`MAX_EXAMPLES`](crate::issues::MAX_EXAMPLES)
//! offending items.

use anyhow::{bail, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

use crate::config::ValidationConfig;
use crate::issues::{examples, Issue, IssueCategory, IssueCollector};
use crate::models::{Media, Post};
use crate::schema::FrontmatterSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub issues: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Written as `content-health.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub generated_at: String,
    pub total_posts: usize,
    pub total_media: usize,
    pub checks: Vec<CheckResult>,
    pub issues: Vec<Issue>,
}

impl HealthReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

struct CheckInput<'a> {
    posts: &'a [Post],
    media: &'a [Media],
    schema: Option<&'a FrontmatterSchema>,
    config: &'a ValidationConfig,
}

type Check = fn(&CheckInput<'_>) -> Result<Vec<Issue>>;

const CHECKS: &[(&str, Check)] = &[
    ("empty-corpus", check_empty_corpus),
    ("content-ratio", check_content_ratio),
    ("required-fields", check_required_fields),
    ("thin-content", check_thin_content),
    ("orphaned-media", check_orphaned_media),
];

/// Run every check, record issues in `issues`, and return the report.
pub fn validate_corpus(
    posts: &[Post],
    media: &[Media],
    schema: Option<&FrontmatterSchema>,
    config: &ValidationConfig,
    issues: &mut IssueCollector,
) -> HealthReport {
    let corpus = CheckInput {
        posts,
        media,
        schema,
        config,
    };

    let mut checks = Vec::with_capacity(CHECKS.len());
    let mut found = Vec::new();

    for &(name, check) in CHECKS {
        let result = match check(&corpus) {
            Ok(check_issues) => {
                let status = if check_issues.is_empty() {
                    CheckStatus::Passed
                } else {
                    CheckStatus::Failed
                };
                let count = check_issues.len();
                found.extend(check_issues);
                CheckResult {
                    name,
                    status,
                    issues: count,
                    reason: None,
                }
            }
            Err(e) => {
                tracing::warn!(check = name, error = %e, "health check skipped");
                CheckResult {
                    name,
                    status: CheckStatus::Skipped,
                    issues: 0,
                    reason: Some(e.to_string()),
                }
            }
        };
        checks.push(result);
    }

    for issue in &found {
        issues.push(issue.clone());
    }

    HealthReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        total_posts: posts.len(),
        total_media: media.len(),
        checks,
        issues: found,
    }
}

fn check_empty_corpus(corpus: &CheckInput<'_>) -> Result<Vec<Issue>> {
    let mut out = Vec::new();
    if corpus.posts.is_empty() {
        out.push(Issue::warning(
            IssueCategory::ConfigWarning,
            "The corpus contains no posts",
            "Check that the content source path is correct",
        ));
    }
    if corpus.media.is_empty() {
        out.push(Issue::warning(
            IssueCategory::ConfigWarning,
            "The corpus contains no media",
            "Ignore this if the site has no images or attachments",
        ));
    }
    Ok(out)
}

fn check_content_ratio(corpus: &CheckInput<'_>) -> Result<Vec<Issue>> {
    let total = corpus.posts.len() + corpus.media.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let ratio = corpus.posts.len() as f64 / total as f64;
    if ratio >= corpus.config.min_content_ratio {
        return Ok(Vec::new());
    }
    Ok(vec![Issue::warning(
        IssueCategory::ContentWarning,
        format!(
            "Only {:.1}% of items are posts ({} posts, {} media)",
            ratio * 100.0,
            corpus.posts.len(),
            corpus.media.len()
        ),
        "Large media folders without notes are often unintended; prune unused attachments",
    )
    .with_context(json!({
        "ratio": ratio,
        "threshold": corpus.config.min_content_ratio,
    }))])
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Whether `post` lacks `field`, honouring the title and date fallbacks.
fn missing_field(post: &Post, field: &str) -> bool {
    let value = post.frontmatter_map().and_then(|m| m.get(field));
    if !is_blank(value) {
        return false;
    }
    match field {
        "title" => post.title.trim().is_empty(),
        "date" => post.created.as_deref().map_or(true, |c| c.trim().is_empty()),
        _ => true,
    }
}

fn check_required_fields(corpus: &CheckInput<'_>) -> Result<Vec<Issue>> {
    if corpus.schema.is_some_and(|s| s.degraded) {
        bail!("frontmatter schema unavailable");
    }
    let fields = &corpus.config.required_fields;
    if corpus.posts.is_empty() || fields.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_field: BTreeMap<&str, usize> = BTreeMap::new();
    let mut offenders = Vec::new();

    for post in corpus.posts {
        let missing: Vec<&str> = fields
            .iter()
            .map(String::as_str)
            .filter(|f| missing_field(post, f))
            .collect();
        if missing.is_empty() {
            continue;
        }
        for field in &missing {
            *by_field.entry(*field).or_default() += 1;
        }
        offenders.push(json!({"slug": post.slug, "missing": missing}));
    }

    if offenders.is_empty() {
        return Ok(Vec::new());
    }

    let percent = offenders.len() as f64 * 100.0 / corpus.posts.len() as f64;
    Ok(vec![Issue::warning(
        IssueCategory::ContentWarning,
        format!(
            "{:.1}% of posts ({} of {}) are missing required frontmatter fields",
            percent,
            offenders.len(),
            corpus.posts.len()
        ),
        format!("Add {} to the frontmatter of these posts", fields.join(", ")),
    )
    .with_context(json!({
        "percentMissing": percent,
        "postsMissing": offenders.len(),
        "byField": by_field,
        "examples": examples(offenders),
    }))])
}

fn check_thin_content(corpus: &CheckInput<'_>) -> Result<Vec<Issue>> {
    let min = corpus.config.thin_content_chars;
    let thin: Vec<&Post> = corpus
        .posts
        .iter()
        .filter(|p| p.text().trim().chars().count() < min)
        .collect();

    if thin.is_empty() {
        return Ok(Vec::new());
    }

    Ok(vec![Issue::warning(
        IssueCategory::ContentWarning,
        format!("{} posts have less than {} characters of text", thin.len(), min),
        "Expand these notes or exclude them from publishing",
    )
    .with_context(json!({
        "totalThin": thin.len(),
        "threshold": min,
        "examples": examples(thin.iter().map(|p| p.slug.clone())),
    }))])
}

/// Lowercased basename of a reference, without query, fragment or alias.
pub fn normalize_ref(reference: &str) -> String {
    let reference = reference.trim();
    let reference = reference
        .split(['?', '#', '|'])
        .next()
        .unwrap_or(reference);
    let reference = reference.replace("%20", " ");
    let base = reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference.as_str());
    base.trim().to_lowercase()
}

struct RefPatterns {
    markdown: Regex,
    html: Regex,
    wiki: Regex,
}

impl RefPatterns {
    fn new() -> Result<Self> {
        Ok(Self {
            // Either `<path with spaces>` or a bare path, then an optional title
            markdown: Regex::new(
                r#"!\[[^\]]*\]\(\s*(?:<([^>]+)>|([^)\s]+))(?:\s+"[^"]*")?\s*\)"#,
            )?,
            html: Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)?,
            wiki: Regex::new(r"!\[\[([^\]]+)\]\]")?,
        })
    }

    fn collect(&self, text: &str, into: &mut HashSet<String>) {
        for re in [&self.markdown, &self.html, &self.wiki] {
            for caps in re.captures_iter(text) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                    into.insert(normalize_ref(m.as_str()));
                }
            }
        }
    }
}

/// Every normalized media reference made by any post.
fn referenced_media(posts: &[Post]) -> Result<HashSet<String>> {
    let patterns = RefPatterns::new()?;
    let mut refs = HashSet::new();
    for post in posts {
        patterns.collect(&post.content, &mut refs);
        if let Some(html) = &post.html {
            patterns.collect(html, &mut refs);
        }
        for media_ref in &post.media {
            refs.insert(normalize_ref(&media_ref.id));
        }
    }
    Ok(refs)
}

fn is_referenced(media: &Media, refs: &HashSet<String>) -> bool {
    let mut keys = vec![
        normalize_ref(&media.filename),
        normalize_ref(&media.path),
        media.id.to_lowercase(),
        media.hash.to_lowercase(),
    ];
    if let Some(url) = &media.url {
        keys.push(normalize_ref(url));
    }
    keys.iter().any(|k| !k.is_empty() && refs.contains(k))
}

fn check_orphaned_media(corpus: &CheckInput<'_>) -> Result<Vec<Issue>> {
    if corpus.media.is_empty() {
        return Ok(Vec::new());
    }
    let refs = referenced_media(corpus.posts)?;
    let orphans: Vec<&Media> = corpus
        .media
        .iter()
        .filter(|m| !is_referenced(m, &refs))
        .collect();

    if orphans.is_empty() {
        return Ok(Vec::new());
    }

    Ok(vec![Issue::warning(
        IssueCategory::ContentWarning,
        format!("{} media files are not referenced by any post", orphans.len()),
        "Delete unused attachments or link them from a note",
    )
    .with_context(json!({
        "totalOrphaned": orphans.len(),
        "examples": examples(orphans.iter().map(|m| m.filename.clone())),
    }))])
}

//! Build issue taxonomy and the collector threaded through every stage.
//!
//! Stages never log-and-forget a problem with the corpus: they push an
//! [`Issue`] into the [`IssueCollector`] they were handed. The orchestrator
//! merges collectors from concurrent branches and turns the result into an
//! [`IssueReport`] at the end of the build.

use serde::Serialize;
use std::collections::BTreeMap;

/// Upper bound on example offenders attached to a single issue.
pub const MAX_EXAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum IssueCategory {
    ConfigWarning,
    ContentWarning,
    SchemaConflict,
    EmbeddingError,
    FileSystemError,
    BuildError,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::ConfigWarning => "ConfigWarning",
            IssueCategory::ContentWarning => "ContentWarning",
            IssueCategory::SchemaConflict => "SchemaConflict",
            IssueCategory::EmbeddingError => "EmbeddingError",
            IssueCategory::FileSystemError => "FileSystemError",
            IssueCategory::BuildError => "BuildError",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub message: String,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl Issue {
    pub fn warning(
        category: IssueCategory,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            message: message.into(),
            suggestion: suggestion.into(),
            context: None,
        }
    }

    pub fn error(
        category: IssueCategory,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Error,
            ..Self::warning(category, message, suggestion)
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Take at most [`MAX_EXAMPLES`] items for an issue's context.
pub fn examples<I, T>(items: I) -> Vec<T>
where
    I: IntoIterator<Item = T>,
{
    items.into_iter().take(MAX_EXAMPLES).collect()
}

/// Accumulates issues for one build (or one branch of it).
#[derive(Debug, Default, Clone)]
pub struct IssueCollector {
    issues: Vec<Issue>,
}

impl IssueCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: Issue) {
        match issue.severity {
            Severity::Warning => tracing::warn!(
                category = issue.category.as_str(),
                "{}",
                issue.message
            ),
            Severity::Error => tracing::error!(
                category = issue.category.as_str(),
                "{}",
                issue.message
            ),
        }
        self.issues.push(issue);
    }

    /// Append another collector's issues, preserving their order.
    pub fn merge(&mut self, other: IssueCollector) {
        self.issues.extend(other.issues);
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, category: IssueCategory) -> usize {
        self.issues.iter().filter(|i| i.category == category).count()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn report(&self, job_id: &str) -> IssueReport {
        IssueReport::from_issues(job_id, self.issues.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSummary {
    pub total: usize,
    pub errors: usize,
    pub warnings: usize,
    pub by_category: BTreeMap<String, usize>,
}

/// The aggregated build issue report written as `build-issues.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueReport {
    pub job_id: String,
    pub generated_at: String,
    pub summary: IssueSummary,
    pub issues: Vec<Issue>,
}

impl IssueReport {
    pub fn from_issues(job_id: &str, issues: Vec<Issue>) -> Self {
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        for issue in &issues {
            *by_category
                .entry(issue.category.as_str().to_string())
                .or_insert(0) += 1;
        }
        let errors = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count();

        Self {
            job_id: job_id.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            summary: IssueSummary {
                total: issues.len(),
                errors,
                warnings: issues.len() - errors,
                by_category,
            },
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_preserves_order() {
        let mut a = IssueCollector::new();
        a.push(Issue::warning(IssueCategory::SchemaConflict, "first", ""));
        let mut b = IssueCollector::new();
        b.push(Issue::error(IssueCategory::EmbeddingError, "second", ""));
        a.merge(b);
        let messages: Vec<&str> = a.issues().iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert!(a.has_errors());
    }

    #[test]
    fn test_report_summary_counts() {
        let mut c = IssueCollector::new();
        c.push(Issue::warning(IssueCategory::ContentWarning, "thin", ""));
        c.push(Issue::warning(IssueCategory::ContentWarning, "orphans", ""));
        c.push(Issue::error(IssueCategory::BuildError, "boom", ""));
        let report = c.report("job-1");
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.warnings, 2);
        assert_eq!(report.summary.by_category["ContentWarning"], 2);
    }

    #[test]
    fn test_issue_serializes_camel_case() {
        let issue = Issue::warning(IssueCategory::ConfigWarning, "no posts", "add posts")
            .with_context(json!({"totalPosts": 0}));
        let value = serde_json::to_value(&issue).unwrap();
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["category"], "ConfigWarning");
        assert_eq!(value["context"]["totalPosts"], 0);
    }

    #[test]
    fn test_examples_caps_at_five() {
        let ex = examples(0..20);
        assert_eq!(ex, vec![0, 1, 2, 3, 4]);
    }
}

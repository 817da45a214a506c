//! Frontmatter schema inference.
//!
//! Walks every post's frontmatter and infers, per property, a canonical
//! value type and the SQLite storage type used for it in the snapshot.
//! Analysis is pure: it reads the corpus and returns an immutable
//! [`FrontmatterSchema`]. Applying the schema to storage is the snapshot
//! builder's job (see [`crate::snapshot`]).
//!
//! # Resolution order
//!
//! 1. A single observed type wins.
//! 2. `date` and `date-us` together resolve to `date` (ISO-8601).
//! 3. `string` and `array<string>` together resolve to `array<string>`.
//! 4. Otherwise the most frequent type wins; ties go to the
//!    lexicographically smallest type name.
//!
//! `null` never takes part in resolution; it only marks a property nullable.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::issues::{examples, Issue, IssueCategory, IssueCollector};
use crate::models::Post;

/// Columns of the `posts` table that frontmatter columns must never shadow.
pub const CORE_POST_COLUMNS: &[&str] = &[
    "id",
    "slug",
    "title",
    "content",
    "backlinks",
    "word_count",
    "created",
    "modified",
    "path",
    "type",
    "frontmatter_raw",
    "frontmatter",
];

/// SQLite keywords. Column names matching one of these are flagged and
/// must be quoted.
const SQLITE_KEYWORDS: &[&str] = &[
    "abort", "action", "add", "after", "all", "alter", "always", "analyze", "and", "as", "asc",
    "attach", "autoincrement", "before", "begin", "between", "by", "cascade", "case", "cast",
    "check", "collate", "column", "commit", "conflict", "constraint", "create", "cross",
    "current", "current_date", "current_time", "current_timestamp", "database", "default",
    "deferrable", "deferred", "delete", "desc", "detach", "distinct", "do", "drop", "each",
    "else", "end", "escape", "except", "exclude", "exclusive", "exists", "explain", "fail",
    "filter", "first", "following", "for", "foreign", "from", "full", "generated", "glob",
    "group", "groups", "having", "if", "ignore", "immediate", "in", "index", "indexed",
    "initially", "inner", "insert", "instead", "intersect", "into", "is", "isnull", "join",
    "key", "last", "left", "like", "limit", "match", "materialized", "natural", "no", "not",
    "nothing", "notnull", "null", "nulls", "of", "offset", "on", "or", "order", "others",
    "outer", "over", "partition", "plan", "pragma", "preceding", "primary", "query", "raise",
    "range", "recursive", "references", "regexp", "reindex", "release", "rename", "replace",
    "restrict", "returning", "right", "rollback", "row", "rows", "savepoint", "select", "set",
    "table", "temp", "temporary", "then", "ties", "to", "transaction", "trigger", "unbounded",
    "union", "unique", "update", "using", "vacuum", "values", "view", "virtual", "when",
    "where", "window", "with", "without",
];

const MAX_SAMPLES: usize = 3;

/// Runtime type of a single frontmatter value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    Null,
    Boolean,
    Number,
    String,
    /// ISO-8601 date or datetime.
    Date,
    /// `MM/DD/YYYY`.
    DateUs,
    Array(Box<ValueType>),
    /// Element type of an array whose elements disagree.
    Mixed,
    /// Element type of an empty array.
    Empty,
    Object,
}

impl ValueType {
    pub fn array_of(element: ValueType) -> Self {
        ValueType::Array(Box::new(element))
    }

    pub fn name(&self) -> String {
        match self {
            ValueType::Null => "null".to_string(),
            ValueType::Boolean => "boolean".to_string(),
            ValueType::Number => "number".to_string(),
            ValueType::String => "string".to_string(),
            ValueType::Date => "date".to_string(),
            ValueType::DateUs => "date-us".to_string(),
            ValueType::Array(inner) => format!("array<{}>", inner.name()),
            ValueType::Mixed => "mixed".to_string(),
            ValueType::Empty => "empty".to_string(),
            ValueType::Object => "object".to_string(),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ValueType::Array(_))
    }

    fn is_empty_array(&self) -> bool {
        matches!(self, ValueType::Array(inner) if **inner == ValueType::Empty)
    }

    fn is_date(&self) -> bool {
        matches!(self, ValueType::Date | ValueType::DateUs)
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            ValueType::Boolean => StorageType::Integer,
            ValueType::Number => StorageType::Real,
            _ => StorageType::Text,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for ValueType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// SQLite column affinity a property is stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageType {
    Integer,
    Real,
    Text,
}

impl StorageType {
    pub fn sql(&self) -> &'static str {
        match self {
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
            StorageType::Text => "TEXT",
        }
    }
}

/// Classify a JSON value.
pub fn classify(value: &Value) -> ValueType {
    match value {
        Value::Null => ValueType::Null,
        Value::Bool(_) => ValueType::Boolean,
        Value::Number(_) => ValueType::Number,
        Value::String(s) => classify_string(s),
        Value::Array(items) => {
            let element_types: BTreeSet<ValueType> = items
                .iter()
                .filter(|v| !v.is_null())
                .map(classify)
                .collect();
            let element = match element_types.len() {
                0 => ValueType::Empty,
                1 => element_types.into_iter().next().unwrap_or(ValueType::Empty),
                _ => ValueType::Mixed,
            };
            ValueType::array_of(element)
        }
        Value::Object(_) => ValueType::Object,
    }
}

fn classify_string(s: &str) -> ValueType {
    let s = s.trim();
    if is_iso_date(s) {
        ValueType::Date
    } else if NaiveDate::parse_from_str(s, "%m/%d/%Y").is_ok() {
        ValueType::DateUs
    } else {
        ValueType::String
    }
}

fn is_iso_date(s: &str) -> bool {
    // Cheap shape check first: every ISO form starts with YYYY-
    let bytes = s.as_bytes();
    if bytes.len() < 10 || !bytes[..4].iter().all(u8::is_ascii_digit) || bytes[4] != b'-' {
        return false;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").is_ok()
}

/// Inferred schema for one frontmatter property.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySchema {
    pub name: String,
    /// Observed non-null types, sorted by name.
    pub types: Vec<ValueType>,
    pub occurrences: usize,
    pub nullable: bool,
    pub samples: Vec<Value>,
    /// Occurrence count per type name, `null` included.
    pub distribution: BTreeMap<String, usize>,
    pub recommended_type: ValueType,
    pub storage_type: StorageType,
    pub column_name: String,
    pub reserved_word: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<BTreeMap<String, Vec<ValueType>>>,
}

impl PropertySchema {
    pub fn has_conflict(&self) -> bool {
        self.types.len() > 1
    }
}

/// Schema for the whole corpus, keyed by property name.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontmatterSchema {
    pub total_posts: usize,
    pub posts_with_frontmatter: usize,
    /// Set when analysis failed and this is a stand-in schema.
    pub degraded: bool,
    pub properties: BTreeMap<String, PropertySchema>,
}

#[derive(Default)]
struct PropertyAccumulator {
    types: BTreeSet<ValueType>,
    occurrences: usize,
    nullable: bool,
    samples: Vec<Value>,
    distribution: BTreeMap<String, usize>,
    shape: BTreeMap<String, BTreeSet<ValueType>>,
    saw_object: bool,
}

impl PropertyAccumulator {
    fn observe(&mut self, value: &Value) {
        let ty = classify(value);
        self.occurrences += 1;
        *self.distribution.entry(ty.name()).or_insert(0) += 1;

        if ty == ValueType::Null {
            self.nullable = true;
            return;
        }

        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(value.clone());
        }

        if let Value::Object(map) = value {
            self.saw_object = true;
            for (key, nested) in map {
                self.shape.entry(key.clone()).or_default().insert(classify(nested));
            }
        }

        self.types.insert(ty);
    }
}

/// Infer the frontmatter schema of a corpus.
///
/// Posts are visited in `(slug, hash)` order so samples, and therefore the
/// whole result, do not depend on input order.
///
/// # Errors
///
/// Fails when a post's frontmatter is neither an object nor `null`; the
/// corpus then cannot be read as frontmatter maps.
pub fn analyze_frontmatter(posts: &[Post]) -> Result<FrontmatterSchema> {
    let mut ordered: Vec<&Post> = posts.iter().collect();
    ordered.sort_by(|a, b| a.slug.cmp(&b.slug).then_with(|| a.hash.cmp(&b.hash)));

    let mut accumulators: BTreeMap<String, PropertyAccumulator> = BTreeMap::new();
    let mut posts_with_frontmatter = 0usize;

    for post in ordered {
        let map = match &post.frontmatter {
            Value::Null => continue,
            Value::Object(map) => map,
            other => bail!(
                "frontmatter of post '{}' is a {} rather than a mapping",
                post.slug,
                classify(other)
            ),
        };
        if map.is_empty() {
            continue;
        }
        posts_with_frontmatter += 1;
        for (key, value) in map {
            accumulators.entry(key.clone()).or_default().observe(value);
        }
    }

    let mut used_columns: BTreeSet<String> = BTreeSet::new();
    let mut properties = BTreeMap::new();

    for (name, acc) in accumulators {
        let column_name = unique_column_name(&name, &mut used_columns);
        let reserved_word = is_reserved_word(&column_name);
        let recommended_type = resolve_type(&acc.types, &acc.distribution);
        let storage_type = recommended_type.storage_type();

        let mut types: Vec<ValueType> = acc.types.into_iter().collect();
        types.sort_by_key(|t| t.name());

        let shape = acc.saw_object.then(|| {
            acc.shape
                .into_iter()
                .map(|(k, set)| {
                    let mut v: Vec<ValueType> = set.into_iter().collect();
                    v.sort_by_key(|t| t.name());
                    (k, v)
                })
                .collect()
        });

        properties.insert(
            name.clone(),
            PropertySchema {
                name,
                types,
                occurrences: acc.occurrences,
                nullable: acc.nullable,
                samples: acc.samples,
                distribution: acc.distribution,
                recommended_type,
                storage_type,
                column_name,
                reserved_word,
                shape,
            },
        );
    }

    Ok(FrontmatterSchema {
        total_posts: posts.len(),
        posts_with_frontmatter,
        degraded: false,
        properties,
    })
}

/// Pick the canonical type for a property from its observed types.
pub fn resolve_type(
    observed: &BTreeSet<ValueType>,
    distribution: &BTreeMap<String, usize>,
) -> ValueType {
    let mut candidates: Vec<&ValueType> = observed
        .iter()
        .filter(|t| **t != ValueType::Null)
        .collect();

    // An empty list says nothing about the element type
    if candidates.iter().any(|t| t.is_array() && !t.is_empty_array()) {
        candidates.retain(|t| !t.is_empty_array());
    }

    match candidates.len() {
        0 => return ValueType::Null,
        1 => return candidates[0].clone(),
        _ => {}
    }

    if candidates.iter().all(|t| t.is_date()) {
        return ValueType::Date;
    }

    let string_array = ValueType::array_of(ValueType::String);
    if candidates.len() == 2
        && candidates.contains(&&ValueType::String)
        && candidates.contains(&&string_array)
    {
        return string_array;
    }

    candidates
        .into_iter()
        .map(|t| (distribution.get(&t.name()).copied().unwrap_or(0), t))
        .max_by(|(count_a, a), (count_b, b)| {
            count_a
                .cmp(count_b)
                .then_with(|| b.name().cmp(&a.name()))
        })
        .map(|(_, t)| t.clone())
        .unwrap_or(ValueType::Null)
}

/// Lowercase, alphanumeric-plus-underscore identifier for a property.
pub fn sanitize_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    let base = if trimmed.is_empty() {
        "field".to_string()
    } else {
        trimmed.to_string()
    };

    let starts_with_digit = base.chars().next().is_some_and(|c| c.is_ascii_digit());
    if starts_with_digit || CORE_POST_COLUMNS.contains(&base.as_str()) {
        format!("fm_{}", base)
    } else {
        base
    }
}

fn unique_column_name(name: &str, used: &mut BTreeSet<String>) -> String {
    let base = sanitize_column_name(name);
    let mut candidate = base.clone();
    let mut n = 2;
    while used.contains(&candidate) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

pub fn is_reserved_word(identifier: &str) -> bool {
    SQLITE_KEYWORDS.contains(&identifier.to_ascii_lowercase().as_str())
}

/// Quote an identifier for SQLite.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

impl FrontmatterSchema {
    /// Stand-in used when analysis fails: no properties, no conflicts.
    pub fn degraded(total_posts: usize) -> Self {
        Self {
            total_posts,
            posts_with_frontmatter: 0,
            degraded: true,
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertySchema> {
        self.properties.get(name)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &PropertySchema> {
        self.properties.values().filter(|p| p.has_conflict())
    }

    pub fn reserved_words(&self) -> impl Iterator<Item = &PropertySchema> {
        self.properties.values().filter(|p| p.reserved_word)
    }

    /// Properties present in fewer than `ratio` of posts-with-frontmatter.
    pub fn rare_properties(&self, ratio: f64) -> Vec<&PropertySchema> {
        if self.posts_with_frontmatter == 0 {
            return Vec::new();
        }
        let total = self.posts_with_frontmatter as f64;
        self.properties
            .values()
            .filter(|p| (p.occurrences as f64) / total < ratio)
            .collect()
    }

    /// Push one issue per conflicting property and one per rare property.
    pub fn record_issues(&self, rare_ratio: f64, issues: &mut IssueCollector) {
        for prop in self.conflicts() {
            issues.push(
                Issue::warning(
                    IssueCategory::SchemaConflict,
                    format!(
                        "Frontmatter property '{}' has {} types: {}",
                        prop.name,
                        prop.types.len(),
                        join_types(&prop.types)
                    ),
                    format!(
                        "Use '{}' consistently; values are coerced to it in the snapshot",
                        prop.recommended_type
                    ),
                )
                .with_context(json!({
                    "property": prop.name,
                    "types": prop.types,
                    "distribution": prop.distribution,
                    "recommendedType": prop.recommended_type,
                    "examples": examples(prop.samples.iter().cloned()),
                })),
            );
        }

        for prop in self.rare_properties(rare_ratio) {
            issues.push(
                Issue::warning(
                    IssueCategory::ContentWarning,
                    format!(
                        "Frontmatter property '{}' appears in only {} of {} posts with frontmatter",
                        prop.name, prop.occurrences, self.posts_with_frontmatter
                    ),
                    "Check for a misspelled key, or drop the property if it is unused",
                )
                .with_context(json!({
                    "property": prop.name,
                    "occurrences": prop.occurrences,
                    "examples": examples(prop.samples.iter().cloned()),
                })),
            );
        }
    }

    /// Human-readable schema report.
    pub fn report_markdown(&self, rare_ratio: f64) -> String {
        let mut out = String::new();
        out.push_str("# Frontmatter Schema Report\n\n");
        if self.degraded {
            out.push_str("> Schema analysis failed; this is a degraded schema.\n\n");
        }
        out.push_str("## Totals\n\n");
        out.push_str(&format!("- Posts: {}\n", self.total_posts));
        out.push_str(&format!(
            "- Posts with frontmatter: {}\n",
            self.posts_with_frontmatter
        ));
        out.push_str(&format!("- Properties: {}\n", self.properties.len()));
        out.push_str(&format!("- Type conflicts: {}\n\n", self.conflicts().count()));

        out.push_str("## Properties\n\n");
        out.push_str("| Property | Column | Type | Storage | Occurrences | Nullable |\n");
        out.push_str("|----------|--------|------|---------|-------------|----------|\n");
        for prop in self.properties.values() {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                prop.name,
                prop.column_name,
                prop.recommended_type,
                prop.storage_type.sql(),
                prop.occurrences,
                if prop.nullable { "yes" } else { "no" }
            ));
        }
        out.push('\n');

        let conflicts: Vec<&PropertySchema> = self.conflicts().collect();
        if !conflicts.is_empty() {
            out.push_str("## Type Conflicts\n\n");
            for prop in conflicts {
                out.push_str(&format!("### `{}`\n\n", prop.name));
                out.push_str(&format!("- Observed: {}\n", join_types(&prop.types)));
                let dist: Vec<String> = prop
                    .distribution
                    .iter()
                    .map(|(t, n)| format!("{} × {}", t, n))
                    .collect();
                out.push_str(&format!("- Distribution: {}\n", dist.join(", ")));
                out.push_str(&format!("- Recommended: `{}`\n", prop.recommended_type));
                for sample in &prop.samples {
                    out.push_str(&format!("- Sample: `{}`\n", sample));
                }
                out.push('\n');
            }
        }

        let reserved: Vec<&PropertySchema> = self.reserved_words().collect();
        if !reserved.is_empty() {
            out.push_str("## Reserved Words\n\n");
            for prop in reserved {
                out.push_str(&format!(
                    "- `{}` → column `{}` is an SQLite keyword and is always quoted\n",
                    prop.name, prop.column_name
                ));
            }
            out.push('\n');
        }

        let rare = self.rare_properties(rare_ratio);
        if !rare.is_empty() {
            out.push_str("## Rare Properties\n\n");
            for prop in rare {
                let pct = prop.occurrences as f64 * 100.0 / self.posts_with_frontmatter as f64;
                out.push_str(&format!(
                    "- ⚠ `{}` appears in {:.1}% of posts with frontmatter ({} of {})\n",
                    prop.name, pct, prop.occurrences, self.posts_with_frontmatter
                ));
            }
            out.push('\n');
        }

        out
    }
}

fn join_types(types: &[ValueType]) -> String {
    types
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join(", ")
}

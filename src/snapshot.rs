//! Relational snapshot builder.
//!
//! Writes posts, media and their associations into a single SQLite file.
//! Frontmatter properties from the inferred [`FrontmatterSchema`] become
//! typed columns on `posts`; the raw and normalized frontmatter are kept as
//! JSON blobs next to them.
//!
//! Schema application is additive. Columns are only ever added, never
//! dropped or retyped, so a snapshot file reused across builds stays
//! readable by older consumers. Rows, on the other hand, are rebuilt from
//! scratch inside one transaction on every build.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteArguments, SqlitePool};
use sqlx::{Row, Sqlite};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::db;
use crate::issues::{examples, Issue, IssueCategory, IssueCollector};
use crate::lookup::PostResolver;
use crate::models::{Media, Post};
use crate::normalize::{coerce_value, normalize_frontmatter, NormalizationMode};
use crate::schema::{quote_ident, FrontmatterSchema, StorageType, ValueType};

/// Properties that serving layers commonly filter on; indexed when present.
pub const COMMON_FILTER_PROPERTIES: &[&str] =
    &["draft", "published", "date", "author", "category", "status"];

/// A frontmatter property column available for inserts.
#[derive(Debug, Clone)]
struct PropertyColumn {
    property: String,
    column: String,
    storage: StorageType,
}

/// What the snapshot stage produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub path: String,
    pub normalization: String,
    pub schema_applied: bool,
    pub posts: usize,
    pub media: usize,
    pub tags: usize,
    pub links: usize,
    pub post_media: usize,
    pub property_columns: usize,
    pub added_columns: Vec<String>,
    pub unresolved_links: usize,
}

/// A value bound to a dynamically typed column.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Build (or rebuild) the snapshot at `path`.
///
/// Column and index failures are recorded as warnings and skipped. A
/// failure during the bulk load rolls the transaction back and is returned
/// as an error.
pub async fn build_snapshot(
    path: &Path,
    posts: &[Post],
    media: &[Media],
    schema: Option<&FrontmatterSchema>,
    mode: NormalizationMode,
    issues: &mut IssueCollector,
) -> Result<SnapshotSummary> {
    let pool = db::connect(path).await?;

    let result = build_with_pool(&pool, path, posts, media, schema, mode, issues).await;

    pool.close().await;
    result
}

async fn build_with_pool(
    pool: &SqlitePool,
    path: &Path,
    posts: &[Post],
    media: &[Media],
    schema: Option<&FrontmatterSchema>,
    mode: NormalizationMode,
    issues: &mut IssueCollector,
) -> Result<SnapshotSummary> {
    create_base_tables(pool).await?;

    let schema = schema.filter(|s| !s.degraded);
    let (columns, added_columns) = match schema {
        Some(schema) => apply_schema_columns(pool, schema, issues).await?,
        None => (Vec::new(), Vec::new()),
    };

    create_indexes(pool, &columns, issues).await;

    let rows = prepare_rows(posts, media, issues);

    bulk_load(pool, &rows, schema, mode, &columns)
        .await
        .context("Snapshot bulk load failed")?;

    optimize(pool).await;

    tracing::info!(
        posts = rows.posts.len(),
        media = rows.media.len(),
        columns = columns.len(),
        "snapshot written to {}",
        path.display()
    );

    Ok(SnapshotSummary {
        path: path.display().to_string(),
        normalization: mode.as_str().to_string(),
        schema_applied: schema.is_some(),
        posts: rows.posts.len(),
        media: rows.media.len(),
        tags: rows.tags.len(),
        links: rows.links.len(),
        post_media: rows.post_media.len(),
        property_columns: columns.len(),
        added_columns,
        unresolved_links: rows.unresolved_links,
    })
}

async fn create_base_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL,
            title TEXT,
            content TEXT,
            backlinks TEXT NOT NULL DEFAULT '[]',
            word_count INTEGER NOT NULL DEFAULT 0,
            created TEXT,
            modified TEXT,
            path TEXT,
            "type" TEXT,
            frontmatter_raw TEXT,
            frontmatter TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            path TEXT,
            url TEXT,
            width INTEGER,
            height INTEGER,
            filesize INTEGER,
            mime_type TEXT,
            created TEXT,
            modified TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS post_tags (
            post_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (post_id, tag),
            FOREIGN KEY (post_id) REFERENCES posts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS post_links (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            PRIMARY KEY (source_id, target_id),
            FOREIGN KEY (source_id) REFERENCES posts(id),
            FOREIGN KEY (target_id) REFERENCES posts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS post_media (
            post_id TEXT NOT NULL,
            media_id TEXT NOT NULL,
            PRIMARY KEY (post_id, media_id),
            FOREIGN KEY (post_id) REFERENCES posts(id),
            FOREIGN KEY (media_id) REFERENCES media(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Existing `posts` columns with their declared types (lowercased names).
async fn existing_columns(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let rows = sqlx::query("PRAGMA table_info(posts)")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get("name");
            let ty: String = row.get("type");
            (name.to_ascii_lowercase(), ty.to_ascii_uppercase())
        })
        .collect())
}

/// Add one column per schema property that is not already present.
///
/// Returns the usable property columns and the names of the columns added
/// by this build.
async fn apply_schema_columns(
    pool: &SqlitePool,
    schema: &FrontmatterSchema,
    issues: &mut IssueCollector,
) -> Result<(Vec<PropertyColumn>, Vec<String>)> {
    let existing = existing_columns(pool).await?;
    let mut columns = Vec::new();
    let mut added = Vec::new();

    for prop in schema.properties.values() {
        let wanted = prop.storage_type;
        if let Some(declared) = existing.get(&prop.column_name) {
            if declared != wanted.sql() {
                // Never retype: keep the old affinity, SQLite stores what we bind
                tracing::warn!(
                    column = %prop.column_name,
                    declared = %declared,
                    wanted = wanted.sql(),
                    "keeping existing column type"
                );
            }
            columns.push(PropertyColumn {
                property: prop.name.clone(),
                column: prop.column_name.clone(),
                storage: wanted,
            });
            continue;
        }

        let sql = format!(
            "ALTER TABLE posts ADD COLUMN {} {}",
            quote_ident(&prop.column_name),
            wanted.sql()
        );
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => {
                added.push(prop.column_name.clone());
                columns.push(PropertyColumn {
                    property: prop.name.clone(),
                    column: prop.column_name.clone(),
                    storage: wanted,
                });
            }
            Err(e) => {
                issues.push(
                    Issue::warning(
                        IssueCategory::SchemaConflict,
                        format!(
                            "Could not add column '{}' for frontmatter property '{}': {}",
                            prop.column_name, prop.name, e
                        ),
                        "The property is still available in the frontmatter blob",
                    )
                    .with_context(json!({"property": prop.name, "column": prop.column_name})),
                );
            }
        }
    }

    Ok((columns, added))
}

async fn create_indexes(pool: &SqlitePool, columns: &[PropertyColumn], issues: &mut IssueCollector) {
    let mut statements: Vec<(String, String)> = vec![
        (
            "idx_posts_slug".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_posts_slug ON posts(slug)".to_string(),
        ),
        (
            "idx_post_tags_tag".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_post_tags_tag ON post_tags(tag)".to_string(),
        ),
        (
            "idx_post_links_target".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_post_links_target ON post_links(target_id)"
                .to_string(),
        ),
        (
            "idx_post_media_media".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_post_media_media ON post_media(media_id)".to_string(),
        ),
    ];

    for col in columns
        .iter()
        .filter(|c| COMMON_FILTER_PROPERTIES.contains(&c.property.as_str()))
    {
        let name = format!("idx_posts_{}", col.column);
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON posts({})",
            quote_ident(&name),
            quote_ident(&col.column)
        );
        statements.push((name, sql));
    }

    for (name, sql) in statements {
        if let Err(e) = sqlx::query(&sql).execute(pool).await {
            issues.push(Issue::warning(
                IssueCategory::SchemaConflict,
                format!("Could not create index {}: {}", name, e),
                "Queries still work, only slower",
            ));
        }
    }
}

struct PreparedRows<'a> {
    posts: Vec<&'a Post>,
    media: Vec<&'a Media>,
    tags: BTreeSet<(&'a str, &'a str)>,
    links: BTreeSet<(&'a str, &'a str)>,
    post_media: BTreeSet<(&'a str, &'a str)>,
    backlinks: HashMap<&'a str, Vec<&'a str>>,
    unresolved_links: usize,
}

/// Deduplicate by hash and resolve associations to hashes.
fn prepare_rows<'a>(
    posts: &'a [Post],
    media: &'a [Media],
    issues: &mut IssueCollector,
) -> PreparedRows<'a> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates = Vec::new();
    let unique_posts: Vec<&Post> = posts
        .iter()
        .filter(|p| {
            let fresh = seen.insert(p.hash.as_str());
            if !fresh {
                duplicates.push(p.slug.clone());
            }
            fresh
        })
        .collect();

    let mut seen_media: HashSet<&str> = HashSet::new();
    let unique_media: Vec<&Media> = media
        .iter()
        .filter(|m| {
            let fresh = seen_media.insert(m.identity());
            if !fresh {
                duplicates.push(m.filename.clone());
            }
            fresh
        })
        .collect();

    if !duplicates.is_empty() {
        issues.push(
            Issue::warning(
                IssueCategory::ContentWarning,
                format!(
                    "{} items share a content hash with an earlier item and were skipped",
                    duplicates.len()
                ),
                "Make sure the parser emits each note and media file once",
            )
            .with_context(json!({"examples": examples(duplicates)})),
        );
    }

    let mut media_ids: HashMap<&str, &str> = HashMap::new();
    for m in unique_media.iter().copied() {
        media_ids.insert(m.identity(), m.identity());
        if !m.id.is_empty() {
            media_ids.entry(m.id.as_str()).or_insert(m.identity());
        }
    }

    let resolver = PostResolver::standard(posts);
    let mut tags = BTreeSet::new();
    let mut links = BTreeSet::new();
    let mut post_media = BTreeSet::new();
    let mut unresolved: Vec<String> = Vec::new();

    for post in unique_posts.iter().copied() {
        for tag in &post.tags {
            let tag = tag.trim();
            if !tag.is_empty() {
                tags.insert((post.hash.as_str(), tag));
            }
        }
        for link in &post.links {
            match resolver.resolve(&link.target) {
                Some((_, target)) if target.hash != post.hash => {
                    links.insert((post.hash.as_str(), target.hash.as_str()));
                }
                Some(_) => {}
                None => unresolved.push(format!("{} → {}", post.slug, link.target)),
            }
        }
        for media_ref in &post.media {
            if let Some(id) = media_ids.get(media_ref.id.as_str()) {
                post_media.insert((post.hash.as_str(), *id));
            }
        }
    }

    let mut backlinks: HashMap<&str, Vec<&str>> = HashMap::new();
    for (source, target) in &links {
        backlinks.entry(*target).or_default().push(*source);
    }

    if !unresolved.is_empty() {
        issues.push(
            Issue::warning(
                IssueCategory::ContentWarning,
                format!("{} links point to posts that are not in the corpus", unresolved.len()),
                "Fix or remove links to missing notes",
            )
            .with_context(json!({
                "totalUnresolved": unresolved.len(),
                "examples": examples(unresolved.iter().cloned()),
            })),
        );
    }

    PreparedRows {
        posts: unique_posts,
        media: unique_media,
        tags,
        links,
        post_media,
        backlinks,
        unresolved_links: unresolved.len(),
    }
}

/// Convert a frontmatter value to what a column of `storage` type holds.
fn to_sql_value(value: Option<&Value>, storage: StorageType) -> SqlValue {
    let value = match value {
        None | Some(Value::Null) => return SqlValue::Null,
        Some(v) => v,
    };
    match storage {
        StorageType::Integer => match coerce_value(value, &ValueType::Boolean) {
            Value::Bool(b) => SqlValue::Integer(i64::from(b)),
            _ => SqlValue::Null,
        },
        StorageType::Real => coerce_value(value, &ValueType::Number)
            .as_f64()
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Null),
        StorageType::Text => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Integer(i) => query.bind(i),
        SqlValue::Real(f) => query.bind(f),
        SqlValue::Text(s) => query.bind(s),
    }
}

fn post_insert_sql(columns: &[PropertyColumn]) -> String {
    let mut names: Vec<String> = [
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
    ]
    .iter()
    .map(|c| quote_ident(c))
    .collect();
    names.extend(columns.iter().map(|c| quote_ident(&c.column)));
    let placeholders = vec!["?"; names.len()].join(", ");
    format!(
        "INSERT INTO posts ({}) VALUES ({})",
        names.join(", "),
        placeholders
    )
}

async fn bulk_load(
    pool: &SqlitePool,
    rows: &PreparedRows<'_>,
    schema: Option<&FrontmatterSchema>,
    mode: NormalizationMode,
    columns: &[PropertyColumn],
) -> Result<()> {
    let insert_post = post_insert_sql(columns);
    let mut tx = pool.begin().await?;

    for table in ["post_media", "post_links", "post_tags", "posts", "media"] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }

    for post in &rows.posts {
        let raw = match &post.frontmatter {
            Value::Null => None,
            other => Some(other.to_string()),
        };

        let normalized = match (schema, post.frontmatter_map()) {
            (Some(schema), Some(map)) => Some(normalize_frontmatter(map, schema, mode)),
            _ => None,
        };

        let backlinks: Vec<&str> = rows
            .backlinks
            .get(post.hash.as_str())
            .cloned()
            .unwrap_or_default();

        let mut query = sqlx::query(&insert_post)
            .bind(&post.hash)
            .bind(&post.slug)
            .bind(&post.title)
            .bind(&post.content)
            .bind(serde_json::to_string(&backlinks)?)
            .bind(post.word_count)
            .bind(&post.created)
            .bind(&post.modified)
            .bind(&post.path)
            .bind(&post.kind)
            .bind(raw)
            .bind(
                normalized
                    .as_ref()
                    .map(|m| Value::Object(m.clone()).to_string()),
            );

        for col in columns {
            let value = normalized.as_ref().and_then(|m| m.get(&col.property));
            query = bind_value(query, to_sql_value(value, col.storage));
        }

        query
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert post '{}'", post.slug))?;
    }

    for m in &rows.media {
        sqlx::query(
            r#"
            INSERT INTO media (id, filename, path, url, width, height, filesize, mime_type, created, modified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(m.identity())
        .bind(&m.filename)
        .bind(&m.path)
        .bind(&m.url)
        .bind(m.width)
        .bind(m.height)
        .bind(m.filesize)
        .bind(&m.mime_type)
        .bind(&m.created)
        .bind(&m.modified)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert media '{}'", m.filename))?;
    }

    for (post_id, tag) in &rows.tags {
        sqlx::query("INSERT INTO post_tags (post_id, tag) VALUES (?, ?)")
            .bind(*post_id)
            .bind(*tag)
            .execute(&mut *tx)
            .await?;
    }

    for (source, target) in &rows.links {
        sqlx::query("INSERT INTO post_links (source_id, target_id) VALUES (?, ?)")
            .bind(*source)
            .bind(*target)
            .execute(&mut *tx)
            .await?;
    }

    for (post_id, media_id) in &rows.post_media {
        sqlx::query("INSERT INTO post_media (post_id, media_id) VALUES (?, ?)")
            .bind(*post_id)
            .bind(*media_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Post-load compaction. Failures only cost disk space.
async fn optimize(pool: &SqlitePool) {
    for statement in ["PRAGMA optimize", "VACUUM"] {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            tracing::warn!(error = %e, "{} failed", statement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaRef, PostLink};
    use crate::schema::analyze_frontmatter;
    use serde_json::json;
    use tempfile::TempDir;

    fn corpus() -> (Vec<Post>, Vec<Media>) {
        let posts = vec![
            Post {
                hash: "h1".into(),
                slug: "alpha".into(),
                title: "Alpha".into(),
                content: "Alpha body ![](img/a.png)".into(),
                frontmatter: json!({"tags": "solo", "draft": "true", "order": 1}),
                tags: vec!["rust".into(), "rust".into()],
                links: vec![PostLink { target: "beta".into() }],
                media: vec![MediaRef { id: "m1".into() }],
                word_count: 3,
                path: "alpha.md".into(),
                ..Default::default()
            },
            Post {
                hash: "h2".into(),
                slug: "beta".into(),
                title: "Beta".into(),
                content: "Beta body".into(),
                frontmatter: json!({"tags": ["a", "b"], "draft": false, "rating": "n/a"}),
                links: vec![
                    PostLink { target: "h1".into() },
                    PostLink { target: "missing".into() },
                ],
                path: "beta.md".into(),
                ..Default::default()
            },
        ];
        let media = vec![Media {
            id: "m1".into(),
            hash: "mh1".into(),
            filename: "a.png".into(),
            path: "img/a.png".into(),
            width: Some(10),
            ..Default::default()
        }];
        (posts, media)
    }

    #[test]
    fn test_to_sql_value_is_total() {
        assert_eq!(to_sql_value(None, StorageType::Real), SqlValue::Null);
        assert_eq!(
            to_sql_value(Some(&json!("abc")), StorageType::Real),
            SqlValue::Null
        );
        assert_eq!(
            to_sql_value(Some(&json!("1")), StorageType::Integer),
            SqlValue::Integer(1)
        );
        assert_eq!(
            to_sql_value(Some(&json!(["a", "b"])), StorageType::Text),
            SqlValue::Text("[\"a\",\"b\"]".into())
        );
    }

    #[test]
    fn test_post_insert_sql_quotes_columns() {
        let sql = post_insert_sql(&[PropertyColumn {
            property: "order".into(),
            column: "order".into(),
            storage: StorageType::Real,
        }]);
        assert!(sql.contains("\"order\""));
        assert!(sql.contains("\"type\""));
        assert_eq!(sql.matches('?').count(), 13);
    }

    #[tokio::test]
    async fn test_build_snapshot_with_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.sqlite");
        let (posts, media) = corpus();
        let schema = analyze_frontmatter(&posts).unwrap();
        let mut issues = IssueCollector::new();

        let summary = build_snapshot(
            &path,
            &posts,
            &media,
            Some(&schema),
            NormalizationMode::Permissive,
            &mut issues,
        )
        .await
        .unwrap();

        assert_eq!(summary.posts, 2);
        assert_eq!(summary.media, 1);
        assert_eq!(summary.tags, 1);
        assert_eq!(summary.links, 2);
        assert_eq!(summary.post_media, 1);
        assert_eq!(summary.unresolved_links, 1);
        assert!(summary.added_columns.contains(&"order".to_string()));

        let pool = db::connect(&path).await.unwrap();
        let row = sqlx::query("SELECT tags, draft, rating, \"order\", backlinks, frontmatter FROM posts WHERE id = 'h1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let tags: String = row.get("tags");
        assert_eq!(tags, "[\"solo\"]");
        let draft: Option<i64> = row.get("draft");
        assert_eq!(draft, Some(1));
        let rating: Option<String> = row.get("rating");
        assert_eq!(rating, None);
        let backlinks: String = row.get("backlinks");
        assert_eq!(backlinks, "[\"h2\"]");
        let normalized: String = row.get("frontmatter");
        let normalized: Value = serde_json::from_str(&normalized).unwrap();
        assert_eq!(normalized["tags"], json!(["solo"]));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_build_snapshot_without_schema_stores_blob_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.sqlite");
        let (posts, media) = corpus();
        let mut issues = IssueCollector::new();

        let summary = build_snapshot(
            &path,
            &posts,
            &media,
            None,
            NormalizationMode::Permissive,
            &mut issues,
        )
        .await
        .unwrap();
        assert!(!summary.schema_applied);
        assert_eq!(summary.property_columns, 0);

        let pool = db::connect(&path).await.unwrap();
        let row = sqlx::query("SELECT frontmatter_raw, frontmatter FROM posts WHERE id = 'h2'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let raw: Option<String> = row.get("frontmatter_raw");
        let normalized: Option<String> = row.get("frontmatter");
        assert!(raw.unwrap().contains("rating"));
        assert!(normalized.is_none());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_rebuild_is_additive_for_columns() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.sqlite");
        let (posts, media) = corpus();
        let schema = analyze_frontmatter(&posts).unwrap();
        let mut issues = IssueCollector::new();
        build_snapshot(&path, &posts, &media, Some(&schema), NormalizationMode::Permissive, &mut issues)
            .await
            .unwrap();

        // Second build with a corpus lacking the `order` property
        let trimmed: Vec<Post> = posts
            .iter()
            .cloned()
            .map(|mut p| {
                if let Some(map) = p.frontmatter.as_object_mut() {
                    map.remove("order");
                }
                p
            })
            .collect();
        let schema2 = analyze_frontmatter(&trimmed).unwrap();
        let summary = build_snapshot(
            &path,
            &trimmed,
            &media,
            Some(&schema2),
            NormalizationMode::Permissive,
            &mut issues,
        )
        .await
        .unwrap();
        assert!(summary.added_columns.is_empty());
        assert_eq!(summary.posts, 2);

        let pool = db::connect(&path).await.unwrap();
        let columns = existing_columns(&pool).await.unwrap();
        assert!(columns.contains_key("order"));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_hashes_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.sqlite");
        let (mut posts, media) = corpus();
        let mut dup = posts[0].clone();
        dup.slug = "alpha-copy".into();
        posts.push(dup);
        let mut issues = IssueCollector::new();

        let summary = build_snapshot(&path, &posts, &media, None, NormalizationMode::Original, &mut issues)
            .await
            .unwrap();
        assert_eq!(summary.posts, 2);
        assert!(issues
            .issues()
            .iter()
            .any(|i| i.message.contains("share a content hash")));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.sqlite");
        let (posts, media) = corpus();
        let mut issues = IssueCollector::new();
        build_snapshot(&path, &posts, &media, None, NormalizationMode::Original, &mut issues)
            .await
            .unwrap();

        // A media table from an older tool version that rejects one filename
        let pool = db::connect(&path).await.unwrap();
        sqlx::query("DELETE FROM post_media").execute(&pool).await.unwrap();
        sqlx::query("DROP TABLE media").execute(&pool).await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE media (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL CHECK (filename <> 'rejected.png'),
                path TEXT,
                url TEXT,
                width INTEGER,
                height INTEGER,
                filesize INTEGER,
                mime_type TEXT,
                created TEXT,
                modified TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;

        let next_posts = vec![Post {
            hash: "h9".into(),
            slug: "gamma".into(),
            ..Default::default()
        }];
        let next_media = vec![
            Media {
                id: "m2".into(),
                hash: "mh2".into(),
                filename: "fine.png".into(),
                ..Default::default()
            },
            Media {
                id: "m3".into(),
                hash: "mh3".into(),
                filename: "rejected.png".into(),
                ..Default::default()
            },
        ];
        let err = build_snapshot(
            &path,
            &next_posts,
            &next_media,
            None,
            NormalizationMode::Original,
            &mut issues,
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("rejected.png"));

        let pool = db::connect(&path).await.unwrap();
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM posts ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(ids, vec!["h1".to_string(), "h2".to_string()]);
        let media_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(media_rows, 0);
        pool.close().await;
    }
}

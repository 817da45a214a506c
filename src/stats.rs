//! Snapshot statistics.
//!
//! Row counts are read back from the snapshot file after it is written, so
//! the build summary reflects what is actually on disk rather than what the
//! builder believes it inserted.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::path::Path;

use crate::db;
use crate::schema::CORE_POST_COLUMNS;

/// Row counts and size of a snapshot file.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub posts: i64,
    pub media: i64,
    pub tags: i64,
    pub links: i64,
    pub post_media: i64,
    /// Frontmatter columns on `posts`, including ones added by earlier builds.
    pub property_columns: usize,
    pub size_bytes: u64,
    pub size: String,
}

/// Query the snapshot at `path` for its row counts.
pub async fn snapshot_stats(path: &Path) -> Result<SnapshotStats> {
    let pool = db::connect(path).await?;

    let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
        .fetch_one(&pool)
        .await?;
    let media: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
        .fetch_one(&pool)
        .await?;
    let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_tags")
        .fetch_one(&pool)
        .await?;
    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_links")
        .fetch_one(&pool)
        .await?;
    let post_media: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_media")
        .fetch_one(&pool)
        .await?;

    let column_rows = sqlx::query("PRAGMA table_info(posts)")
        .fetch_all(&pool)
        .await?;
    let property_columns = column_rows
        .iter()
        .filter(|row| {
            let name: String = row.get("name");
            !CORE_POST_COLUMNS.contains(&name.as_str())
        })
        .count();

    pool.close().await;

    let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    Ok(SnapshotStats {
        posts,
        media,
        tags,
        links,
        post_media,
        property_columns,
        size_bytes,
        size: format_bytes(size_bytes),
    })
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

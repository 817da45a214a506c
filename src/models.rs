//! Core data models consumed by the build pipeline.
//!
//! These are the shapes produced by the external content parser: one
//! [`Post`] per source note and one [`Media`] per attached file. Field
//! names follow the parser's camelCase JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A reference from one post to another. `target` is normally the target
/// post's hash, but parsers may also emit a slug or a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostLink {
    pub target: String,
}

/// A reference from a post to a media item, by media id or hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub id: String,
}

/// A content item derived from a source note, identified by its content hash.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub hash: String,
    pub slug: String,
    #[serde(default)]
    pub title: String,
    /// Raw (markdown) body.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub plain: Option<String>,
    /// Free-form metadata. An object for well-formed notes, `null` when absent.
    #[serde(default)]
    pub frontmatter: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub links: Vec<PostLink>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub word_count: i64,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Post {
    /// Plain text used for embedding and thin-content checks. Falls back to
    /// the raw body when the parser did not provide a plain rendition.
    pub fn text(&self) -> &str {
        match self.plain.as_deref() {
            Some(plain) if !plain.trim().is_empty() => plain,
            _ => &self.content,
        }
    }

    /// Frontmatter as an object, if it is one.
    pub fn frontmatter_map(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.frontmatter.as_object()
    }

    pub fn has_frontmatter(&self) -> bool {
        self.frontmatter_map().is_some_and(|m| !m.is_empty())
    }
}

/// A media file attached to the corpus.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hash: String,
    pub filename: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub filesize: Option<i64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

impl Media {
    /// Content-addressed identity: the hash, or the id when no hash was given.
    pub fn identity(&self) -> &str {
        if self.hash.is_empty() {
            &self.id
        } else {
            &self.hash
        }
    }
}

/// The ingestion result a build runs over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Corpus {
    pub posts: Vec<Post>,
    pub media: Vec<Media>,
}

impl Corpus {
    pub fn new(posts: Vec<Post>, media: Vec<Media>) -> Self {
        Self { posts, media }
    }

    /// Load the parser's `posts.json` and `media.json` from a directory.
    /// A missing `media.json` yields an empty media list.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let posts_path = dir.join("posts.json");
        let content = std::fs::read_to_string(&posts_path)
            .with_context(|| format!("Failed to read {}", posts_path.display()))?;
        let posts: Vec<Post> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", posts_path.display()))?;

        let media_path = dir.join("media.json");
        let media: Vec<Media> = if media_path.exists() {
            let content = std::fs::read_to_string(&media_path)
                .with_context(|| format!("Failed to read {}", media_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", media_path.display()))?
        } else {
            Vec::new()
        };

        Ok(Self { posts, media })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_deserializes_parser_shape() {
        let post: Post = serde_json::from_value(json!({
            "hash": "abc",
            "slug": "hello",
            "title": "Hello",
            "content": "# Hello",
            "frontmatter": {"draft": false},
            "tags": ["a"],
            "links": [{"target": "def"}],
            "media": [{"id": "m1"}],
            "wordCount": 2,
            "path": "notes/hello.md",
            "type": "note"
        }))
        .unwrap();
        assert_eq!(post.word_count, 2);
        assert_eq!(post.kind.as_deref(), Some("note"));
        assert_eq!(post.links[0].target, "def");
        assert!(post.has_frontmatter());
    }

    #[test]
    fn test_post_text_falls_back_to_content() {
        let post = Post {
            content: "raw body".into(),
            plain: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(post.text(), "raw body");
    }

    #[test]
    fn test_media_identity_prefers_hash() {
        let mut media = Media {
            id: "id-1".into(),
            hash: "h-1".into(),
            filename: "a.png".into(),
            ..Default::default()
        };
        assert_eq!(media.identity(), "h-1");
        media.hash.clear();
        assert_eq!(media.identity(), "id-1");
    }

    #[test]
    fn test_load_dir_without_media() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("posts.json"),
            r#"[{"hash":"h1","slug":"one"}]"#,
        )
        .unwrap();
        let corpus = Corpus::load_dir(tmp.path()).unwrap();
        assert_eq!(corpus.posts.len(), 1);
        assert!(corpus.media.is_empty());
        assert!(corpus.posts[0].frontmatter.is_null());
    }
}

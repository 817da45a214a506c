//! Post resolution by key with an ordered chain of strategies.
//!
//! A link target or a request key may be a content hash, a slug, or a
//! source path. [`PostResolver`] tries each [`LookupStrategy`] in order and
//! returns the first hit together with the name of the strategy that found
//! it. The chain is plain data, so callers and tests can inspect it.

use std::collections::HashMap;

use crate::models::Post;

/// One "try, found or absent" lookup step.
pub trait LookupStrategy<'a>: Send + Sync {
    fn name(&self) -> &'static str;
    fn find(&self, key: &str) -> Option<&'a Post>;
}

/// Direct identity lookup by content hash.
pub struct ByHash<'a> {
    index: HashMap<&'a str, &'a Post>,
}

impl<'a> ByHash<'a> {
    pub fn new(posts: &'a [Post]) -> Self {
        Self {
            index: posts.iter().map(|p| (p.hash.as_str(), p)).collect(),
        }
    }
}

impl<'a> LookupStrategy<'a> for ByHash<'a> {
    fn name(&self) -> &'static str {
        "by-hash"
    }

    fn find(&self, key: &str) -> Option<&'a Post> {
        self.index.get(key).copied()
    }
}

/// Secondary index on slug.
pub struct BySlug<'a> {
    index: HashMap<&'a str, &'a Post>,
}

impl<'a> BySlug<'a> {
    pub fn new(posts: &'a [Post]) -> Self {
        let mut index = HashMap::with_capacity(posts.len());
        for post in posts {
            // First post wins on duplicate slugs
            index.entry(post.slug.as_str()).or_insert(post);
        }
        Self { index }
    }
}

impl<'a> LookupStrategy<'a> for BySlug<'a> {
    fn name(&self) -> &'static str {
        "by-slug"
    }

    fn find(&self, key: &str) -> Option<&'a Post> {
        self.index.get(key).copied()
    }
}

/// Full corpus scan matching source path, file stem, or slug ignoring case.
pub struct ByPathScan<'a> {
    posts: &'a [Post],
}

impl<'a> ByPathScan<'a> {
    pub fn new(posts: &'a [Post]) -> Self {
        Self { posts }
    }
}

impl<'a> LookupStrategy<'a> for ByPathScan<'a> {
    fn name(&self) -> &'static str {
        "by-path-scan"
    }

    fn find(&self, key: &str) -> Option<&'a Post> {
        let wanted = normalize_key(key);
        if wanted.is_empty() {
            return None;
        }
        self.posts.iter().find(|post| {
            normalize_key(&post.path) == wanted
                || file_stem(&post.path).eq_ignore_ascii_case(&wanted)
                || post.slug.eq_ignore_ascii_case(&wanted)
        })
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.split(['#', '?']).next().unwrap_or(key);
    let key = key.trim().trim_start_matches("./").trim_start_matches('/');
    let key = key.strip_suffix(".md").unwrap_or(key);
    key.to_ascii_lowercase()
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".md").unwrap_or(name)
}

/// Ordered fallback chain of lookup strategies.
pub struct PostResolver<'a> {
    strategies: Vec<Box<dyn LookupStrategy<'a> + 'a>>,
}

impl<'a> PostResolver<'a> {
    pub fn new(strategies: Vec<Box<dyn LookupStrategy<'a> + 'a>>) -> Self {
        Self { strategies }
    }

    /// The standard chain: hash, then slug, then a full scan.
    pub fn standard(posts: &'a [Post]) -> Self {
        Self::new(vec![
            Box::new(ByHash::new(posts)),
            Box::new(BySlug::new(posts)),
            Box::new(ByPathScan::new(posts)),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// First match and the strategy that produced it.
    pub fn resolve(&self, key: &str) -> Option<(&'static str, &'a Post)> {
        self.strategies
            .iter()
            .find_map(|s| s.find(key).map(|post| (s.name(), post)))
    }
}

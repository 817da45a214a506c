//! Pairwise similarity and nearest neighbours over post vectors.
//!
//! Vectors are expected to be L2-normalized, so the dot product is the
//! cosine similarity. Items are visited in ascending hash order and every
//! unordered pair is keyed `"{min}-{max}"`, which makes the output
//! independent of input order. Keys only parse back unambiguously when no
//! hash contains `-`; content hashes are hex, and [`ambiguous_hashes`]
//! finds the ones that are not.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::embedding::dot;

/// One neighbour in a top-K list.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub hash: String,
    pub score: f32,
}

/// Canonical key for an unordered pair of distinct hashes.
///
/// Unique per pair as long as neither hash contains `-`.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}-{}", a, b)
    } else {
        format!("{}-{}", b, a)
    }
}

/// Every unordered pair of distinct hashes with its score, in hash order.
fn scored_pairs(vectors: &BTreeMap<String, Vec<f32>>) -> Vec<(&str, &str, f32)> {
    let items: Vec<(&String, &Vec<f32>)> = vectors.iter().collect();
    let mut pairs = Vec::with_capacity(items.len() * items.len().saturating_sub(1) / 2);

    for (i, &(a, va)) in items.iter().enumerate() {
        for &(b, vb) in &items[i + 1..] {
            pairs.push((a.as_str(), b.as_str(), dot(va, vb)));
        }
    }
    pairs
}

/// Similarity for every unordered pair of distinct hashes.
///
/// Fewer than two vectors yield an empty map.
pub fn pairwise_similarity(vectors: &BTreeMap<String, Vec<f32>>) -> BTreeMap<String, f32> {
    scored_pairs(vectors)
        .into_iter()
        .map(|(a, b, score)| (pair_key(a, b), score))
        .collect()
}

/// The `k` most similar hashes for every vector.
///
/// Sorted by descending score; ties go to the smaller hash.
pub fn top_k(vectors: &BTreeMap<String, Vec<f32>>, k: usize) -> BTreeMap<String, Vec<Neighbor>> {
    let mut neighbours: BTreeMap<String, Vec<Neighbor>> = BTreeMap::new();

    for (a, b, score) in scored_pairs(vectors) {
        neighbours.entry(a.to_string()).or_default().push(Neighbor {
            hash: b.to_string(),
            score,
        });
        neighbours.entry(b.to_string()).or_default().push(Neighbor {
            hash: a.to_string(),
            score,
        });
    }

    for list in neighbours.values_mut() {
        list.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.hash.cmp(&y.hash))
        });
        list.truncate(k);
    }
    neighbours
}

/// Hashes that would make pair keys ambiguous.
pub fn ambiguous_hashes<'a, I>(hashes: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    hashes
        .into_iter()
        .filter(|h| h.contains('-'))
        .map(String::as_str)
        .collect()
}

/// Top-K lists reduced to the neighbour hashes, as published in
/// `similar-posts.json`.
pub fn neighbor_hashes(top: &BTreeMap<String, Vec<Neighbor>>) -> BTreeMap<String, Vec<String>> {
    top.iter()
        .map(|(hash, list)| (hash.clone(), list.iter().map(|n| n.hash.clone()).collect()))
        .collect()
}

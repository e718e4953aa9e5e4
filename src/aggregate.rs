//! Cross-shard result aggregation — canonicalize, deduplicate, order.
//!
//! Shards index overlapping material (the same book can appear in several
//! collections), so fan-out queries routinely return the same passage more
//! than once. Passages are grouped by a content key — the digest of their
//! whitespace-normalized text — and each group keeps its best score with
//! merged source attribution. Scores come from the same embedding model in
//! every shard, so they compare directly.

use std::collections::BTreeSet;
use std::collections::HashMap;

use serde::Serialize;

use crate::fingerprint::Fingerprint;
use crate::index::ScoredPassage;

/// One passage as produced by a single shard.
#[derive(Clone, Debug)]
pub struct ShardPassage {
    /// Fingerprint (or label) of the shard that produced this passage.
    pub shard: String,
    pub passage: ScoredPassage,
}

/// A deduplicated passage with merged attribution.
#[derive(Clone, Debug, Serialize)]
pub struct AggregatedPassage {
    pub content: String,
    /// Best similarity score across contributing shards.
    pub score: f32,
    /// All source filenames this passage was attributed to.
    pub sources: Vec<String>,
    pub page: usize,
    pub ordinal: usize,
    /// Shard whose hit produced the best score; score ties order on this
    /// fingerprint, not on the full contributor set.
    pub representative_shard: String,
    /// Shards that returned this passage (attribution only).
    pub shards: Vec<String>,
    /// Content key: digest of the whitespace-normalized text.
    pub key: String,
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn normalize_content(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable content key for deduplication across shards.
pub fn content_key(text: &str) -> String {
    Fingerprint::of_bytes(normalize_content(text)).into_string()
}

struct Group {
    content: String,
    score: f32,
    shard: String,
    page: usize,
    ordinal: usize,
    sources: BTreeSet<String>,
    shards: BTreeSet<String>,
}

/// Deduplicate shard passages and return them in final response order:
/// descending score, ties by ascending shard fingerprint, then ascending
/// chunk ordinal.
pub fn aggregate(passages: Vec<ShardPassage>) -> Vec<AggregatedPassage> {
    let mut groups: HashMap<String, Group> = HashMap::new();

    for ShardPassage { shard, passage } in passages {
        let key = content_key(&passage.text);
        match groups.get_mut(&key) {
            Some(group) => {
                // Keep the best-scoring representative; on equal scores the
                // smaller (shard, ordinal) pair wins so output is stable.
                let better = passage.score > group.score
                    || (passage.score == group.score
                        && (shard.as_str(), passage.ordinal) < (group.shard.as_str(), group.ordinal));
                if better {
                    group.score = passage.score;
                    group.shard = shard.clone();
                    group.page = passage.page;
                    group.ordinal = passage.ordinal;
                    group.content = passage.text;
                }
                group.sources.insert(passage.source);
                group.shards.insert(shard);
            }
            None => {
                let mut sources = BTreeSet::new();
                sources.insert(passage.source);
                let mut shards = BTreeSet::new();
                shards.insert(shard.clone());
                groups.insert(
                    key,
                    Group {
                        content: passage.text,
                        score: passage.score,
                        shard,
                        page: passage.page,
                        ordinal: passage.ordinal,
                        sources,
                        shards,
                    },
                );
            }
        }
    }

    let mut result: Vec<AggregatedPassage> = groups
        .into_iter()
        .map(|(key, g)| AggregatedPassage {
            content: g.content,
            score: g.score,
            sources: g.sources.into_iter().collect(),
            page: g.page,
            ordinal: g.ordinal,
            representative_shard: g.shard,
            shards: g.shards.into_iter().collect(),
            key,
        })
        .collect();

    result.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.representative_shard.cmp(&b.representative_shard))
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
    result
}

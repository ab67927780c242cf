//! Deduplication and ordering of batch results

use std::collections::HashSet;
use std::hash::Hash;

use url::Url;

use crate::models::{BatchStats, FetchResult, SearchHit};

pub struct ResultAggregator;

impl ResultAggregator {
    /// Unique successes ordered by submission index, plus batch statistics
    ///
    /// Successes whose `key` was already seen are dropped and counted as
    /// duplicates. Failures never appear in the returned sequence.
    pub fn merge<K, F>(results: Vec<FetchResult>, key: F) -> (Vec<FetchResult>, BatchStats)
    where
        K: Eq + Hash,
        F: Fn(&FetchResult) -> K,
    {
        let mut results = results;
        results.sort_by_key(|r| r.task_index);

        let mut stats = BatchStats {
            attempted: results.len(),
            ..BatchStats::default()
        };
        let mut seen = HashSet::new();
        let mut unique = Vec::new();

        for result in results {
            if let Some(kind) = result.failure_kind() {
                stats.record_failure(kind);
                continue;
            }

            stats.succeeded += 1;
            if seen.insert(key(&result)) {
                unique.push(result);
            } else {
                stats.duplicates += 1;
            }
        }

        (unique, stats)
    }

    /// Identity key of a successful result: its normalized final URL, or
    /// the target when there was no redirect information
    pub fn url_key(result: &FetchResult) -> String {
        let url = result
            .payload()
            .map(|p| p.final_url.as_str())
            .filter(|u| !u.is_empty())
            .unwrap_or(&result.target);
        normalize_url(url)
    }

    /// Dedup search hits from several engines by normalized link, keeping
    /// the first one seen
    pub fn merge_hits(hits: impl IntoIterator<Item = SearchHit>) -> Vec<SearchHit> {
        let mut seen = HashSet::new();
        hits.into_iter()
            .filter(|hit| seen.insert(normalize_url(&hit.link)))
            .collect()
    }
}

/// Lowercase scheme and host, no fragment, no trailing slash
///
/// Strings that do not parse as URLs are only trimmed.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut url) = Url::parse(raw) else {
        return raw.trim_end_matches('/').to_string();
    };

    url.set_fragment(None);
    url.as_str().trim_end_matches('/').to_string()
}

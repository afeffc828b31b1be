// src/keywords.rs
//! Keyword extraction over the ranked article set: stemmed unigram/bigram/
//! trigram document frequencies with a TF-IDF style score, optionally boosted
//! by external market movers. Pure over its inputs; callers own the corpus.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::ingest::types::FeedItem;
use crate::market::MarketBoost;
use crate::text;

/// One scored term. `label` is the first surface form observed; `stem` is the
/// canonical key every lookup uses.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KeywordStat {
    pub stem: String,
    pub label: String,
    pub doc_freq: u32,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct KeywordConfig {
    /// Size of the by-score list.
    pub top_keywords: usize,
    /// Size of the by-frequency list (single-word terms only).
    pub top_frequent: usize,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            top_keywords: 20,
            top_frequent: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct KeywordSummary {
    pub top_keywords: Vec<KeywordStat>,
    pub most_frequent: Vec<KeywordStat>,
}

/// Document-frequency floor granted to exchange-paired asset stems.
const PAIRED_FLOOR_DF: u32 = 5;
/// Score floor granted to exchange-paired asset stems.
const PAIRED_FLOOR_SCORE: f64 = 5.0;

fn idf(corpus_size: usize, doc_freq: u32) -> f64 {
    ((corpus_size as f64 + 1.0) / doc_freq as f64).ln() + 1.0
}

struct TermAcc {
    label: String,
    doc_freq: u32,
    term_freq: u64,
}

/// Score a corpus of items. Boost data is best-effort: `None` skips the mover
/// pass entirely, it never fails scoring.
pub fn score_corpus(
    items: &[FeedItem],
    boost: Option<&MarketBoost>,
    cfg: &KeywordConfig,
) -> KeywordSummary {
    let n = items.len();
    if n == 0 {
        return KeywordSummary::default();
    }

    let mut acc: HashMap<String, TermAcc> = HashMap::new();

    for item in items {
        let raw = text::tokenize(&format!("{} {}", item.title, item.summary));
        let stems: Vec<String> = raw.iter().map(|t| text::stem(t)).collect();

        // df counts an item at most once per term
        let mut seen_here: HashSet<String> = HashSet::new();

        for width in 1..=3usize {
            if stems.len() < width {
                break;
            }
            for i in 0..=(stems.len() - width) {
                let term = stems[i..i + width].join(" ");
                let entry = acc.entry(term.clone()).or_insert_with(|| TermAcc {
                    label: raw[i..i + width].join(" "),
                    doc_freq: 0,
                    term_freq: 0,
                });
                entry.term_freq += 1;
                if seen_here.insert(term) {
                    entry.doc_freq += 1;
                }
            }
        }
    }

    let mut stats: Vec<KeywordStat> = acc
        .into_iter()
        .map(|(stem, a)| KeywordStat {
            score: a.term_freq as f64 * idf(n, a.doc_freq),
            stem,
            label: a.label,
            doc_freq: a.doc_freq,
        })
        .collect();

    apply_paired_floors(items, &mut stats);
    if let Some(b) = boost {
        apply_mover_boost(b, &mut stats);
    }

    let mut by_score = stats.clone();
    by_score.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.stem.cmp(&b.stem)));
    by_score.truncate(cfg.top_keywords);

    let top_set: HashSet<&str> = by_score.iter().map(|k| k.stem.as_str()).collect();
    let mut by_freq: Vec<KeywordStat> = stats
        .into_iter()
        .filter(|k| !k.stem.contains(' ') && !top_set.contains(k.stem.as_str()))
        .collect();
    by_freq.sort_by(|a, b| b.doc_freq.cmp(&a.doc_freq).then_with(|| a.stem.cmp(&b.stem)));
    by_freq.truncate(cfg.top_frequent);

    KeywordSummary {
        top_keywords: by_score,
        most_frequent: by_freq,
    }
}

/// Exchange-paired items guarantee their asset stem a df/score floor even
/// with zero textual mentions, so the keyword filter can surface them.
fn apply_paired_floors(items: &[FeedItem], stats: &mut Vec<KeywordStat>) {
    for item in items {
        let Some((_, asset)) = item.exchange_pair() else {
            continue;
        };
        let asset_stem = text::stem(&asset.to_lowercase());
        if asset_stem.is_empty() {
            continue;
        }
        match stats.iter_mut().find(|k| k.stem == asset_stem) {
            Some(k) => {
                k.doc_freq = k.doc_freq.max(PAIRED_FLOOR_DF);
                k.score = k.score.max(PAIRED_FLOOR_SCORE);
            }
            None => stats.push(KeywordStat {
                stem: asset_stem,
                label: asset.to_string(),
                doc_freq: PAIRED_FLOOR_DF,
                score: PAIRED_FLOOR_SCORE,
            }),
        }
    }
}

/// Movers already present in the corpus get `score * 3 + 5`. Unknown mover
/// stems are ignored: the boost amplifies coverage, it never invents terms.
fn apply_mover_boost(boost: &MarketBoost, stats: &mut [KeywordStat]) {
    if boost.mover_stems.is_empty() {
        return;
    }
    let movers: HashSet<&str> = boost.mover_stems.iter().map(String::as_str).collect();
    let mut boosted = 0usize;
    for k in stats.iter_mut() {
        if movers.contains(k.stem.as_str()) {
            k.score = k.score * 3.0 + 5.0;
            boosted += 1;
        }
    }
    if boosted > 0 {
        tracing::debug!(boosted, movers = movers.len(), "applied market-mover boost");
    }
}

/// Articles whose stem-set contains the (stemmed) keyword, for the filter
/// view. Keyword may arrive as any surface form.
pub fn filter_by_keyword<'a>(items: &'a [FeedItem], keyword: &str) -> Vec<&'a FeedItem> {
    let toks = text::tokenize(keyword);
    let wanted = match toks.first() {
        Some(t) => text::stem(t),
        // Degenerate queries (too short, stopword) stem the raw lowercase.
        None => text::stem(keyword.trim().to_lowercase().as_str()),
    };
    if wanted.is_empty() {
        return Vec::new();
    }
    items
        .iter()
        .filter(|i| i.stems.iter().any(|s| s == &wanted))
        .collect()
}

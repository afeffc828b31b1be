// src/identity.rs
//! Identity matching between an operator selection and the external
//! pipeline's reported results. Pure functions over typed inputs; callers
//! decide what "not found" means (usually: not yet, try again later).
//!
//! Signal priority: run token > numeric id > slug > title key > url key.
//! Each signal level is scanned across all candidates before falling through
//! to the next, so a weaker signal can never outrank a stronger one.

use serde::{Deserialize, Serialize};

use crate::ingest::types::FeedItem;
use crate::text;

/// An operator-chosen item queued for publishing. Immutable once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionItem {
    pub item_id: String,
    pub title: String,
    pub summary: String,
    pub url: Option<String>,
    /// Slug derived from the title at staging time.
    pub slug: String,
    /// Slugs from an earlier rewrite step, still valid identity signals.
    #[serde(default)]
    pub prior_slugs: Vec<String>,
    /// Numeric record id once known (from the dispatch ack or a prior match).
    #[serde(default)]
    pub known_id: Option<u64>,
}

impl SelectionItem {
    pub fn from_feed_item(item: &FeedItem) -> Self {
        Self {
            item_id: item.id.clone(),
            title: item.title.clone(),
            summary: item.summary.clone(),
            url: item.url.clone(),
            slug: text::slugify(&item.title),
            prior_slugs: Vec::new(),
            known_id: None,
        }
    }

    fn slug_family(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.slug.as_str()).chain(self.prior_slugs.iter().map(String::as_str))
    }
}

/// One entry of the pipeline's result summary. Field names differ between
/// pipeline versions, so id-like values are modeled as explicit optional
/// fields probed in a fixed order rather than ad hoc key guessing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryItem {
    pub id: Option<u64>,
    #[serde(alias = "postId")]
    pub post_id: Option<u64>,
    #[serde(alias = "recordId")]
    pub record_id: Option<u64>,
    #[serde(alias = "dbId")]
    pub db_id: Option<u64>,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(alias = "permalink", alias = "link")]
    pub url: Option<String>,
    /// Run-token echo, when the pipeline carries one.
    pub token: Option<String>,
}

impl SummaryItem {
    /// First id-like field present, in declaration order.
    pub fn any_id(&self) -> Option<u64> {
        self.id.or(self.post_id).or(self.record_id).or(self.db_id)
    }

    /// Whether ANY id-like field equals `id`, regardless of which.
    pub fn matches_id(&self, id: u64) -> bool {
        [self.id, self.post_id, self.record_id, self.db_id]
            .into_iter()
            .flatten()
            .any(|v| v == id)
    }
}

#[derive(Debug, PartialEq)]
pub enum Match<'a> {
    /// Run token matched; the whole run is accepted, no per-item scan needed.
    WholeRun,
    Item(&'a SummaryItem),
    NotFound,
}

/// Resolve one selection against the candidates. Pure; no logging, no state.
pub fn match_selection<'a>(
    selection: &SelectionItem,
    run_token: Option<&str>,
    candidates: &'a [SummaryItem],
) -> Match<'a> {
    if let Some(tok) = run_token {
        if candidates
            .iter()
            .any(|c| c.token.as_deref() == Some(tok))
        {
            return Match::WholeRun;
        }
    }

    if let Some(id) = selection.known_id {
        if let Some(c) = candidates.iter().find(|c| c.matches_id(id)) {
            return Match::Item(c);
        }
    }

    if let Some(c) = candidates.iter().find(|c| {
        c.slug
            .as_deref()
            .is_some_and(|s| selection.slug_family().any(|mine| mine == s))
    }) {
        return Match::Item(c);
    }

    let want_title = text::title_key(&selection.title);
    if !want_title.is_empty() {
        if let Some(c) = candidates
            .iter()
            .find(|c| c.title.as_deref().map(text::title_key) == Some(want_title.clone()))
        {
            return Match::Item(c);
        }
    }

    if let Some(want_url) = selection.url.as_deref().map(text::url_key) {
        if !want_url.is_empty() {
            if let Some(c) = candidates
                .iter()
                .find(|c| c.url.as_deref().map(text::url_key) == Some(want_url.clone()))
            {
                return Match::Item(c);
            }
        }
    }

    Match::NotFound
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NearMiss {
    pub value: String,
    pub similarity: f64,
}

/// What an operator needs to judge a failed match: the keys we offered, the
/// keys the candidates offered, and the closest slug/title by edit distance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchDiagnostics {
    pub attempted: Vec<String>,
    pub candidate_keys: Vec<String>,
    pub nearest_slug: Option<NearMiss>,
    pub nearest_title: Option<NearMiss>,
}

pub fn diagnose(
    selection: &SelectionItem,
    run_token: Option<&str>,
    candidates: &[SummaryItem],
) -> MatchDiagnostics {
    let mut d = MatchDiagnostics::default();

    if let Some(tok) = run_token {
        d.attempted.push(format!("token:{tok}"));
    }
    if let Some(id) = selection.known_id {
        d.attempted.push(format!("id:{id}"));
    }
    for s in selection.slug_family() {
        d.attempted.push(format!("slug:{s}"));
    }
    d.attempted.push(format!("title:{}", text::title_key(&selection.title)));
    if let Some(u) = selection.url.as_deref() {
        d.attempted.push(format!("url:{}", text::url_key(u)));
    }

    for c in candidates {
        if let Some(id) = c.any_id() {
            d.candidate_keys.push(format!("id:{id}"));
        }
        if let Some(s) = c.slug.as_deref() {
            d.candidate_keys.push(format!("slug:{s}"));
        }
        if let Some(t) = c.title.as_deref() {
            d.candidate_keys.push(format!("title:{}", text::title_key(t)));
        }
    }

    d.nearest_slug = nearest(
        &selection.slug,
        candidates.iter().filter_map(|c| c.slug.as_deref()),
    );
    d.nearest_title = nearest(
        &text::title_key(&selection.title),
        candidates.iter().filter_map(|c| c.title.as_deref()),
    );

    d
}

fn nearest<'a>(target: &str, pool: impl Iterator<Item = &'a str>) -> Option<NearMiss> {
    if target.is_empty() {
        return None;
    }
    pool.map(|v| NearMiss {
        value: v.to_string(),
        similarity: strsim::normalized_levenshtein(target, v),
    })
    .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(title: &str, slug: &str) -> SelectionItem {
        SelectionItem {
            item_id: "i1".into(),
            title: title.into(),
            summary: String::new(),
            url: None,
            slug: slug.into(),
            prior_slugs: Vec::new(),
            known_id: None,
        }
    }

    fn cand(slug: Option<&str>, title: Option<&str>) -> SummaryItem {
        SummaryItem {
            slug: slug.map(str::to_string),
            title: title.map(str::to_string),
            ..SummaryItem::default()
        }
    }

    #[test]
    fn token_short_circuits_to_whole_run() {
        let s = sel("Anything", "anything");
        let mut c = cand(None, None);
        c.token = Some("run-42".into());
        assert_eq!(match_selection(&s, Some("run-42"), &[c]), Match::WholeRun);
    }

    #[test]
    fn id_match_works_on_any_id_field() {
        let mut s = sel("T", "t");
        s.known_id = Some(7);
        let mut c = cand(Some("other"), Some("Other"));
        c.post_id = Some(7);
        let out = match_selection(&s, None, std::slice::from_ref(&c));
        assert_eq!(out, Match::Item(&c));
    }

    #[test]
    fn slug_beats_conflicting_title() {
        let s = sel("Bitcoin ETF approved", "bitcoin-etf-approved");
        // First candidate matches only the title, second only the slug, and
        // the slug carrier has a deliberately conflicting title.
        let by_title = cand(Some("something-else"), Some("Bitcoin ETF approved"));
        let by_slug = cand(Some("bitcoin-etf-approved"), Some("A totally different headline"));
        let cands = vec![by_title, by_slug.clone()];
        let out = match_selection(&s, None, &cands);
        assert_eq!(out, Match::Item(&cands[1]));
        assert_eq!(Match::Item(&by_slug), out);
    }

    #[test]
    fn prior_slugs_participate_in_slug_matching() {
        let mut s = sel("New headline", "new-headline");
        s.prior_slugs = vec!["old-headline".into()];
        let c = cand(Some("old-headline"), None);
        let cands = vec![c];
        assert_eq!(match_selection(&s, None, &cands), Match::Item(&cands[0]));
    }

    #[test]
    fn title_key_match_tolerates_punctuation() {
        let s = sel("Bitcoin hits $100k!", "bitcoin-hits-100k");
        let c = cand(None, Some("bitcoin hits 100k"));
        let cands = vec![c];
        assert_eq!(match_selection(&s, None, &cands), Match::Item(&cands[0]));
    }

    #[test]
    fn url_key_is_last_resort() {
        let mut s = sel("Unrelated", "unrelated");
        s.url = Some("https://ex.com/story?utm=x".into());
        let mut c = cand(None, None);
        c.url = Some("http://ex.com/story".into());
        let cands = vec![c];
        assert_eq!(match_selection(&s, None, &cands), Match::Item(&cands[0]));
    }

    #[test]
    fn no_signal_is_not_found() {
        let s = sel("Nothing in common", "nothing-in-common");
        let c = cand(Some("different"), Some("Different"));
        assert_eq!(match_selection(&s, None, &[c]), Match::NotFound);
    }

    #[test]
    fn diagnostics_surface_near_miss() {
        let s = sel("Bitcoin ETF approval", "bitcoin-etf-approval");
        let c = cand(Some("bitcoin-etf-approved"), Some("Bitcoin ETF approved"));
        let d = diagnose(&s, None, &[c]);
        let near = d.nearest_slug.expect("nearest slug");
        assert_eq!(near.value, "bitcoin-etf-approved");
        assert!(near.similarity > 0.8, "similarity {}", near.similarity);
        assert!(d.attempted.iter().any(|k| k.starts_with("slug:")));
        assert!(d.candidate_keys.iter().any(|k| k.starts_with("slug:")));
    }
}

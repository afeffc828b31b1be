// src/ingest/types.rs
use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::text;

/// One ingested headline. Immutable once built; duplicates are dropped
/// in-batch by `dedup`, never mutated.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    /// Sanitized plain-text summary, capped at `text::SUMMARY_MAX_CHARS`.
    pub summary: String,
    /// Source tag, e.g. "coindesk" or "binance:BTC" for exchange-paired feeds.
    pub source: String,
    pub published_at: u64, // unix seconds
    pub url: Option<String>,
    /// Stemmed content terms, bounded to `text::ITEM_STEM_CAP`.
    pub stems: Vec<String>,
    /// 1-based display order assigned after the final sort; 0 until ranked.
    #[serde(default)]
    pub rank: usize,
}

impl FeedItem {
    /// Build an item from raw provider fields. The id is the provider-native
    /// id when present, otherwise a stable hash of url + title + timestamp.
    pub fn new(
        native_id: Option<String>,
        title: String,
        summary: String,
        source: String,
        published_at: u64,
        url: Option<String>,
    ) -> Self {
        let title = text::normalize_text(&title);
        let summary = text::normalize_text(&summary);
        let id = native_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| derived_id(url.as_deref(), &title, published_at));
        let mut seen = std::collections::HashSet::new();
        let mut stems: Vec<String> = text::stem_tokens(&format!("{title} {summary}"))
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .collect();
        stems.truncate(text::ITEM_STEM_CAP);
        // Exchange-paired sources always carry their asset stem so the
        // keyword filter can reach them without a textual mention.
        if let Some((ex, asset)) = source.split_once(':') {
            if !ex.is_empty() && !asset.is_empty() {
                let asset_stem = text::stem(&asset.to_lowercase());
                if !asset_stem.is_empty() && !stems.contains(&asset_stem) {
                    stems.insert(0, asset_stem);
                    stems.truncate(text::ITEM_STEM_CAP);
                }
            }
        }
        Self {
            id,
            title,
            summary,
            source,
            published_at,
            url,
            stems,
            rank: 0,
        }
    }

    pub fn title_key(&self) -> String {
        text::title_key(&self.title)
    }

    pub fn url_key(&self) -> Option<String> {
        self.url.as_deref().map(text::url_key)
    }

    /// Exchange pairing carried in the source tag (`exchange:ASSET`), if any.
    pub fn exchange_pair(&self) -> Option<(&str, &str)> {
        let (ex, asset) = self.source.split_once(':')?;
        if ex.is_empty() || asset.is_empty() {
            return None;
        }
        Some((ex, asset))
    }
}

fn derived_id(url: Option<&str>, title: &str, published_at: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.unwrap_or_default().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(title.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(published_at.to_be_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait::async_trait]
pub trait FeedProvider: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<FeedItem>>;
    /// Display name for logs and metrics labels.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_is_stable_and_distinct() {
        let a = derived_id(Some("https://ex.com/a"), "Title", 100);
        let b = derived_id(Some("https://ex.com/a"), "Title", 100);
        let c = derived_id(Some("https://ex.com/a"), "Title", 101);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn native_id_wins_over_hash() {
        let item = FeedItem::new(
            Some("feed-123".into()),
            "t".into(),
            "s".into(),
            "src".into(),
            1,
            None,
        );
        assert_eq!(item.id, "feed-123");
    }

    #[test]
    fn blank_native_id_falls_back_to_hash() {
        let item = FeedItem::new(Some("  ".into()), "t".into(), "s".into(), "src".into(), 1, None);
        assert_eq!(item.id.len(), 16);
    }

    #[test]
    fn exchange_pair_parses_source_tag() {
        let item = FeedItem::new(None, "t".into(), "".into(), "binance:BTC".into(), 1, None);
        assert_eq!(item.exchange_pair(), Some(("binance", "BTC")));
        let plain = FeedItem::new(None, "t".into(), "".into(), "coindesk".into(), 1, None);
        assert_eq!(plain.exchange_pair(), None);
    }

    #[test]
    fn paired_source_injects_asset_stem() {
        let item =
            FeedItem::new(None, "Listing update".into(), "".into(), "binance:BTC".into(), 1, None);
        assert!(item.stems.contains(&crate::text::stem("btc")));
    }

    #[test]
    fn stems_are_bounded() {
        let long: String = (0..100).map(|i| format!("uniqueword{i} ")).collect();
        let item = FeedItem::new(None, long.clone(), long, "src".into(), 1, None);
        assert!(item.stems.len() <= crate::text::ITEM_STEM_CAP);
    }
}

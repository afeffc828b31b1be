// src/ingest/dedup.rs
//! In-batch deduplication over composite identity keys. An item is a
//! duplicate when ANY of its keys (normalized url, normalized title) was
//! already seen; survivors keep first-seen order.

use std::collections::HashSet;

use crate::ingest::types::FeedItem;

fn keys_of(item: &FeedItem) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(u) = item.url_key() {
        if !u.is_empty() {
            keys.push(format!("u:{u}"));
        }
    }
    let t = item.title_key();
    if !t.is_empty() {
        keys.push(format!("t:{t}"));
    }
    keys
}

/// Drop duplicates from an ordered batch. Returns the survivors plus the
/// number of items removed.
pub fn dedup_items(items: Vec<FeedItem>) -> (Vec<FeedItem>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut removed = 0usize;

    for item in items {
        let keys = keys_of(&item);
        if keys.iter().any(|k| seen.contains(k)) {
            removed += 1;
            continue;
        }
        for k in keys {
            seen.insert(k);
        }
        kept.push(item);
    }

    (kept, removed)
}

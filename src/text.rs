// src/text.rs
//! Text primitives shared by ingest, keyword scoring, and identity matching:
//! HTML-safe normalization, tokenization, stemming, and the derived keys
//! (slug, title key, url key) used for dedup and reconciliation.

use once_cell::sync::{Lazy, OnceCell};
use std::collections::HashSet;

/// Hard cap applied to normalized summaries.
pub const SUMMARY_MAX_CHARS: usize = 600;

/// Per-item cap on stored stems.
pub const ITEM_STEM_CAP: usize = 24;

/// Minimum token length kept by the tokenizer (shorter tokens are noise).
const MIN_TOKEN_LEN: usize = 3;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
        "our", "out", "has", "have", "him", "his", "how", "its", "may", "new", "now", "off", "own",
        "say", "says", "said", "she", "too", "use", "will", "with", "this", "that", "these",
        "those", "from", "they", "them", "then", "than", "there", "their", "what", "when", "where",
        "which", "while", "who", "whom", "why", "would", "could", "should", "been", "being",
        "into", "over", "under", "after", "before", "about", "above", "again", "against", "also",
        "more", "most", "some", "such", "only", "other", "very", "just", "here", "does", "did",
        "between", "because", "during", "each", "were", "amid",
    ]
    .into_iter()
    .collect()
});

/// Normalize raw feed text: decode entities, strip tags, fold typographic
/// quotes, collapse whitespace, trim trailing sentence punctuation, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Strip trailing sentence punctuation (keep quotes)
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }

    // 6) Length cap
    if out.chars().count() > SUMMARY_MAX_CHARS {
        out = out.chars().take(SUMMARY_MAX_CHARS).collect();
    }

    out
}

/// Fold common Latin diacritics to their ASCII base letter. Characters outside
/// the table pass through unchanged.
fn fold_char(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'ą' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'ě' | 'ę' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'ů' => 'u',
        'ý' | 'ÿ' => 'y',
        'č' | 'ç' | 'ć' => 'c',
        'ď' => 'd',
        'ľ' | 'ł' => 'l',
        'ñ' | 'ň' | 'ń' => 'n',
        'ř' => 'r',
        'š' | 'ś' => 's',
        'ť' => 't',
        'ž' | 'ź' | 'ż' => 'z',
        other => other,
    }
}

/// Lowercase, fold diacritics, split on non-alphanumeric runs, drop short
/// tokens and stopwords. Output order follows the input text.
pub fn tokenize(s: &str) -> Vec<String> {
    let folded: String = s.to_lowercase().chars().map(fold_char).collect();
    folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

#[cfg(feature = "stemming")]
static STEMMER: Lazy<rust_stemmers::Stemmer> =
    Lazy::new(|| rust_stemmers::Stemmer::create(rust_stemmers::Algorithm::English));

/// Stem a lowercase token. With the `stemming` feature disabled the token
/// passes through unchanged and a one-time warning is emitted: scoring still
/// works, it just stops merging inflected forms.
pub fn stem(token: &str) -> String {
    #[cfg(feature = "stemming")]
    {
        STEMMER.stem(token).to_string()
    }
    #[cfg(not(feature = "stemming"))]
    {
        static WARNED: OnceCell<()> = OnceCell::new();
        WARNED.get_or_init(|| {
            tracing::warn!("stemming feature disabled; keyword merging degraded to exact tokens");
        });
        token.to_string()
    }
}

/// Tokenize and stem in one pass; the standard entry for scoring.
pub fn stem_tokens(s: &str) -> Vec<String> {
    tokenize(s).iter().map(|t| stem(t)).collect()
}

/// URL-safe slug: lowercase, diacritics folded, alphanumeric runs joined by
/// single hyphens.
pub fn slugify(s: &str) -> String {
    let folded: String = s.to_lowercase().chars().map(fold_char).collect();
    folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Normalized title key for dedup and identity matching: lowercase, diacritics
/// folded, punctuation removed, whitespace collapsed to single spaces. Unlike
/// `tokenize` this keeps every word so near-identical titles collide.
pub fn title_key(s: &str) -> String {
    let folded: String = s.to_lowercase().chars().map(fold_char).collect();
    folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized url key: scheme, `www.` prefix, query string, fragment, and
/// trailing slashes are irrelevant to identity and get stripped.
pub fn url_key(url: &str) -> String {
    let mut s = url.trim().to_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest.to_string();
            break;
        }
    }
    if let Some(rest) = s.strip_prefix("www.") {
        s = rest.to_string();
    }
    if let Some(pos) = s.find(['?', '#']) {
        s.truncate(pos);
    }
    while s.ends_with('/') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_tags_and_entities() {
        let s = "<p>Bitcoin &amp; Ether rally!</p>";
        assert_eq!(normalize_text(s), "Bitcoin & Ether rally");
    }

    #[test]
    fn normalize_caps_length() {
        let long = "x".repeat(2000);
        assert_eq!(normalize_text(&long).chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn tokenize_drops_short_and_stopwords() {
        let toks = tokenize("The ETF and BTC rally is on");
        assert_eq!(toks, vec!["etf".to_string(), "btc".into(), "rally".into()]);
    }

    #[test]
    fn tokenize_folds_diacritics() {
        let toks = tokenize("Měnová politika");
        assert_eq!(toks, vec!["menova".to_string(), "politika".into()]);
    }

    #[cfg(feature = "stemming")]
    #[test]
    fn stem_merges_inflections() {
        assert_eq!(stem("rallies"), stem("rally"));
        assert_eq!(stem("mining"), stem("mine"));
    }

    #[test]
    fn slugify_is_hyphen_joined_ascii() {
        assert_eq!(slugify("Bitcoin's Big Day: ETF Approved!"), "bitcoin-s-big-day-etf-approved");
        assert_eq!(slugify("  Émission -- spéciale  "), "emission-speciale");
    }

    #[test]
    fn title_key_collapses_punctuation_variants() {
        assert_eq!(title_key("Bitcoin hits $100k!"), title_key("bitcoin hits 100k"));
    }

    #[test]
    fn url_key_ignores_scheme_query_fragment() {
        assert_eq!(url_key("https://ex.com/a?x=1"), url_key("http://ex.com/a"));
        assert_eq!(url_key("https://www.ex.com/a/#frag"), "ex.com/a");
    }
}

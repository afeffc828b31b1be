// src/config.rs
//! Site configuration: feed list, external service endpoints, and pacing
//! knobs. Read from `config/newsdesk.toml` (overridable via
//! `NEWSDESK_CONFIG_PATH`); a missing file boots with defaults so local runs
//! need no setup.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

const ENV_PATH: &str = "NEWSDESK_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/newsdesk.toml";
const ENV_WEBHOOK: &str = "NEWSDESK_WEBHOOK_URL";

fn default_refresh_secs() -> u64 {
    300
}
fn default_top_movers() -> usize {
    crate::market::DEFAULT_TOP_MOVERS
}
fn default_top_keywords() -> usize {
    20
}
fn default_top_frequent() -> usize {
    20
}

/// One RSS feed. `source` is the tag stamped on every item; an
/// `exchange:ASSET` tag marks the feed as exchange-paired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub source: String,
    /// Display name for logs; falls back to `source`.
    #[serde(default)]
    pub name: Option<String>,
}

impl FeedConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTuning {
    #[serde(default = "RunTuning::default_status_poll_secs")]
    pub status_poll_secs: u64,
    #[serde(default = "RunTuning::default_log_poll_secs")]
    pub log_poll_secs: u64,
    #[serde(default = "RunTuning::default_verify_poll_secs")]
    pub verify_poll_secs: u64,
    #[serde(default = "RunTuning::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "RunTuning::default_log_tail_lines")]
    pub log_tail_lines: usize,
    #[serde(default = "RunTuning::default_staging_path")]
    pub staging_path: String,
}

impl RunTuning {
    fn default_status_poll_secs() -> u64 {
        2
    }
    fn default_log_poll_secs() -> u64 {
        2
    }
    fn default_verify_poll_secs() -> u64 {
        1
    }
    fn default_timeout_secs() -> u64 {
        300
    }
    fn default_log_tail_lines() -> usize {
        80
    }
    fn default_staging_path() -> String {
        "state/staged_selection.json".to_string()
    }

    pub fn to_run_config(&self) -> crate::run::RunConfig {
        crate::run::RunConfig {
            status_poll: Duration::from_secs(self.status_poll_secs.max(1)),
            log_poll: Duration::from_secs(self.log_poll_secs.max(1)),
            fast_verify: Duration::from_secs(self.verify_poll_secs.max(1)),
            run_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            log_tail_lines: self.log_tail_lines.max(1),
            staging_path: PathBuf::from(&self.staging_path),
        }
    }
}

impl Default for RunTuning {
    fn default() -> Self {
        Self {
            status_poll_secs: Self::default_status_poll_secs(),
            log_poll_secs: Self::default_log_poll_secs(),
            verify_poll_secs: Self::default_verify_poll_secs(),
            timeout_secs: Self::default_timeout_secs(),
            log_tail_lines: Self::default_log_tail_lines(),
            staging_path: Self::default_staging_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTuning {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "ImageTuning::default_readiness_poll_secs")]
    pub readiness_poll_secs: u64,
    #[serde(default = "ImageTuning::default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "ImageTuning::default_backoff_start_secs")]
    pub backoff_start_secs: u64,
    #[serde(default = "ImageTuning::default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "ImageTuning::default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "ImageTuning::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "ImageTuning::default_size")]
    pub size: String,
    #[serde(default = "ImageTuning::default_style")]
    pub style: String,
    #[serde(default = "ImageTuning::default_model")]
    pub model: String,
}

impl ImageTuning {
    fn default_readiness_poll_secs() -> u64 {
        1
    }
    fn default_readiness_timeout_secs() -> u64 {
        60
    }
    fn default_backoff_start_secs() -> u64 {
        1
    }
    fn default_backoff_factor() -> f64 {
        1.6
    }
    fn default_backoff_cap_secs() -> u64 {
        15
    }
    fn default_max_attempts() -> u32 {
        12
    }
    fn default_size() -> String {
        "1024x1024".to_string()
    }
    fn default_style() -> String {
        "editorial".to_string()
    }
    fn default_model() -> String {
        "sdxl".to_string()
    }

    pub fn to_image_config(&self) -> crate::images::ImageConfig {
        crate::images::ImageConfig {
            readiness_poll: Duration::from_secs(self.readiness_poll_secs.max(1)),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs.max(1)),
            backoff_start: Duration::from_secs(self.backoff_start_secs.max(1)),
            // A shrinking backoff is never intended; clamp to flat.
            backoff_factor: self.backoff_factor.max(1.0),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs.max(1)),
            max_attempts: self.max_attempts.max(1),
            size: self.size.clone(),
            style: self.style.clone(),
            model: self.model.clone(),
        }
    }
}

impl Default for ImageTuning {
    fn default() -> Self {
        Self {
            base_url: None,
            readiness_poll_secs: Self::default_readiness_poll_secs(),
            readiness_timeout_secs: Self::default_readiness_timeout_secs(),
            backoff_start_secs: Self::default_backoff_start_secs(),
            backoff_factor: Self::default_backoff_factor(),
            backoff_cap_secs: Self::default_backoff_cap_secs(),
            max_attempts: Self::default_max_attempts(),
            size: Self::default_size(),
            style: Self::default_style(),
            model: Self::default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsdeskConfig {
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default)]
    pub market_url: Option<String>,
    #[serde(default = "default_top_movers")]
    pub top_movers: usize,
    #[serde(default = "default_top_keywords")]
    pub top_keywords: usize,
    #[serde(default = "default_top_frequent")]
    pub top_frequent: usize,
    #[serde(default)]
    pub pipeline_url: Option<String>,
    #[serde(default)]
    pub export_url: Option<String>,
    /// "ENV" means: read from NEWSDESK_WEBHOOK_URL.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub run: RunTuning,
    #[serde(default)]
    pub images: ImageTuning,
}

impl Default for NewsdeskConfig {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            refresh_secs: default_refresh_secs(),
            market_url: None,
            top_movers: default_top_movers(),
            top_keywords: default_top_keywords(),
            top_frequent: default_top_frequent(),
            pipeline_url: None,
            export_url: None,
            webhook_url: None,
            run: RunTuning::default(),
            images: ImageTuning::default(),
        }
    }
}

impl NewsdeskConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: NewsdeskConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Load using env var + fallback:
    /// 1) $NEWSDESK_CONFIG_PATH
    /// 2) config/newsdesk.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("NEWSDESK_CONFIG_PATH points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Ok(Self::default())
    }

    fn sanitize(&mut self) {
        self.feeds.retain(|f| !f.url.trim().is_empty());
        for f in &mut self.feeds {
            f.url = f.url.trim().to_string();
            f.source = f.source.trim().to_string();
        }
        self.refresh_secs = self.refresh_secs.max(10);
        self.top_movers = self.top_movers.max(1);
        self.top_keywords = self.top_keywords.max(1);
        self.top_frequent = self.top_frequent.max(1);
    }

    /// Webhook target with the "ENV" indirection resolved. A configured but
    /// unresolvable webhook is reported, not ignored.
    pub fn resolved_webhook_url(&self) -> Result<Option<String>> {
        match self.webhook_url.as_deref() {
            None => Ok(None),
            Some(v) if v.trim().eq_ignore_ascii_case("env") => env::var(ENV_WEBHOOK)
                .map(Some)
                .map_err(|_| anyhow!("webhook_url is \"ENV\" but {ENV_WEBHOOK} is not set")),
            Some(v) => Ok(Some(v.to_string())),
        }
    }

    pub fn keyword_config(&self) -> crate::keywords::KeywordConfig {
        crate::keywords::KeywordConfig {
            top_keywords: self.top_keywords,
            top_frequent: self.top_frequent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: NewsdeskConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.refresh_secs, 300);
        assert_eq!(cfg.run.status_poll_secs, 2);
        assert_eq!(cfg.run.verify_poll_secs, 1);
        assert_eq!(cfg.run.timeout_secs, 300);
        assert_eq!(cfg.images.max_attempts, 12);
        assert!((cfg.images.backoff_factor - 1.6).abs() < 1e-9);
        assert!(cfg.feeds.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let toml_src = r#"
            refresh_secs = 120
            market_url = "https://api.exchange.test/ticker/24hr"
            pipeline_url = "https://pipeline.test"
            top_movers = 5

            [[feeds]]
            url = "https://coindesk.test/rss"
            source = "coindesk"

            [[feeds]]
            url = "https://exchange.test/announcements.rss"
            source = "binance:BTC"
            name = "Binance BTC desk"

            [run]
            timeout_secs = 60

            [images]
            base_url = "https://images.test"
            backoff_cap_secs = 10
        "#;
        let mut cfg: NewsdeskConfig = toml::from_str(toml_src).unwrap();
        cfg.sanitize();
        assert_eq!(cfg.feeds.len(), 2);
        assert_eq!(cfg.feeds[1].display_name(), "Binance BTC desk");
        assert_eq!(cfg.run.timeout_secs, 60);
        // Untouched knobs keep their defaults.
        assert_eq!(cfg.run.status_poll_secs, 2);
        assert_eq!(cfg.images.backoff_cap_secs, 10);
        assert_eq!(cfg.images.readiness_timeout_secs, 60);
        assert_eq!(cfg.top_movers, 5);
    }

    #[test]
    fn sanitize_drops_blank_feeds_and_clamps() {
        let toml_src = r#"
            refresh_secs = 1

            [[feeds]]
            url = "   "
            source = "ghost"
        "#;
        let mut cfg: NewsdeskConfig = toml::from_str(toml_src).unwrap();
        cfg.sanitize();
        assert!(cfg.feeds.is_empty());
        assert_eq!(cfg.refresh_secs, 10);
    }

    #[serial_test::serial]
    #[test]
    fn webhook_env_indirection() {
        env::remove_var(ENV_WEBHOOK);
        let cfg = NewsdeskConfig {
            webhook_url: Some("ENV".into()),
            ..NewsdeskConfig::default()
        };
        assert!(cfg.resolved_webhook_url().is_err());

        env::set_var(ENV_WEBHOOK, "https://hooks.test/abc");
        assert_eq!(
            cfg.resolved_webhook_url().unwrap().as_deref(),
            Some("https://hooks.test/abc")
        );
        env::remove_var(ENV_WEBHOOK);

        let direct = NewsdeskConfig {
            webhook_url: Some("https://hooks.test/direct".into()),
            ..NewsdeskConfig::default()
        };
        assert_eq!(
            direct.resolved_webhook_url().unwrap().as_deref(),
            Some("https://hooks.test/direct")
        );
    }
}

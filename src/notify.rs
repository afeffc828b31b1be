// src/notify.rs
//! Operator notifications over a generic webhook (Discord-compatible embed
//! shape). Fire-and-forget from the orchestrator's point of view: failures
//! are reported to the caller but never fail a run.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct WebhookNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub async fn send_run_summary(
        &self,
        token: &str,
        outcome: &str,
        done: usize,
        failed: usize,
    ) -> Result<()> {
        let title = format!("Publish run {outcome}");
        let description = format!(
            "**Run:** {}\n**Published:** {}\n**Failed:** {}\n**Time (UTC):** {}",
            token,
            done,
            failed,
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        );
        self.send_embed(&title, &description).await
    }

    async fn send_embed(&self, title: &str, description: &str) -> Result<()> {
        let payload = WebhookPayload::embed(title, description);

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    if let Err(e) = rsp.error_for_status_ref() {
                        if attempt < self.max_retries {
                            tokio::time::sleep(
                                Duration::from_millis(500u64 << (attempt - 1)),
                            )
                            .await;
                            continue;
                        }
                        return Err(anyhow!("webhook HTTP error: {e}"));
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(
                            Duration::from_millis(500u64 << (attempt - 1)),
                        )
                        .await;
                        continue;
                    }
                    return Err(anyhow!("webhook request failed: {e}"));
                }
            }
        }
    }
}

#[derive(Serialize)]
struct WebhookEmbed {
    title: String,
    description: String,
}

#[derive(Serialize)]
struct WebhookPayload {
    content: Option<String>,
    embeds: Vec<WebhookEmbed>,
}

impl WebhookPayload {
    fn embed(title: &str, description: &str) -> Self {
        Self {
            content: None,
            embeds: vec![WebhookEmbed {
                title: title.to_string(),
                description: description.to_string(),
            }],
        }
    }
}

//! Persona rewrite of post text via a chat-completion deployment.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config;

/// Hard platform limit for one post.
pub const MAX_POST_CHARS: usize = 280;

const PERSONA_PROMPT: &str = "\
You are a veteran smart-money trading mentor. You rephrase trading posts in YOUR voice.

YOUR STYLE:
- Direct, confident, no filler
- Use smart-money terminology when it fits: liquidity, order blocks, fair value gaps, displacement, institutional order flow
- Assume the reader already knows the basics
- Slightly provocative is fine
- Emojis sparingly (only if the original has them)

RULES:
1. Keep the EXACT same meaning, add no new information
2. Stay under 280 characters
3. Do not copy word for word
4. Keep any pair or ticker the original names (EURUSD, ES, NQ, ...)
5. No hashtags unless the original has them
6. Return ONLY the rephrased text, nothing else";

static LEADING_MENTIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(@\w+\s*)+").expect("valid regex"));
static SHORT_LINKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://t\.co/\w+").expect("valid regex"));

/// Text rewrite seam. The production impl calls the chat deployment; tests
/// substitute recorders.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, text: &str) -> Result<String>;

    /// False when the client has no credentials and every call would fail.
    fn enabled(&self) -> bool {
        true
    }
}

pub struct RewriteClient {
    http: Client,
    endpoint: Url,
    deployment: String,
    api_version: String,
    api_key: String,
}

impl RewriteClient {
    pub fn from_config(cfg: &config::Rewrite) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint).context("invalid rewrite.endpoint")?;
        Ok(Self::with_endpoint(
            cfg.api_key.clone(),
            cfg.deployment.clone(),
            cfg.api_version.clone(),
            endpoint,
        ))
    }

    pub fn with_endpoint(
        api_key: String,
        deployment: String,
        api_version: String,
        endpoint: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent("repost-agent/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint,
            deployment,
            api_version,
            api_key,
        }
    }

    fn chat_url(&self) -> Result<Url> {
        let mut url = self
            .endpoint
            .join(&format!(
                "openai/deployments/{}/chat/completions",
                self.deployment
            ))
            .context("invalid rewrite endpoint")?;
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }
}

#[async_trait]
impl Rewriter for RewriteClient {
    async fn rewrite(&self, text: &str) -> Result<String> {
        let cleaned = clean_source_text(text);
        if cleaned.is_empty() {
            // nothing left to rephrase once mentions and links are gone
            return Ok(text.to_string());
        }
        if !self.enabled() {
            bail!("rewrite service disabled (no API key)");
        }

        let user_prompt = format!(
            "Rephrase this trading post in your voice:\n\n\"{cleaned}\"\n\n\
             Same meaning, max {MAX_POST_CHARS} characters, only the rephrased text."
        );
        let body = json!({
            "messages": [
                { "role": "system", "content": PERSONA_PROMPT },
                { "role": "user", "content": user_prompt },
            ],
            "max_completion_tokens": 150,
        });

        let res = self
            .http
            .post(self.chat_url()?)
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("failed to reach rewrite service")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("rewrite error {}: {}", status, body);
        }

        let payload: ChatResponse = res.json().await.context("invalid rewrite response JSON")?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("chat completion had no content"))?;
        let rewritten = enforce_post_budget(&content);
        info!(
            original_chars = text.chars().count(),
            rewritten_chars = rewritten.chars().count(),
            "text rewritten"
        );
        Ok(rewritten)
    }

    fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Strip leading mentions and shortener links, collapse whitespace.
pub fn clean_source_text(text: &str) -> String {
    let text = LEADING_MENTIONS.replace(text, "");
    let text = SHORT_LINKS.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim wrapping quotes and hard-truncate to the platform limit, counting
/// characters rather than bytes.
pub fn enforce_post_budget(text: &str) -> String {
    let trimmed = text.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if trimmed.chars().count() <= MAX_POST_CHARS {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(MAX_POST_CHARS - 3).collect();
    format!("{head}...")
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_leading_mentions_only() {
        assert_eq!(
            clean_source_text("@alice @bob great setup on EURUSD"),
            "great setup on EURUSD"
        );
        assert_eq!(
            clean_source_text("watch @alice call this level"),
            "watch @alice call this level"
        );
    }

    #[test]
    fn clean_removes_shortener_links_and_collapses_whitespace() {
        assert_eq!(
            clean_source_text("liquidity grab   incoming https://t.co/Ab12Cd"),
            "liquidity grab incoming"
        );
        assert_eq!(clean_source_text("@a @b https://t.co/xyz123"), "");
    }

    #[test]
    fn budget_passes_short_text_through() {
        assert_eq!(enforce_post_budget("short and sweet"), "short and sweet");
    }

    #[test]
    fn budget_strips_wrapping_quotes() {
        assert_eq!(enforce_post_budget("\"quoted answer\""), "quoted answer");
        assert_eq!(enforce_post_budget("'quoted answer'"), "quoted answer");
    }

    #[test]
    fn budget_truncates_by_characters() {
        let long = "x".repeat(400);
        let out = enforce_post_budget(&long);
        assert_eq!(out.chars().count(), MAX_POST_CHARS);
        assert!(out.ends_with("..."));

        let multibyte = "é".repeat(400);
        let out = enforce_post_budget(&multibyte);
        assert_eq!(out.chars().count(), MAX_POST_CHARS);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn chat_response_parses_content() {
        let payload: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Liquidity above. They will take it."}}]}"#,
        )
        .unwrap();
        assert_eq!(
            payload.choices[0].message.content.as_deref(),
            Some("Liquidity above. They will take it.")
        );
    }

    #[test]
    fn chat_url_includes_deployment_and_api_version() {
        let client = RewriteClient::with_endpoint(
            "key".into(),
            "gpt-4o-mini".into(),
            "2024-12-01-preview".into(),
            Url::parse("https://res.openai.azure.com/").unwrap(),
        );
        let url = client.chat_url().unwrap();
        assert_eq!(
            url.path(),
            "/openai/deployments/gpt-4o-mini/chat/completions"
        );
        assert_eq!(url.query(), Some("api-version=2024-12-01-preview"));
    }

    #[tokio::test]
    async fn rewrite_returns_original_when_nothing_remains() {
        let client = RewriteClient::with_endpoint(
            "key".into(),
            "gpt-4o-mini".into(),
            "2024-12-01-preview".into(),
            Url::parse("https://unused.invalid/").unwrap(),
        );
        let original = "@alice https://t.co/Ab12Cd";
        let out = client.rewrite(original).await.unwrap();
        assert_eq!(out, original);
    }
}

//! Client for the remote upscale service: submit a job, poll until it
//! settles, download the result.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{info, warn};

use crate::config;

const SUBMIT_PATH: &str = "recraft-ai/recraft-crisp-upscale";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Remote image enhancement seam. The production impl talks to the upscale
/// API; tests substitute recorders.
#[async_trait]
pub trait Upscaler: Send + Sync {
    async fn upscale(&self, input: &Path, output: &Path) -> Result<PathBuf>;

    /// False when the client has no credentials and every call would fail.
    fn enabled(&self) -> bool {
        true
    }
}

pub struct UpscaleClient {
    http: Client,
    base_url: Url,
    api_key: String,
    timeout: Duration,
}

impl UpscaleClient {
    pub fn from_config(cfg: &config::Enhance) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid enhance.base_url")?;
        Ok(Self::with_base_url(
            cfg.api_key.clone(),
            Duration::from_secs(cfg.timeout_seconds),
            base_url,
        ))
    }

    pub fn with_base_url(api_key: String, timeout: Duration, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("repost-agent/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            timeout,
        }
    }

    async fn submit(&self, input: &Path) -> Result<String> {
        let bytes = fs::read(input)
            .await
            .with_context(|| format!("failed to read image: {}", input.display()))?;
        let body = json!({
            "image": BASE64.encode(&bytes),
            "enable_base64_output": false,
        });
        let url = self
            .base_url
            .join(SUBMIT_PATH)
            .context("invalid enhance base URL")?;
        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("failed to reach upscale service")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("upscale submit error {}: {}", status, body);
        }
        let payload: SubmitResponse = res.json().await.context("invalid submit response JSON")?;
        Ok(payload.data.id)
    }

    /// Poll the job until completed/failed or the deadline passes. Transient
    /// request errors are retried; a non-success status is terminal.
    async fn poll(&self, job_id: &str) -> Result<String> {
        let url = self
            .base_url
            .join(&format!("predictions/{job_id}/result"))
            .context("invalid enhance base URL")?;
        let started = Instant::now();
        loop {
            if started.elapsed() > self.timeout {
                bail!("upscale job {} timed out after {:?}", job_id, self.timeout);
            }
            match self
                .http
                .get(url.clone())
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send()
                .await
            {
                Ok(res) => {
                    if !res.status().is_success() {
                        let status = res.status();
                        let body = res.text().await.unwrap_or_default();
                        bail!("upscale poll error {}: {}", status, body);
                    }
                    let payload: ResultResponse =
                        res.json().await.context("invalid poll response JSON")?;
                    match payload.data.status.as_str() {
                        "completed" => {
                            return payload.data.outputs.into_iter().next().ok_or_else(|| {
                                anyhow!("upscale job {} completed without outputs", job_id)
                            });
                        }
                        "failed" => bail!(
                            "upscale job {} failed: {}",
                            job_id,
                            payload.data.error.unwrap_or_default()
                        ),
                        // created / processing: keep waiting
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!(?err, job_id, "upscale poll request failed, retrying");
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn download(&self, url: &str, output: &Path) -> Result<()> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("failed to download upscaled image")?;
        if !res.status().is_success() {
            bail!("upscaled image download error {}", res.status());
        }
        let bytes = res.bytes().await.context("failed to read upscaled image")?;
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(output, &bytes)
            .await
            .with_context(|| format!("failed to write upscaled image: {}", output.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Upscaler for UpscaleClient {
    async fn upscale(&self, input: &Path, output: &Path) -> Result<PathBuf> {
        if !self.enabled() {
            bail!("upscale service disabled (no API key)");
        }
        let job_id = self.submit(input).await?;
        info!(job_id = %job_id, image = %input.display(), "upscale job submitted");
        let result_url = self.poll(&job_id).await?;
        self.download(&result_url, output).await?;
        info!(file = %output.display(), "upscaled image downloaded");
        Ok(output.to_path_buf())
    }

    fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    data: SubmitData,
}

#[derive(Deserialize)]
struct SubmitData {
    id: String,
}

#[derive(Deserialize)]
struct ResultResponse {
    data: ResultData,
}

#[derive(Deserialize)]
struct ResultData {
    status: String,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_response_parses_job_id() {
        let payload: SubmitResponse =
            serde_json::from_str(r#"{"data":{"id":"job-123","model":"crisp-upscale"}}"#).unwrap();
        assert_eq!(payload.data.id, "job-123");
    }

    #[test]
    fn result_response_parses_all_statuses() {
        let running: ResultResponse =
            serde_json::from_str(r#"{"data":{"status":"processing"}}"#).unwrap();
        assert_eq!(running.data.status, "processing");
        assert!(running.data.outputs.is_empty());

        let done: ResultResponse = serde_json::from_str(
            r#"{"data":{"status":"completed","outputs":["https://cdn/out.jpg"]}}"#,
        )
        .unwrap();
        assert_eq!(done.data.outputs[0], "https://cdn/out.jpg");

        let failed: ResultResponse =
            serde_json::from_str(r#"{"data":{"status":"failed","error":"bad input"}}"#).unwrap();
        assert_eq!(failed.data.error.as_deref(), Some("bad input"));
    }

    #[test]
    fn disabled_without_api_key() {
        let client = UpscaleClient::with_base_url(
            String::new(),
            Duration::from_secs(120),
            Url::parse("https://api.wavespeed.ai/api/v3/").unwrap(),
        );
        assert!(!client.enabled());

        let client = UpscaleClient::with_base_url(
            "key".into(),
            Duration::from_secs(120),
            Url::parse("https://api.wavespeed.ai/api/v3/").unwrap(),
        );
        assert!(client.enabled());
    }

    #[test]
    fn endpoint_urls_join_under_base() {
        let base = Url::parse("https://api.wavespeed.ai/api/v3/").unwrap();
        assert_eq!(
            base.join(SUBMIT_PATH).unwrap().as_str(),
            "https://api.wavespeed.ai/api/v3/recraft-ai/recraft-crisp-upscale"
        );
        assert_eq!(
            base.join("predictions/job-1/result").unwrap().as_str(),
            "https://api.wavespeed.ai/api/v3/predictions/job-1/result"
        );
    }
}

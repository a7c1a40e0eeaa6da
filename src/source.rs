//! Read-side client for the source platform: fetch recent original posts and
//! download their media files.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::config;
use crate::model::{Item, MediaAsset, MediaKind};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Source platform seam. The production impl talks to the read API; tests
/// substitute recorders that fabricate items and files.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fetch up to `count` recent original posts by `author`, media attached.
    /// Replies and reposts are filtered out.
    async fn fetch_recent(&self, author: &str, count: usize) -> Result<Vec<Item>>;

    /// Download every still-pending media asset of the item into
    /// `data_dir/<item id>/`. Returns the number of files written.
    async fn download_media(&self, item: &mut Item, data_dir: &Path) -> Result<usize>;

    /// False when the client has no credentials and every call would fail.
    fn enabled(&self) -> bool {
        true
    }
}

pub struct ReadApiClient {
    http: Client,
    base_url: Url,
    bearer_token: String,
}

impl ReadApiClient {
    pub fn from_config(cfg: &config::Source) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid source.base_url")?;
        Ok(Self::with_base_url(cfg.bearer_token.clone(), base_url))
    }

    pub fn with_base_url(bearer_token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("repost-agent/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            bearer_token,
        }
    }

    async fn lookup_user_id(&self, author: &str) -> Result<String> {
        let url = self
            .base_url
            .join(&format!("2/users/by/username/{author}"))
            .context("invalid source base URL")?;
        let res = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.bearer_token))
            .send()
            .await
            .context("failed to reach source API")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("user lookup error {}: {}", status, body);
        }
        let payload: UserResponse = res.json().await.context("invalid user lookup response")?;
        payload
            .data
            .map(|d| d.id)
            .ok_or_else(|| anyhow!("source user @{author} not found"))
    }
}

#[async_trait]
impl MediaSource for ReadApiClient {
    async fn fetch_recent(&self, author: &str, count: usize) -> Result<Vec<Item>> {
        let user_id = self.lookup_user_id(author).await?;

        let mut url = self
            .base_url
            .join(&format!("2/users/{user_id}/tweets"))
            .context("invalid source base URL")?;
        url.query_pairs_mut()
            .append_pair("max_results", &page_size(count).to_string())
            .append_pair(
                "tweet.fields",
                "created_at,public_metrics,attachments,referenced_tweets",
            )
            .append_pair("expansions", "attachments.media_keys")
            .append_pair("media.fields", "url,preview_image_url,type,variants");

        let res = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.bearer_token))
            .send()
            .await
            .context("failed to reach source API")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("timeline fetch error {}: {}", status, body);
        }
        let payload: TimelineResponse = res.json().await.context("invalid timeline response")?;

        let items = build_items(author, count, payload);
        info!(author, fetched = items.len(), "fetched recent posts");
        Ok(items)
    }

    async fn download_media(&self, item: &mut Item, data_dir: &Path) -> Result<usize> {
        if item.media.is_empty() {
            return Ok(0);
        }
        let folder = data_dir.join(&item.id);
        fs::create_dir_all(&folder)
            .await
            .with_context(|| format!("failed to create media dir: {}", folder.display()))?;

        let mut written = 0;
        for (idx, asset) in item.media.iter_mut().enumerate() {
            if asset.local_path.is_some() || asset.url.is_empty() {
                continue;
            }
            let target = folder.join(format!("raw_media_{}.{}", idx + 1, asset.kind.file_ext()));
            match fetch_to_file(&self.http, &asset.url, &target).await {
                Ok(()) => {
                    info!(id = %item.id, file = %target.display(), "media downloaded");
                    asset.local_path = Some(target.to_string_lossy().into_owned());
                    written += 1;
                }
                Err(err) => {
                    warn!(id = %item.id, url = %asset.url, ?err, "media download failed");
                }
            }
        }
        Ok(written)
    }

    fn enabled(&self) -> bool {
        !self.bearer_token.is_empty()
    }
}

async fn fetch_to_file(http: &Client, url: &str, target: &Path) -> Result<()> {
    let res = http
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .context("download request failed")?;
    if !res.status().is_success() {
        bail!("download error {}", res.status());
    }
    let bytes = res.bytes().await.context("failed to read download body")?;
    fs::write(target, &bytes)
        .await
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(())
}

/// The timeline endpoint accepts `max_results` of 5..=100.
fn page_size(count: usize) -> usize {
    count.clamp(5, 100)
}

/// Turn a timeline payload into queue items: skip replies and reposts,
/// attach media descriptors, stop at `count`.
fn build_items(author: &str, count: usize, payload: TimelineResponse) -> Vec<Item> {
    let media_index: HashMap<&str, &MediaObject> = payload
        .includes
        .as_ref()
        .map(|inc| {
            inc.media
                .iter()
                .map(|m| (m.media_key.as_str(), m))
                .collect()
        })
        .unwrap_or_default();

    let mut items = Vec::new();
    for post in &payload.data {
        if post.text.starts_with('@') || post.text.starts_with("RT @") {
            continue;
        }
        if post
            .referenced_tweets
            .as_ref()
            .is_some_and(|refs| !refs.is_empty())
        {
            continue;
        }

        let mut item = Item::new(post.id.clone(), author, post.text.clone());
        item.created_at = post.created_at;
        if let Some(metrics) = &post.public_metrics {
            item.likes = metrics.like_count;
            item.reposts = metrics.retweet_count;
        }
        if let Some(attachments) = &post.attachments {
            for key in &attachments.media_keys {
                let Some(media) = media_index.get(key.as_str()) else {
                    continue;
                };
                let Some(kind) = MediaKind::parse(&media.kind) else {
                    warn!(id = %post.id, kind = %media.kind, "unknown media kind, skipping");
                    continue;
                };
                let url = media.best_url().unwrap_or_default();
                item.media.push(MediaAsset::new(key.clone(), kind, url));
            }
        }

        items.push(item);
        if items.len() >= count {
            break;
        }
    }
    items
}

#[derive(Deserialize)]
struct UserResponse {
    data: Option<UserData>,
}

#[derive(Deserialize)]
struct UserData {
    id: String,
}

#[derive(Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    data: Vec<PostObject>,
    includes: Option<Includes>,
}

#[derive(Deserialize)]
struct PostObject {
    id: String,
    text: String,
    created_at: Option<DateTime<Utc>>,
    public_metrics: Option<PublicMetrics>,
    attachments: Option<Attachments>,
    referenced_tweets: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    retweet_count: u64,
}

#[derive(Deserialize)]
struct Attachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Deserialize)]
struct Includes {
    #[serde(default)]
    media: Vec<MediaObject>,
}

#[derive(Deserialize)]
struct MediaObject {
    media_key: String,
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
    preview_image_url: Option<String>,
    #[serde(default)]
    variants: Vec<Variant>,
}

#[derive(Deserialize)]
struct Variant {
    bit_rate: Option<u64>,
    url: String,
}

impl MediaObject {
    /// Photos use the direct URL. Videos and animated images prefer the
    /// highest-bitrate variant, then any variant, then the preview image.
    fn best_url(&self) -> Option<String> {
        if self.kind == "photo" {
            return self.url.clone().or_else(|| self.preview_image_url.clone());
        }
        self.variants
            .iter()
            .filter(|v| v.bit_rate.is_some())
            .max_by_key(|v| v.bit_rate.unwrap_or(0))
            .map(|v| v.url.clone())
            .or_else(|| self.variants.first().map(|v| v.url.clone()))
            .or_else(|| self.preview_image_url.clone())
    }
}

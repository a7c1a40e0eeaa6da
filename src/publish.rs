//! Admission-controlled publisher: rate limits first, then media upload and
//! post creation against the write API.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use rand::Rng;
use reqwest::{multipart, Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config;
use crate::model::{Item, MediaKind};

/// Why an admission check refused to post right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    DailyCapReached { max: u32 },
    OutsideAllowedHours { start: u32, end: u32 },
    CooldownActive { remaining: Duration },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DailyCapReached { max } => write!(f, "daily cap reached ({max})"),
            RejectReason::OutsideAllowedHours { start, end } => {
                write!(f, "outside allowed hours ({start}-{end})")
            }
            RejectReason::CooldownActive { remaining } => {
                write!(f, "cooldown active ({}s remaining)", remaining.as_secs())
            }
        }
    }
}

#[derive(Debug)]
pub enum PublishOutcome {
    Posted { post_id: String },
    Rejected(RejectReason),
}

/// Write API seam. The production impl talks to the platform; tests
/// substitute recorders.
#[async_trait]
pub trait PublishApi: Send + Sync {
    /// Upload one media file, returning the platform's media handle.
    async fn upload_media(&self, path: &Path, kind: MediaKind) -> Result<String>;

    /// Create a post with optional attached media, returning the post id.
    async fn create_post(&self, text: &str, media_ids: &[String]) -> Result<String>;
}

pub struct PublishClient {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl PublishClient {
    pub fn from_config(cfg: &config::Publish) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid publish.base_url")?;
        Ok(Self::with_base_url(cfg.access_token.clone(), base_url))
    }

    pub fn with_base_url(access_token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("repost-agent/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            access_token,
        }
    }
}

#[async_trait]
impl PublishApi for PublishClient {
    async fn upload_media(&self, path: &Path, kind: MediaKind) -> Result<String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid media file name"))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read media: {}", path.display()))?;

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(content_type(path))?;
        let mut form = multipart::Form::new().part("media", part);
        if let Some(category) = kind.upload_category() {
            form = form.text("media_category", category);
        }

        let url = self
            .base_url
            .join("1.1/media/upload.json")
            .context("invalid publish base URL")?;
        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .multipart(form)
            .send()
            .await
            .context("failed to reach media upload endpoint")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("media upload error {}: {}", status, body);
        }
        let payload: MediaUploadResponse =
            res.json().await.context("invalid media upload response")?;
        Ok(payload.media_id_string)
    }

    async fn create_post(&self, text: &str, media_ids: &[String]) -> Result<String> {
        let mut body = json!({ "text": text });
        if !media_ids.is_empty() {
            body["media"] = json!({ "media_ids": media_ids });
        }
        let url = self
            .base_url
            .join("2/tweets")
            .context("invalid publish base URL")?;
        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("failed to reach post endpoint")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("create post error {}: {}", status, body);
        }
        let payload: CreatePostResponse = res.json().await.context("invalid post response")?;
        Ok(payload.data.id)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "mp4" => "video/mp4",
        Some(ext) if ext == "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Wraps a [`PublishApi`] with the posting limits: daily cap, allowed hours,
/// minimum spacing. Counters live here for the process lifetime.
pub struct Publisher {
    api: Box<dyn PublishApi>,
    limits: config::Limits,
    posts_today: u32,
    last_post_at: Option<DateTime<Utc>>,
    counter_date: NaiveDate,
}

impl Publisher {
    pub fn new(api: Box<dyn PublishApi>, limits: config::Limits) -> Self {
        Self {
            api,
            limits,
            posts_today: 0,
            last_post_at: None,
            counter_date: Local::now().date_naive(),
        }
    }

    pub fn limits(&self) -> &config::Limits {
        &self.limits
    }

    pub fn posts_today(&self) -> u32 {
        self.posts_today
    }

    pub fn remaining_today(&self) -> u32 {
        self.limits.max_posts_per_day.saturating_sub(self.posts_today)
    }

    fn roll_daily_counter(&mut self, today: NaiveDate) {
        if today != self.counter_date {
            self.counter_date = today;
            self.posts_today = 0;
        }
    }

    /// Pure admission check against the given instant. Checked in order:
    /// daily cap, allowed hours, cooldown since the last post.
    pub fn check_admission(&self, now: DateTime<Local>) -> Result<(), RejectReason> {
        if self.posts_today >= self.limits.max_posts_per_day {
            return Err(RejectReason::DailyCapReached {
                max: self.limits.max_posts_per_day,
            });
        }
        let hour = now.hour();
        if hour < self.limits.allowed_hours_start || hour >= self.limits.allowed_hours_end {
            return Err(RejectReason::OutsideAllowedHours {
                start: self.limits.allowed_hours_start,
                end: self.limits.allowed_hours_end,
            });
        }
        if let Some(last) = self.last_post_at {
            let elapsed = now.with_timezone(&Utc) - last;
            let min = chrono::Duration::seconds(self.limits.min_delay_seconds as i64);
            if elapsed < min {
                let remaining = (min - elapsed).to_std().unwrap_or_default();
                return Err(RejectReason::CooldownActive { remaining });
            }
        }
        Ok(())
    }

    /// Wait suggested for a rejection: ride out the cooldown plus a small
    /// jitter, otherwise a fresh random inter-post delay.
    pub fn wait_hint(&self, reason: &RejectReason) -> Duration {
        let mut rng = rand::rng();
        match reason {
            RejectReason::CooldownActive { remaining } => {
                *remaining + Duration::from_secs(rng.random_range(60..=300))
            }
            _ => Duration::from_secs(
                rng.random_range(self.limits.min_delay_seconds..=self.limits.max_delay_seconds),
            ),
        }
    }

    /// Random spacing between consecutive posts in one cycle.
    pub fn random_post_delay(&self) -> Duration {
        let mut rng = rand::rng();
        Duration::from_secs(
            rng.random_range(self.limits.min_delay_seconds..=self.limits.max_delay_seconds),
        )
    }

    /// Publish one ready item. With `wait` the call blocks, re-checking
    /// admission after each suggested wait, until a slot opens. Without it a
    /// rejection returns immediately and mutates nothing.
    pub async fn publish_item(&mut self, item: &mut Item, wait: bool) -> Result<PublishOutcome> {
        if !item.ready_to_publish() {
            bail!("item {} is not ready to publish", item.id);
        }

        loop {
            self.roll_daily_counter(Local::now().date_naive());
            match self.check_admission(Local::now()) {
                Ok(()) => break,
                Err(reason) if !wait => {
                    info!(id = %item.id, %reason, "publish rejected");
                    return Ok(PublishOutcome::Rejected(reason));
                }
                Err(reason) => {
                    let pause = self.wait_hint(&reason);
                    info!(id = %item.id, %reason, wait_secs = pause.as_secs(), "publish deferred");
                    tokio::time::sleep(pause).await;
                }
            }
        }

        let mut media_ids = Vec::new();
        for asset in &item.media {
            let Some(path) = asset.upload_path() else {
                continue;
            };
            match self.api.upload_media(Path::new(path), asset.kind).await {
                Ok(media_id) => {
                    info!(id = %item.id, media = path, media_id = %media_id, "media uploaded");
                    media_ids.push(media_id);
                }
                Err(err) => {
                    warn!(id = %item.id, media = path, ?err, "media upload failed, skipping asset");
                }
            }
        }

        let text = item.rewritten_text.as_deref().unwrap_or(&item.original_text);
        let post_id = self.api.create_post(text, &media_ids).await?;

        item.posted = true;
        item.posted_at = Some(Utc::now());
        self.posts_today += 1;
        self.last_post_at = Some(Utc::now());
        info!(id = %item.id, post_id = %post_id, posts_today = self.posts_today, "item published");
        Ok(PublishOutcome::Posted { post_id })
    }
}

#[derive(Deserialize)]
struct MediaUploadResponse {
    media_id_string: String,
}

#[derive(Deserialize)]
struct CreatePostResponse {
    data: CreatePostData,
}

#[derive(Deserialize)]
struct CreatePostData {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct UnusedApi;

    #[async_trait]
    impl PublishApi for UnusedApi {
        async fn upload_media(&self, _path: &Path, _kind: MediaKind) -> Result<String> {
            bail!("not used")
        }
        async fn create_post(&self, _text: &str, _media_ids: &[String]) -> Result<String> {
            bail!("not used")
        }
    }

    fn limits() -> config::Limits {
        config::Limits {
            max_posts_per_day: 5,
            allowed_hours_start: 8,
            allowed_hours_end: 22,
            min_delay_seconds: 3600,
            max_delay_seconds: 10800,
        }
    }

    fn publisher() -> Publisher {
        Publisher::new(Box::new(UnusedApi), limits())
    }

    fn at_hour(hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 6, 15, hour, 30, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn admission_passes_inside_window() {
        let p = publisher();
        assert!(p.check_admission(at_hour(12)).is_ok());
        assert!(p.check_admission(at_hour(8)).is_ok(), "start hour inclusive");
    }

    #[test]
    fn admission_rejects_outside_hours() {
        let p = publisher();
        assert_eq!(
            p.check_admission(at_hour(7)),
            Err(RejectReason::OutsideAllowedHours { start: 8, end: 22 })
        );
        assert_eq!(
            p.check_admission(at_hour(22)),
            Err(RejectReason::OutsideAllowedHours { start: 8, end: 22 }),
            "end hour exclusive"
        );
        assert_eq!(
            p.check_admission(at_hour(23)),
            Err(RejectReason::OutsideAllowedHours { start: 8, end: 22 })
        );
    }

    #[test]
    fn admission_rejects_at_daily_cap() {
        let mut p = publisher();
        p.posts_today = 5;
        assert_eq!(
            p.check_admission(at_hour(12)),
            Err(RejectReason::DailyCapReached { max: 5 })
        );
    }

    #[test]
    fn admission_rejects_during_cooldown() {
        let now = at_hour(12);
        let mut p = publisher();
        p.last_post_at = Some(now.with_timezone(&Utc) - chrono::Duration::seconds(600));

        match p.check_admission(now) {
            Err(RejectReason::CooldownActive { remaining }) => {
                assert_eq!(remaining.as_secs(), 3000);
            }
            other => panic!("expected cooldown, got {other:?}"),
        }

        p.last_post_at = Some(now.with_timezone(&Utc) - chrono::Duration::seconds(3600));
        assert!(p.check_admission(now).is_ok(), "cooldown elapsed");
    }

    #[test]
    fn cap_checked_before_hours() {
        let mut p = publisher();
        p.posts_today = 5;
        assert_eq!(
            p.check_admission(at_hour(3)),
            Err(RejectReason::DailyCapReached { max: 5 })
        );
    }

    #[test]
    fn daily_counter_resets_on_new_date() {
        let mut p = publisher();
        p.posts_today = 5;
        p.roll_daily_counter(p.counter_date);
        assert_eq!(p.posts_today, 5);

        p.roll_daily_counter(p.counter_date.succ_opt().unwrap());
        assert_eq!(p.posts_today, 0);
    }

    #[test]
    fn wait_hint_covers_cooldown_with_jitter() {
        let p = publisher();
        let reason = RejectReason::CooldownActive {
            remaining: Duration::from_secs(1000),
        };
        for _ in 0..20 {
            let hint = p.wait_hint(&reason).as_secs();
            assert!((1060..=1300).contains(&hint), "hint {hint} out of range");
        }
        let reason = RejectReason::OutsideAllowedHours { start: 8, end: 22 };
        for _ in 0..20 {
            let hint = p.wait_hint(&reason).as_secs();
            assert!((3600..=10800).contains(&hint), "hint {hint} out of range");
        }
    }

    #[test]
    fn reject_reason_display_names_the_limit() {
        assert_eq!(
            RejectReason::DailyCapReached { max: 5 }.to_string(),
            "daily cap reached (5)"
        );
        assert_eq!(
            RejectReason::OutsideAllowedHours { start: 8, end: 22 }.to_string(),
            "outside allowed hours (8-22)"
        );
        assert_eq!(
            RejectReason::CooldownActive {
                remaining: Duration::from_secs(90)
            }
            .to_string(),
            "cooldown active (90s remaining)"
        );
    }

    #[test]
    fn upload_response_parses_handle() {
        let payload: MediaUploadResponse = serde_json::from_str(
            r#"{"media_id":710511363345354753,"media_id_string":"710511363345354753"}"#,
        )
        .unwrap();
        assert_eq!(payload.media_id_string, "710511363345354753");

        let payload: CreatePostResponse =
            serde_json::from_str(r#"{"data":{"id":"1445880548472328192","text":"hi"}}"#).unwrap();
        assert_eq!(payload.data.id, "1445880548472328192");
    }

    #[test]
    fn content_type_covers_known_extensions() {
        assert_eq!(content_type(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(content_type(Path::new("a.png")), "image/png");
        assert_eq!(content_type(Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }
}

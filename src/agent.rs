//! Orchestration of the repurposing pipeline: ingest, per-stage processing,
//! randomized publishing, and the daily cycle.
use anyhow::Result;
use rand::Rng;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::enhance::{UpscaleClient, Upscaler};
use crate::model::{Item, MediaKind};
use crate::perturb::PerturbEngine;
use crate::publish::{PublishClient, PublishOutcome, Publisher};
use crate::rewrite::{RewriteClient, Rewriter};
use crate::source::{MediaSource, ReadApiClient};
use crate::store::StateStore;

/// The agent owns the state store, the pipeline clients, and the publisher.
/// All work is sequential; each stage persists before the next item starts.
pub struct Agent {
    store: StateStore,
    source: Box<dyn MediaSource>,
    upscaler: Box<dyn Upscaler>,
    rewriter: Box<dyn Rewriter>,
    publisher: Publisher,
    perturber: PerturbEngine,
    data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub queued: usize,
    pub ready: usize,
    pub pending: usize,
    pub posted: usize,
    pub posts_today: u32,
    pub daily_cap: u32,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue: {} ({} ready, {} pending) | posted: {} | today: {}/{}",
            self.queued, self.ready, self.pending, self.posted, self.posts_today, self.daily_cap
        )
    }
}

impl Agent {
    pub async fn from_config(cfg: &Config) -> Result<Agent> {
        let store = StateStore::open(cfg.state_file());
        let source = Box::new(ReadApiClient::from_config(&cfg.source)?);
        let upscaler = Box::new(UpscaleClient::from_config(&cfg.enhance)?);
        let rewriter = Box::new(RewriteClient::from_config(&cfg.rewrite)?);
        let publisher = Publisher::new(
            Box::new(PublishClient::from_config(&cfg.publish)?),
            cfg.limits.clone(),
        );
        let perturber =
            PerturbEngine::detect(Duration::from_secs(cfg.app.video_timeout_seconds)).await;
        Ok(Self::new(
            store,
            source,
            upscaler,
            rewriter,
            publisher,
            perturber,
            PathBuf::from(&cfg.app.data_dir),
        ))
    }

    pub fn new(
        store: StateStore,
        source: Box<dyn MediaSource>,
        upscaler: Box<dyn Upscaler>,
        rewriter: Box<dyn Rewriter>,
        publisher: Publisher,
        perturber: PerturbEngine,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            source,
            upscaler,
            rewriter,
            publisher,
            perturber,
            data_dir,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn status(&self) -> Status {
        let queued = self.store.queue().len();
        let ready = self.store.ready_count();
        Status {
            queued,
            ready,
            pending: queued - ready,
            posted: self.store.posted().len(),
            posts_today: self.publisher.posts_today(),
            daily_cap: self.publisher.limits().max_posts_per_day,
        }
    }

    /// Fetch recent posts by `author`, download their media, and enqueue the
    /// ones not seen before. Returns how many items were added.
    pub async fn ingest_from_source(
        &mut self,
        author: &str,
        count: usize,
        media_only: bool,
    ) -> Result<usize> {
        let mut fetched = self.source.fetch_recent(author, count).await?;
        if media_only {
            fetched.retain(|item| item.has_media());
        }

        let mut added = 0;
        for mut item in fetched {
            if self.store.contains(&item.id) {
                debug!(id = %item.id, "already known, skipping");
                continue;
            }
            self.download_stage(&mut item).await;
            self.store.enqueue(item);
            added += 1;
        }
        self.store.save()?;
        info!(author, added, "ingest complete");
        Ok(added)
    }

    /// Run every not-yet-ready queue item through the pipeline stages,
    /// persisting after each item.
    pub async fn process_all(&mut self) -> Result<()> {
        let pending: Vec<String> = self
            .store
            .queue()
            .iter()
            .filter(|i| !i.ready_to_publish())
            .map(|i| i.id.clone())
            .collect();
        info!(pending = pending.len(), "processing queue");

        for id in pending {
            let Some(pos) = self.store.queue().iter().position(|i| i.id == id) else {
                continue;
            };
            let mut item = self.store.queue()[pos].clone();
            self.process_item(&mut item).await;
            if let Some(slot) = self.store.queue_mut().iter_mut().find(|i| i.id == id) {
                *slot = item;
            }
            self.store.save()?;
        }
        self.store.save()?;
        Ok(())
    }

    async fn process_item(&mut self, item: &mut Item) {
        info!(id = %item.id, "processing item");
        self.download_stage(item).await;
        self.enhance_stage(item).await;
        self.rewrite_stage(item).await;
    }

    async fn download_stage(&mut self, item: &mut Item) {
        if item.downloaded {
            return;
        }
        if !item.has_media() {
            item.downloaded = true;
            return;
        }
        match self.source.download_media(item, &self.data_dir).await {
            Ok(written) => debug!(id = %item.id, written, "download stage complete"),
            Err(err) => warn!(id = %item.id, ?err, "download stage failed"),
        }
        item.downloaded = true;
    }

    /// Photos run through the optional remote upscale and then perturbation.
    /// Videos run through perturbation only. Every failure falls back to the
    /// previous good file, so the stage always leaves something uploadable.
    async fn enhance_stage(&mut self, item: &mut Item) {
        if item.enhanced {
            return;
        }
        if !item.has_media() {
            item.enhanced = true;
            return;
        }

        for asset in &mut item.media {
            if asset.enhanced_path.is_some() {
                continue;
            }
            let Some(local) = asset.local_path.clone() else {
                continue;
            };
            let local = PathBuf::from(local);

            match asset.kind {
                MediaKind::Photo => {
                    let upscaled = if self.upscaler.enabled() {
                        let target = upscaled_output(&local);
                        or_original(
                            self.upscaler.upscale(&local, &target).await,
                            local.clone(),
                            "upscale",
                        )
                    } else {
                        debug!(id = %item.id, "upscale disabled, perturbation only");
                        local.clone()
                    };
                    let target = PerturbEngine::unique_output(&upscaled, "jpg");
                    let finished = or_original(
                        self.perturber.perturb_image(&upscaled, &target),
                        upscaled.clone(),
                        "image perturbation",
                    );
                    asset.enhanced_path = Some(finished.to_string_lossy().into_owned());
                }
                MediaKind::Video => {
                    let target = PerturbEngine::unique_output(&local, "mp4");
                    let finished = or_original(
                        self.perturber.perturb_video(&local, &target).await,
                        local.clone(),
                        "video perturbation",
                    );
                    asset.enhanced_path = Some(finished.to_string_lossy().into_owned());
                }
                MediaKind::AnimatedGif => {
                    debug!(id = %item.id, "animated image kept as-is");
                }
            }
        }
        item.enhanced = true;
    }

    async fn rewrite_stage(&mut self, item: &mut Item) {
        if item.rewritten && item.rewritten_text.is_some() {
            return;
        }
        let rewritten = if self.rewriter.enabled() {
            or_original(
                self.rewriter.rewrite(&item.original_text).await,
                item.original_text.clone(),
                "rewrite",
            )
        } else {
            debug!(id = %item.id, "rewrite disabled, keeping original text");
            item.original_text.clone()
        };
        item.rewritten_text = Some(rewritten);
        item.rewritten = true;
    }

    /// Publish one randomly chosen ready item. On success the item moves to
    /// the posted archive; on rejection or failure it stays queued untouched.
    pub async fn publish_one_random(&mut self, wait: bool) -> Result<bool> {
        let ready_ids: Vec<String> = self
            .store
            .queue()
            .iter()
            .filter(|i| i.ready_to_publish() && !i.posted)
            .map(|i| i.id.clone())
            .collect();
        if ready_ids.is_empty() {
            info!("no items ready to publish");
            return Ok(false);
        }
        let pick = {
            let mut rng = rand::rng();
            ready_ids[rng.random_range(0..ready_ids.len())].clone()
        };

        let Some(pos) = self.store.queue().iter().position(|i| i.id == pick) else {
            return Ok(false);
        };
        let mut item = self.store.queue()[pos].clone();

        match self.publisher.publish_item(&mut item, wait).await {
            Ok(PublishOutcome::Posted { post_id }) => {
                if let Some(slot) = self.store.queue_mut().iter_mut().find(|i| i.id == pick) {
                    *slot = item;
                }
                self.store.move_to_posted(&pick);
                self.store.save()?;
                info!(id = %pick, post_id = %post_id, "published and archived");
                Ok(true)
            }
            Ok(PublishOutcome::Rejected(_)) => Ok(false),
            Err(err) => {
                warn!(id = %pick, ?err, "publish failed, item stays queued");
                Ok(false)
            }
        }
    }

    /// One full cycle: top up the queue when it runs low, process everything,
    /// then publish `posts` items spaced by random delays.
    pub async fn run_cycle(
        &mut self,
        authors: &[String],
        per_account: usize,
        posts: u32,
    ) -> Result<()> {
        info!(queue = self.store.queue().len(), "starting cycle");

        if self.store.queue().len() < posts as usize * 2 {
            for author in authors {
                if let Err(err) = self.ingest_from_source(author, per_account, true).await {
                    warn!(author = %author, ?err, "ingest failed");
                }
            }
        }

        self.process_all().await?;

        for i in 0..posts {
            info!(slot = i + 1, of = posts, "cycle publish slot");
            let published = self.publish_one_random(true).await?;
            if published && i + 1 < posts {
                let delay = self.publisher.random_post_delay();
                info!(minutes = delay.as_secs() / 60, "sleeping before next post");
                tokio::time::sleep(delay).await;
            }
        }

        self.store.save()?;
        info!("cycle complete");
        Ok(())
    }
}

/// Fallback combinator for the enhancement and rewrite boundaries: on error,
/// log and keep the previous good value.
fn or_original<T, E: fmt::Display>(result: Result<T, E>, original: T, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "{} failed, keeping original", what);
            original
        }
    }
}

fn upscaled_output(input: &Path) -> PathBuf {
    match input.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => input.with_file_name(format!("{stem}_upscaled.jpg")),
        None => input.with_extension("upscaled.jpg"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn or_original_keeps_value_on_success() {
        let out = or_original(Ok::<_, anyhow::Error>("new".to_string()), "old".into(), "op");
        assert_eq!(out, "new");
    }

    #[test]
    fn or_original_falls_back_on_error() {
        let out = or_original(
            Err::<String, _>(anyhow::anyhow!("boom")),
            "old".to_string(),
            "op",
        );
        assert_eq!(out, "old");
    }

    #[test]
    fn upscaled_output_is_a_sibling_jpeg() {
        assert_eq!(
            upscaled_output(Path::new("data/1/raw_media_1.jpg")),
            Path::new("data/1/raw_media_1_upscaled.jpg")
        );
        assert_eq!(
            upscaled_output(Path::new("data/1/raw_media_2.png")),
            Path::new("data/1/raw_media_2_upscaled.jpg")
        );
    }

    #[test]
    fn status_display_is_compact() {
        let status = Status {
            queued: 4,
            ready: 1,
            pending: 3,
            posted: 9,
            posts_today: 2,
            daily_cap: 5,
        };
        assert_eq!(
            status.to_string(),
            "queue: 4 (1 ready, 3 pending) | posted: 9 | today: 2/5"
        );
    }
}

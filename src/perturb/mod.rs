//! Media perturbation: small random visual adjustments that change a file's
//! bytes and perceptual hash without visibly degrading the content.
mod image;
mod video;

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PerturbError {
    #[error("media file not found: {0}")]
    NotFound(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] ::image::ImageError),
    #[error("ffprobe failed: {0}")]
    Probe(String),
    #[error("ffmpeg failed: {0}")]
    Encode(String),
    #[error("video processing timed out after {0:?}")]
    Timeout(Duration),
}

/// Applies randomized perturbation plans to images and videos. Holds its own
/// RNG so a fixed seed reproduces the exact same plan sequence.
pub struct PerturbEngine {
    rng: StdRng,
    ffmpeg_available: bool,
    video_timeout: Duration,
}

impl PerturbEngine {
    /// Production constructor: OS-seeded RNG, probes for ffmpeg once.
    pub async fn detect(video_timeout: Duration) -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            ffmpeg_available: probe_ffmpeg().await,
            video_timeout,
        }
    }

    /// Deterministic engine for tests. Skips the ffmpeg probe, so videos pass
    /// through unperturbed.
    pub fn with_seed(seed: u64, video_timeout: Duration) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ffmpeg_available: false,
            video_timeout,
        }
    }

    pub fn ffmpeg_available(&self) -> bool {
        self.ffmpeg_available
    }

    /// Output path convention for perturbed files: `<stem>_unique.<ext>`
    /// next to the input.
    pub fn unique_output(input: &Path, ext: &str) -> PathBuf {
        match input.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => input.with_file_name(format!("{stem}_unique.{ext}")),
            None => input.with_extension(format!("unique.{ext}")),
        }
    }

    /// Perturb a still image and write it as JPEG to `output`.
    pub fn perturb_image(&mut self, input: &Path, output: &Path) -> Result<PathBuf, PerturbError> {
        image::make_unique(&mut self.rng, input, output)
    }

    /// Perturb a video via ffmpeg. Without ffmpeg this is a pass-through
    /// returning the input path unchanged.
    pub async fn perturb_video(
        &mut self,
        input: &Path,
        output: &Path,
    ) -> Result<PathBuf, PerturbError> {
        if !self.ffmpeg_available {
            warn!(video = %input.display(), "ffmpeg unavailable, keeping original video");
            return Ok(input.to_path_buf());
        }
        video::make_unique(&mut self.rng, input, output, self.video_timeout).await
    }
}

async fn probe_ffmpeg() -> bool {
    let status = Command::new("ffmpeg")
        .arg("-version")
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(s) if s.success() => {
            info!("ffmpeg detected");
            true
        }
        _ => {
            warn!("ffmpeg not found, videos will pass through unperturbed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_output_keeps_directory_and_stem() {
        let out = PerturbEngine::unique_output(Path::new("data/42/raw_media_1.png"), "jpg");
        assert_eq!(out, Path::new("data/42/raw_media_1_unique.jpg"));

        let out = PerturbEngine::unique_output(Path::new("clip.mp4"), "mp4");
        assert_eq!(out, Path::new("clip_unique.mp4"));
    }

    #[tokio::test]
    async fn seeded_engine_passes_videos_through() {
        let mut engine = PerturbEngine::with_seed(1, Duration::from_secs(300));
        let input = Path::new("does/not/matter.mp4");
        let out = engine
            .perturb_video(input, Path::new("does/not/matter_unique.mp4"))
            .await
            .unwrap();
        assert_eq!(out, input);
    }
}

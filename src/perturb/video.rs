use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use super::PerturbError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Randomized adjustments for one video re-encode.
struct Plan {
    /// Additive luma shift, ffmpeg `eq` semantics.
    brightness: f32,
    contrast: f32,
    saturation: f32,
    /// Hue rotation in degrees.
    hue: f32,
    /// Pixels trimmed per edge, always even for the encoder.
    crop_px: u32,
    noise: Option<u8>,
    crf: u8,
    audio_bitrate: &'static str,
    comment_tag: u32,
    creation_time: String,
}

impl Plan {
    fn draw(rng: &mut StdRng, now: DateTime<Local>) -> Self {
        Self {
            brightness: rng.random_range(-0.03..=0.03),
            contrast: rng.random_range(0.97..=1.03),
            saturation: rng.random_range(0.98..=1.02),
            hue: rng.random_range(-1.0..=1.0),
            crop_px: rng.random_range(1..=3) * 2,
            noise: rng.random_bool(0.5).then(|| rng.random_range(1..=3)),
            crf: rng.random_range(18..=23),
            audio_bitrate: ["128k", "160k", "192k"][rng.random_range(0..3)],
            comment_tag: rng.random_range(10000..=99999),
            creation_time: random_creation_time(rng, now),
        }
    }

    /// Build the `-vf` chain. Crop and scale-back are skipped for frames
    /// 100 px or smaller on either side, the same floor the still-image
    /// path uses.
    fn filter_chain(&self, width: u32, height: u32) -> String {
        let mut filters = Vec::new();
        if width > 100 && height > 100 {
            let cw = even(width - self.crop_px * 2);
            let ch = even(height - self.crop_px * 2);
            filters.push(format!("crop={}:{}:{}:{}", cw, ch, self.crop_px, self.crop_px));
            filters.push(format!(
                "scale={}:{}:flags=lanczos",
                even(width),
                even(height)
            ));
        }
        filters.push(format!(
            "eq=brightness={:.3}:contrast={:.3}:saturation={:.3}",
            self.brightness, self.contrast, self.saturation
        ));
        filters.push(format!("hue=h={:.2}", self.hue));
        if let Some(strength) = self.noise {
            filters.push(format!("noise=alls={strength}:allf=t"));
        }
        filters.join(",")
    }

    fn describe(&self) -> String {
        let mut parts = vec![
            format!("bright:{:.3}", self.brightness),
            format!("contr:{:.3}", self.contrast),
            format!("sat:{:.3}", self.saturation),
            format!("hue:{:.2}", self.hue),
            format!("crop:{}px", self.crop_px),
        ];
        if let Some(strength) = self.noise {
            parts.push(format!("noise:{strength}"));
        }
        parts.push(format!("crf:{}", self.crf));
        parts.push(format!("audio:{}", self.audio_bitrate));
        parts.join(" | ")
    }
}

fn even(v: u32) -> u32 {
    v - v % 2
}

/// Timestamp for the rewritten `creation_time` metadata: a random moment in
/// daytime hours within the last 30 days.
fn random_creation_time(rng: &mut StdRng, now: DateTime<Local>) -> String {
    let days_ago = rng.random_range(1..=30);
    let date = now - chrono::Duration::days(days_ago);
    let ts = date
        .date_naive()
        .and_hms_opt(
            rng.random_range(6..=22),
            rng.random_range(0..60),
            rng.random_range(0..60),
        )
        .unwrap_or_else(|| date.naive_local());
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Re-encode `input` with a freshly drawn plan. Writes to a temp file and
/// renames into place so a killed encode never leaves a partial output.
pub(super) async fn make_unique(
    rng: &mut StdRng,
    input: &Path,
    output: &Path,
    limit: Duration,
) -> Result<PathBuf, PerturbError> {
    if !input.exists() {
        return Err(PerturbError::NotFound(input.to_path_buf()));
    }

    let (width, height, duration) = probe_dimensions(input).await;
    let plan = Plan::draw(rng, Local::now());
    let filter = plan.filter_chain(width, height);
    info!(width, height, duration, changes = %plan.describe(), "video perturbation");

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let temp = temp_path(output);

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(input.as_os_str())
        .arg("-vf")
        .arg(&filter)
        .args(["-c:v", "libx264", "-preset", "medium", "-crf"])
        .arg(plan.crf.to_string())
        .args(["-c:a", "aac", "-b:a"])
        .arg(plan.audio_bitrate)
        .arg("-metadata")
        .arg(format!("comment=processed_{}", plan.comment_tag))
        .arg("-metadata")
        .arg(format!("creation_time={}", plan.creation_time))
        .args(["-movflags", "+faststart"])
        .arg(temp.as_os_str())
        .kill_on_drop(true);

    let run = match timeout(limit, cmd.output()).await {
        Ok(res) => res?,
        Err(_) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(PerturbError::Timeout(limit));
        }
    };
    if !run.status.success() {
        let _ = tokio::fs::remove_file(&temp).await;
        let stderr: String = String::from_utf8_lossy(&run.stderr)
            .chars()
            .take(200)
            .collect();
        return Err(PerturbError::Encode(stderr));
    }

    tokio::fs::rename(&temp, output).await?;
    let size = tokio::fs::metadata(output).await?.len();
    if size == 0 {
        return Err(PerturbError::Encode("empty output file".into()));
    }
    info!(file = %output.display(), size, "video perturbed");
    Ok(output.to_path_buf())
}

fn temp_path(output: &Path) -> PathBuf {
    let mut os = output.as_os_str().to_owned();
    os.push(".tmp.mp4");
    PathBuf::from(os)
}

/// Probe width, height, and duration of the primary video stream. Falls back
/// to 1920x1080 / 60s when ffprobe fails, so a perturbation attempt can
/// still be made.
async fn probe_dimensions(input: &Path) -> (u32, u32, f64) {
    match try_probe(input).await {
        Ok(info) => info,
        Err(err) => {
            warn!(?err, video = %input.display(), "ffprobe failed, assuming 1920x1080");
            (1920, 1080, 60.0)
        }
    }
}

async fn try_probe(input: &Path) -> Result<(u32, u32, f64), PerturbError> {
    let mut cmd = Command::new("ffprobe");
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height,duration",
        "-of",
        "csv=p=0",
    ])
    .arg(input.as_os_str())
    .kill_on_drop(true);

    let output = timeout(PROBE_TIMEOUT, cmd.output())
        .await
        .map_err(|_| PerturbError::Probe("ffprobe timed out".into()))??;
    if !output.status.success() {
        return Err(PerturbError::Probe(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut parts = stdout.trim().split(',');
    let width = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1920);
    let height = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1080);
    let duration = parts.next().and_then(|s| s.parse().ok()).unwrap_or(60.0);
    Ok((width, height, duration))
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of media attached to an item. Serialized with the source platform's
/// wire names (`photo`, `video`, `animated_gif`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    AnimatedGif,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::AnimatedGif => "animated_gif",
        }
    }

    /// File extension used when the asset is downloaded to local storage.
    pub fn file_ext(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
            MediaKind::AnimatedGif => "gif",
        }
    }

    /// Upload category required by the publish API for non-photo media.
    pub fn upload_category(&self) -> Option<&'static str> {
        match self {
            MediaKind::Photo => None,
            MediaKind::Video => Some("tweet_video"),
            MediaKind::AnimatedGif => Some("tweet_gif"),
        }
    }

    pub fn parse(s: &str) -> Option<MediaKind> {
        match s {
            "photo" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            "animated_gif" => Some(MediaKind::AnimatedGif),
            _ => None,
        }
    }
}

/// One media file attached to an item. Exclusively owned by its parent item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Stable key, unique within the parent item.
    pub key: String,
    pub kind: MediaKind,
    /// Source URL the asset is downloaded from.
    pub url: String,
    /// Local path once downloaded, None before.
    #[serde(default)]
    pub local_path: Option<String>,
    /// Path of the perturbed/enhanced output, None until processed.
    #[serde(default)]
    pub enhanced_path: Option<String>,
}

impl MediaAsset {
    pub fn new(key: impl Into<String>, kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            url: url.into(),
            local_path: None,
            enhanced_path: None,
        }
    }

    /// Path to upload: the perturbed/enhanced output when present, otherwise
    /// the raw download.
    pub fn upload_path(&self) -> Option<&str> {
        self.enhanced_path.as_deref().or(self.local_path.as_deref())
    }
}

/// One repurposable post: original text plus media, with per-stage progress
/// flags. Mutated in place by the pipeline, moved to the posted archive on a
/// successful publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Opaque id assigned by the source platform; unique across queue+archive.
    pub id: String,
    pub author: String,
    pub original_text: String,
    #[serde(default)]
    pub rewritten_text: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaAsset>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub reposts: u64,

    // Stage progress flags. Each stage checks its own flag before doing work.
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub enhanced: bool,
    #[serde(default)]
    pub rewritten: bool,
    #[serde(default)]
    pub posted: bool,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(id: impl Into<String>, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            original_text: text.into(),
            rewritten_text: None,
            media: Vec::new(),
            created_at: None,
            likes: 0,
            reposts: 0,
            downloaded: false,
            enhanced: false,
            rewritten: false,
            posted: false,
            posted_at: None,
        }
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    pub fn has_photos(&self) -> bool {
        self.media.iter().any(|m| m.kind == MediaKind::Photo)
    }

    pub fn has_videos(&self) -> bool {
        self.media.iter().any(|m| m.kind == MediaKind::Video)
    }

    /// Readiness gate: text has been rewritten and, when media is present,
    /// the enhance/perturb stage has run. Rewrite and enhancement are
    /// independent branches; neither orders before the other.
    pub fn ready_to_publish(&self) -> bool {
        if self.rewritten_text.is_none() {
            return false;
        }
        if self.has_media() && !self.enhanced {
            return false;
        }
        true
    }
}

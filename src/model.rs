//! Artifact data model: source pages, generated images and generated videos.
//!
//! Every artifact is addressed by a typed key that round-trips through the
//! exact strings the rest of the system (store records, progress map, file
//! names, CLI) uses:
//!
//! | Type | Strings |
//! |------|---------|
//! | [`PageKey`]  | `Cover Page`, `<n>-left`, `<n>-right` |
//! | [`ImageKey`] | `cover`, `spread-<n>` |
//! | [`VideoKey`] | `opening`, `spread-<n>-<n+1>` |

use crate::error::FlipbookError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

static PAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-(left|right)$").expect("valid regex"));
static SPREAD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^spread-(\d+)$").expect("valid regex"));
static FLIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^spread-(\d+)-(\d+)$").expect("valid regex"));

// ── Keys ─────────────────────────────────────────────────────────────────

/// Name of an extracted source page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PageKey {
    Cover,
    Left(u32),
    Right(u32),
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKey::Cover => f.write_str("Cover Page"),
            PageKey::Left(n) => write!(f, "{n}-left"),
            PageKey::Right(n) => write!(f, "{n}-right"),
        }
    }
}

impl FromStr for PageKey {
    type Err = FlipbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "Cover Page" {
            return Ok(PageKey::Cover);
        }
        let caps = PAGE_RE.captures(s).ok_or_else(|| FlipbookError::InvalidKey {
            key: s.to_string(),
        })?;
        let n = parse_index(s, &caps[1])?;
        Ok(if &caps[2] == "left" {
            PageKey::Left(n)
        } else {
            PageKey::Right(n)
        })
    }
}

impl TryFrom<String> for PageKey {
    type Error = FlipbookError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PageKey> for String {
    fn from(k: PageKey) -> Self {
        k.to_string()
    }
}

/// Key of a generated image.
///
/// `Cover` sorts before every spread, and spreads sort numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageKey {
    Cover,
    Spread(u32),
}

impl ImageKey {
    /// File name used when the image is auto-downloaded.
    pub fn filename(&self) -> String {
        match self {
            ImageKey::Cover => "cover.jpg".to_string(),
            ImageKey::Spread(n) => format!("{n}-spread.jpg"),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKey::Cover => f.write_str("cover"),
            ImageKey::Spread(n) => write!(f, "spread-{n}"),
        }
    }
}

impl FromStr for ImageKey {
    type Err = FlipbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "cover" {
            return Ok(ImageKey::Cover);
        }
        let caps = SPREAD_RE.captures(s).ok_or_else(|| FlipbookError::InvalidKey {
            key: s.to_string(),
        })?;
        Ok(ImageKey::Spread(parse_index(s, &caps[1])?))
    }
}

impl TryFrom<String> for ImageKey {
    type Error = FlipbookError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ImageKey> for String {
    fn from(k: ImageKey) -> Self {
        k.to_string()
    }
}

/// Key of a generated video.
///
/// `Flip(n)` is the transition from spread `n` to spread `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VideoKey {
    Opening,
    Flip(u32),
}

impl VideoKey {
    /// The two images this video animates between, as (first, last) frame.
    pub fn frames(&self) -> (ImageKey, ImageKey) {
        match self {
            VideoKey::Opening => (ImageKey::Cover, ImageKey::Spread(1)),
            VideoKey::Flip(n) => (ImageKey::Spread(*n), ImageKey::Spread(n.saturating_add(1))),
        }
    }

    pub fn filename(&self) -> String {
        format!("{self}.mp4")
    }
}

impl fmt::Display for VideoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoKey::Opening => f.write_str("opening"),
            VideoKey::Flip(n) => write!(f, "spread-{}-{}", n, n.saturating_add(1)),
        }
    }
}

impl FromStr for VideoKey {
    type Err = FlipbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "opening" {
            return Ok(VideoKey::Opening);
        }
        let invalid = || FlipbookError::InvalidKey { key: s.to_string() };
        let caps = FLIP_RE.captures(s).ok_or_else(invalid)?;
        let start = parse_index(s, &caps[1])?;
        let end = parse_index(s, &caps[2])?;
        // Flips only ever join consecutive spreads.
        if start.checked_add(1) != Some(end) {
            return Err(invalid());
        }
        Ok(VideoKey::Flip(start))
    }
}

impl TryFrom<String> for VideoKey {
    type Error = FlipbookError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VideoKey> for String {
    fn from(k: VideoKey) -> Self {
        k.to_string()
    }
}

/// Any regenerable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    Image(ImageKey),
    Video(VideoKey),
}

impl ArtifactKey {
    pub fn filename(&self) -> String {
        match self {
            ArtifactKey::Image(k) => k.filename(),
            ArtifactKey::Video(k) => k.filename(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKey::Image(k) => k.fmt(f),
            ArtifactKey::Video(k) => k.fmt(f),
        }
    }
}

impl FromStr for ArtifactKey {
    type Err = FlipbookError;

    /// `spread-<n>` is an image, `spread-<n>-<n+1>` a video.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(k) = s.parse::<ImageKey>() {
            return Ok(ArtifactKey::Image(k));
        }
        s.parse::<VideoKey>().map(ArtifactKey::Video)
    }
}

fn parse_index(key: &str, digits: &str) -> Result<u32, FlipbookError> {
    match digits.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(FlipbookError::InvalidKey {
            key: key.to_string(),
        }),
    }
}

// ── Source pages ─────────────────────────────────────────────────────────

/// One rasterised page of the uploaded PDF.
///
/// Owned by the upload pipeline; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePage {
    pub key: PageKey,
    /// JPEG bytes, base64 in the serialised record.
    #[serde(with = "base64_bytes")]
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f32,
}

impl SourcePage {
    pub const MIME_TYPE: &'static str = "image/jpeg";
}

/// The full set of extracted pages, keyed by [`PageKey`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePages(pub BTreeMap<PageKey, SourcePage>);

impl SourcePages {
    /// Name pages in reading order: the first is the cover, the rest pair up
    /// as left/right of spreads 1, 2, …
    pub fn from_ordered(pages: Vec<(Vec<u8>, u32, u32)>) -> Self {
        let mut map = BTreeMap::new();
        for (idx, (image_bytes, width, height)) in pages.into_iter().enumerate() {
            let key = match idx {
                0 => PageKey::Cover,
                i => {
                    let spread = ((i - 1) / 2 + 1) as u32;
                    if i % 2 == 1 {
                        PageKey::Left(spread)
                    } else {
                        PageKey::Right(spread)
                    }
                }
            };
            let aspect_ratio = if height == 0 {
                0.0
            } else {
                width as f32 / height as f32
            };
            map.insert(
                key,
                SourcePage {
                    key,
                    image_bytes,
                    width,
                    height,
                    aspect_ratio,
                },
            );
        }
        Self(map)
    }

    /// Number of spreads the image run will produce: `floor((pages - 1) / 2)`.
    pub fn spread_count(&self) -> u32 {
        (self.0.len().saturating_sub(1) / 2) as u32
    }

    pub fn get(&self, key: PageKey) -> Option<&SourcePage> {
        self.0.get(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Generated artifacts ──────────────────────────────────────────────────

/// A generated book render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub key: ImageKey,
    /// Data URI or remote URL.
    pub url: String,
    pub generated_at: DateTime<Utc>,
    pub downloaded: bool,
}

/// A generated transition clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedVideo {
    pub key: VideoKey,
    pub url: String,
    pub filename: String,
    /// Clip length in seconds.
    pub duration: u32,
    pub start_frame: ImageKey,
    pub end_frame: ImageKey,
    pub prediction_id: String,
    pub generated_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// All generated images, one record per key.
pub type ImageSet = BTreeMap<ImageKey, GeneratedImage>;

/// All generated videos, one record per key.
pub type VideoSet = BTreeMap<VideoKey, GeneratedVideo>;

/// Highest spread index present in an image set (0 when there are none).
pub fn highest_spread(images: &ImageSet) -> u32 {
    images
        .keys()
        .filter_map(|k| match k {
            ImageKey::Spread(n) => Some(*n),
            ImageKey::Cover => None,
        })
        .max()
        .unwrap_or(0)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

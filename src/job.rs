#![forbid(unsafe_code)]

//! Turns a URL plus user options into a [`JobDescriptor`]: the fully resolved
//! request handed to the download engine. All validation happens here, before
//! anything touches the network.

use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ARCHIVE_FILE: &str = "download-archive.txt";
pub const DEFAULT_OUTPUT_DIR: &str = "downloads";
/// Uploader and upload date keep same-titled videos from colliding; the id
/// keeps re-uploads apart.
pub const DEFAULT_OUTPUT_TEMPLATE: &str =
    "%(uploader)s/%(upload_date>%Y-%m-%d)s/%(title)s [%(id)s].%(ext)s";
pub const DEFAULT_RETRIES: u32 = 10;
pub const DEFAULT_FRAGMENT_RETRIES: u32 = 10;

const COOKIE_BROWSERS: &[&str] = &[
    "brave", "chrome", "chromium", "edge", "firefox", "opera", "safari", "vivaldi", "whale",
];

/// Requested quality: an engine alias or an upper bound on the video height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    Worst,
    MaxHeight(u32),
}

impl FromStr for Quality {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "best" => Ok(Self::Best),
            "worst" => Ok(Self::Worst),
            _ => {
                let height = value
                    .strip_suffix('p')
                    .and_then(|digits| digits.parse::<u32>().ok())
                    .ok_or_else(|| {
                        JobError::validation(
                            "quality",
                            format!("expected best, worst or a height like 720p, got {value:?}"),
                        )
                    })?;
                if height == 0 {
                    return Err(JobError::validation("quality", "height must be positive"));
                }
                Ok(Self::MaxHeight(height))
            }
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::Worst => f.write_str("worst"),
            Self::MaxHeight(height) => write!(f, "{height}p"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Mp3,
    M4a,
    Opus,
    Wav,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Opus => "opus",
            Self::Wav => "wav",
        }
    }

    fn supports_cover_art(self) -> bool {
        !matches!(self, Self::Wav)
    }
}

impl FromStr for AudioCodec {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "m4a" => Ok(Self::M4a),
            "opus" => Ok(Self::Opus),
            "wav" => Ok(Self::Wav),
            other => Err(JobError::validation(
                "audio format",
                format!("unsupported codec {other:?} (expected mp3, m4a, opus or wav)"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    #[default]
    Mp4,
    Webm,
    Mkv,
}

impl VideoContainer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
        }
    }

    /// Audio stream extension that muxes cleanly into this container, when
    /// sites actually serve streams in it.
    fn native_audio_ext(self) -> Option<&'static str> {
        match self {
            Self::Mp4 => Some("m4a"),
            Self::Webm => Some("webm"),
            Self::Mkv => None,
        }
    }
}

impl FromStr for VideoContainer {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "mkv" => Ok(Self::Mkv),
            other => Err(JobError::validation(
                "video format",
                format!("unsupported container {other:?} (expected mp4, webm or mkv)"),
            )),
        }
    }
}

/// Engine-side transformation applied after the raw streams are fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessStep {
    SponsorBlockRemove(Vec<String>),
    ExtractAudio(AudioCodec),
    WriteSubtitles(Vec<String>),
    EmbedSubtitles,
    WriteThumbnail,
    EmbedThumbnail,
    WriteMetadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkPolicy {
    pub proxy_url: Option<String>,
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub concurrent_fragments: Option<u32>,
    pub cookie_source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_fragment_retries: u32,
    pub skip_unavailable_fragments: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            max_fragment_retries: DEFAULT_FRAGMENT_RETRIES,
            skip_unavailable_fragments: true,
        }
    }
}

/// User-facing options shared by every URL of a run.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub output_dir: PathBuf,
    pub quality: Quality,
    pub media_kind: MediaKind,
    pub audio_codec: AudioCodec,
    pub container: VideoContainer,
    pub write_subtitles: bool,
    pub embed_subtitles: bool,
    pub subtitle_langs: Vec<String>,
    pub write_thumbnail: bool,
    pub embed_thumbnail: bool,
    pub sponsorblock_remove: Vec<String>,
    pub output_template: Option<String>,
    pub archive_path: Option<PathBuf>,
    /// Raw rate string as typed by the user, e.g. `4.2M`.
    pub rate_limit: Option<String>,
    pub proxy: Option<String>,
    pub concurrent_fragments: Option<u32>,
    pub cookies_from_browser: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            quality: Quality::Best,
            media_kind: MediaKind::Video,
            audio_codec: AudioCodec::Mp3,
            container: VideoContainer::Mp4,
            write_subtitles: false,
            embed_subtitles: false,
            subtitle_langs: vec!["en".to_string()],
            write_thumbnail: false,
            embed_thumbnail: false,
            sponsorblock_remove: Vec::new(),
            output_template: None,
            archive_path: None,
            rate_limit: None,
            proxy: None,
            concurrent_fragments: None,
            cookies_from_browser: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadOptions {
    /// Where the ledger lives: explicit absolute paths win, relative ones
    /// are anchored in the output directory.
    pub fn resolved_archive_path(&self) -> PathBuf {
        match &self.archive_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.output_dir.join(path),
            None => self.output_dir.join(ARCHIVE_FILE),
        }
    }

    pub fn resolved_output_template(&self) -> String {
        let template = self
            .output_template
            .as_deref()
            .map(str::trim)
            .filter(|template| !template.is_empty())
            .unwrap_or(DEFAULT_OUTPUT_TEMPLATE);
        if Path::new(template).is_absolute() {
            template.to_string()
        } else {
            self.output_dir.join(template).to_string_lossy().into_owned()
        }
    }

    /// Checks everything that does not depend on the URL. The batch runner
    /// calls this once up front so a bad flag fails the run instead of every
    /// job.
    pub fn validate(&self) -> Result<()> {
        self.network_policy()?;
        self.post_processing_steps()?;
        Ok(())
    }

    pub fn network_policy(&self) -> Result<NetworkPolicy> {
        let proxy_url = match self.proxy.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(proxy) => {
                let parsed = url::Url::parse(proxy).map_err(|err| {
                    JobError::validation("proxy", format!("{proxy:?} is not a URL: {err}"))
                })?;
                if parsed.host_str().is_none() {
                    return Err(JobError::validation("proxy", format!("{proxy:?} has no host")));
                }
                Some(proxy.to_string())
            }
        };

        let rate_limit_bytes_per_sec = self
            .rate_limit
            .as_deref()
            .map(parse_rate_limit)
            .transpose()?;

        if self.concurrent_fragments == Some(0) {
            return Err(JobError::validation(
                "concurrent fragments",
                "must be at least 1",
            ));
        }

        let cookie_source = match self.cookies_from_browser.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(spec) => {
                // yt-dlp accepts BROWSER[+KEYRING][:PROFILE][::CONTAINER]
                let browser = spec
                    .split(['+', ':'])
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                if !COOKIE_BROWSERS.contains(&browser.as_str()) {
                    return Err(JobError::validation(
                        "cookies-from-browser",
                        format!(
                            "unknown browser {browser:?} (expected one of {})",
                            COOKIE_BROWSERS.join(", ")
                        ),
                    ));
                }
                Some(spec.to_string())
            }
        };

        Ok(NetworkPolicy {
            proxy_url,
            rate_limit_bytes_per_sec,
            concurrent_fragments: self.concurrent_fragments,
            cookie_source,
        })
    }

    fn post_processing_steps(&self) -> Result<Vec<PostProcessStep>> {
        let mut steps = Vec::new();

        if !self.sponsorblock_remove.is_empty() {
            let categories = non_empty_items(&self.sponsorblock_remove);
            if categories.is_empty() {
                return Err(JobError::validation(
                    "sponsorblock categories",
                    "list is empty",
                ));
            }
            steps.push(PostProcessStep::SponsorBlockRemove(categories));
        }

        let subtitle_langs = if self.write_subtitles {
            let langs = non_empty_items(&self.subtitle_langs);
            if langs.is_empty() {
                return Err(JobError::validation("subtitle languages", "list is empty"));
            }
            Some(langs)
        } else {
            None
        };

        match self.media_kind {
            MediaKind::Audio => {
                if self.embed_thumbnail && !self.audio_codec.supports_cover_art() {
                    return Err(JobError::validation(
                        "audio format",
                        format!(
                            "{} files cannot carry an embedded thumbnail",
                            self.audio_codec.as_str()
                        ),
                    ));
                }
                steps.push(PostProcessStep::ExtractAudio(self.audio_codec));
                if let Some(langs) = subtitle_langs {
                    steps.push(PostProcessStep::WriteSubtitles(langs));
                }
            }
            MediaKind::Video => {
                if let Some(langs) = subtitle_langs {
                    steps.push(PostProcessStep::WriteSubtitles(langs));
                }
                if self.embed_subtitles {
                    steps.push(PostProcessStep::EmbedSubtitles);
                }
            }
        }

        if self.write_thumbnail {
            steps.push(PostProcessStep::WriteThumbnail);
        }
        if self.embed_thumbnail {
            steps.push(PostProcessStep::EmbedThumbnail);
        }
        steps.push(PostProcessStep::WriteMetadata);
        Ok(steps)
    }

    fn media_selector(&self) -> String {
        if self.media_kind == MediaKind::Audio {
            return "bestaudio/best".to_string();
        }
        match self.quality {
            Quality::Best => match self.container.native_audio_ext() {
                Some(audio_ext) => {
                    let ext = self.container.as_str();
                    format!("bestvideo[ext={ext}]+bestaudio[ext={audio_ext}]/best[ext={ext}]/best")
                }
                None => "bestvideo+bestaudio/best".to_string(),
            },
            Quality::Worst => "worst".to_string(),
            Quality::MaxHeight(height) => {
                format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
            }
        }
    }
}

/// A single resolved download request.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub source_url: String,
    pub output_template: String,
    pub media_selector: String,
    pub media_kind: MediaKind,
    /// Container the engine merges separate video and audio streams into.
    pub merge_container: Option<VideoContainer>,
    pub post_processing: Vec<PostProcessStep>,
    pub network: NetworkPolicy,
    pub retry: RetryPolicy,
    pub archive_path: PathBuf,
}

impl JobDescriptor {
    pub fn build(url: &str, options: &DownloadOptions) -> Result<Self> {
        let source_url = validate_url(url)?;
        let network = options.network_policy()?;
        let post_processing = options.post_processing_steps()?;
        let media_selector = options.media_selector();
        let merge_container = match options.media_kind {
            MediaKind::Video => Some(options.container),
            MediaKind::Audio => None,
        };

        Ok(Self {
            source_url,
            output_template: options.resolved_output_template(),
            media_selector,
            media_kind: options.media_kind,
            merge_container,
            post_processing,
            network,
            retry: options.retry,
            archive_path: options.resolved_archive_path(),
        })
    }

    pub fn has_step(&self, wanted: &PostProcessStep) -> bool {
        self.post_processing.iter().any(|step| step == wanted)
    }
}

/// Local URL check: non-empty, absolute, http(s), with a host.
pub fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(JobError::validation("url", "must not be empty"));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|err| JobError::validation("url", format!("{trimmed:?} is malformed: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(JobError::validation(
            "url",
            format!("{trimmed:?} must use http or https"),
        ));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(JobError::validation("url", format!("{trimmed:?} has no host")));
    }
    Ok(trimmed.to_string())
}

/// Parses `500K`, `4.2M`, `1G` or a plain byte count into bytes per second.
/// Suffixes are binary multiples; a trailing `B` or `/s` is ignored.
pub fn parse_rate_limit(raw: &str) -> Result<u64> {
    let invalid = || {
        JobError::validation(
            "rate limit",
            format!("{raw:?} is not a rate like 500K or 4.2M"),
        )
    };
    let mut value = raw.trim().to_ascii_uppercase();
    if let Some(stripped) = value.strip_suffix("/S") {
        value = stripped.to_string();
    }
    if value.len() > 1
        && let Some(stripped) = value.strip_suffix('B')
    {
        value = stripped.to_string();
    }
    let (number, multiplier) = match value.chars().last() {
        Some('K') => (&value[..value.len() - 1], 1024f64),
        Some('M') => (&value[..value.len() - 1], 1024f64 * 1024.0),
        Some('G') => (&value[..value.len() - 1], 1024f64 * 1024.0 * 1024.0),
        Some(_) => (value.as_str(), 1f64),
        None => return Err(invalid()),
    };
    let number: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !number.is_finite() || number <= 0.0 {
        return Err(invalid());
    }
    let bytes = (number * multiplier).round();
    if bytes < 1.0 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

fn non_empty_items(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

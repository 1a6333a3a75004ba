#![forbid(unsafe_code)]

//! The extraction/download engine seam.
//!
//! [`DownloadEngine`] is the whole surface the orchestrator needs: a metadata
//! probe, the download itself, and a diagnostic format listing. [`YtDlpEngine`]
//! implements it by driving a `yt-dlp` child process. Progress comes back on
//! stdout as JSON lines (see [`crate::progress::PROGRESS_LINE_PREFIX`]); the
//! rest of stdout and all of stderr go to the diagnostic log.

use crate::archive::ArchiveId;
use crate::error::{JobError, Result};
use crate::job::{JobDescriptor, NetworkPolicy, PostProcessStep};
use crate::progress::{PROGRESS_LINE_PREFIX, ProgressAdapter};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_YTDLP_BINARY: &str = "yt-dlp";
/// Bitrate requested for extracted audio.
const AUDIO_QUALITY: &str = "192K";
/// stderr lines kept around to explain a failure.
const STDERR_TAIL: usize = 40;

/// Metadata returned by a probe; enough to dedupe and to show the user what
/// is about to be downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub id: String,
    pub extractor_key: String,
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub formats: Vec<FormatInfo>,
}

impl ProbeInfo {
    pub fn archive_id(&self) -> ArchiveId {
        ArchiveId::new(&self.extractor_key, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub format_note: Option<String>,
    pub ext: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &'static str;

    /// Resolves metadata for `url` without downloading media.
    async fn probe(&self, url: &str) -> Result<ProbeInfo>;

    /// Runs the download described by `job`, feeding progress to `progress`.
    /// Must stop promptly and return [`JobError::Cancelled`] once `cancel`
    /// fires.
    async fn download(
        &self,
        job: &JobDescriptor,
        progress: &ProgressAdapter,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Human-readable table of the formats available for `url`.
    async fn list_formats(&self, url: &str) -> Result<String>;
}

/// Subset of `yt-dlp --dump-single-json` read by the probe.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    extractor_key: Option<String>,
    extractor: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

impl VideoInfo {
    fn into_probe(self, url: &str) -> Result<ProbeInfo> {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| JobError::Extraction(format!("{url}: engine reported no item id")))?;
        let extractor_key = self
            .extractor_key
            .or(self.extractor)
            .unwrap_or_else(|| "generic".to_string());
        Ok(ProbeInfo {
            id,
            extractor_key,
            title: self
                .title
                .or(self.fulltitle)
                .unwrap_or_else(|| "Unknown".to_string()),
            duration_seconds: self
                .duration
                .filter(|duration| duration.is_finite() && *duration >= 0.0)
                .map(|duration| duration.round() as u64),
            uploader: self.uploader.or(self.channel),
            view_count: self
                .view_count
                .filter(|count| count.is_finite() && *count >= 0.0)
                .map(|count| count.round() as u64),
            thumbnail_url: self.thumbnail,
            formats: self.formats,
        })
    }
}

/// Engine backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    binary: PathBuf,
    /// Proxy and cookies also apply to probes and format listings.
    network: NetworkPolicy,
}

impl YtDlpEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            network: NetworkPolicy::default(),
        }
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn metadata_network_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(proxy) = &self.network.proxy_url {
            args.extend(["--proxy".to_string(), proxy.clone()]);
        }
        if let Some(cookies) = &self.network.cookie_source {
            args.extend(["--cookies-from-browser".to_string(), cookies.clone()]);
        }
        args
    }

    /// Runs a short-lived metadata command and returns its stdout.
    async fn run_metadata(&self, args: &[String], url: &str, what: &str) -> Result<String> {
        debug!(binary = %self.binary.display(), ?args, "running {what}");
        let output = self
            .command()
            .args(args)
            .args(self.metadata_network_args())
            .arg(url)
            .output()
            .await
            .map_err(|err| {
                JobError::Extraction(format!(
                    "could not run {}: {err}",
                    self.binary.display()
                ))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
            debug!(target: "mediagrab::engine::stderr", "{line}");
        }
        if !output.status.success() {
            let lines: Vec<String> = stderr.lines().map(str::to_string).collect();
            let message = last_error_line(&lines)
                .unwrap_or_else(|| format!("{what} exited with {}", output.status));
            return Err(JobError::Extraction(format!("{url}: {message}")));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| JobError::Extraction(format!("{url}: {what} output was not UTF-8")))
    }
}

#[async_trait]
impl DownloadEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str) -> Result<ProbeInfo> {
        let args = [
            "--dump-single-json",
            "--skip-download",
            "--no-playlist",
            "--no-warnings",
            "--no-progress",
        ]
        .map(String::from);
        let raw = self.run_metadata(&args, url, "metadata probe").await?;
        let info: VideoInfo = serde_json::from_str(&raw).map_err(|err| {
            JobError::Extraction(format!("{url}: unreadable metadata JSON: {err}"))
        })?;
        info.into_probe(url)
    }

    async fn download(
        &self,
        job: &JobDescriptor,
        progress: &ProgressAdapter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = download_args(job);
        debug!(binary = %self.binary.display(), ?args, "starting download");

        let mut child = self.command().args(&args).spawn().map_err(|err| JobError::Download {
            message: format!("could not start {}: {err}", self.binary.display()),
            retries_exhausted: false,
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(JobError::Download {
                message: "engine output pipes were not captured".to_string(),
                retries_exhausted: false,
            });
        };
        let stderr_task = tokio::spawn(collect_stderr(stderr));
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop_child(&mut child).await;
                    stderr_task.abort();
                    return Err(JobError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !progress.on_engine_line(&line) && !line.trim().is_empty() {
                            debug!(target: "mediagrab::engine::stdout", "{line}");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("stopped reading engine output: {err}");
                        break;
                    }
                },
            }
        }

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = waited else {
            stop_child(&mut child).await;
            stderr_task.abort();
            return Err(JobError::Cancelled);
        };
        let status = status.map_err(|err| JobError::Download {
            message: format!("waiting for engine: {err}"),
            retries_exhausted: false,
        })?;
        let stderr_lines = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(classify_failure(&stderr_lines, status))
        }
    }

    async fn list_formats(&self, url: &str) -> Result<String> {
        let args = ["-F", "--no-playlist", "--no-warnings"].map(String::from);
        self.run_metadata(&args, url, "format listing").await
    }
}

async fn stop_child(child: &mut tokio::process::Child) {
    if let Err(err) = child.kill().await {
        debug!("engine process already gone: {err}");
    }
}

async fn collect_stderr(stderr: impl AsyncRead + Unpin) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!(target: "mediagrab::engine::stderr", "{line}");
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

fn last_error_line(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .find_map(|line| line.trim().strip_prefix("ERROR:"))
        .map(|message| message.trim().to_string())
}

/// Turns a failed run into a [`JobError::Download`], noticing when yt-dlp
/// burned through its retries rather than failing outright.
fn classify_failure(stderr: &[String], status: ExitStatus) -> JobError {
    let retries_exhausted = stderr.iter().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.contains("giving up after") || lower.contains("retries exhausted")
    });
    let message = last_error_line(stderr)
        .or_else(|| stderr.last().map(|line| line.trim().to_string()))
        .unwrap_or_else(|| format!("engine exited with {status}"));
    JobError::Download {
        message,
        retries_exhausted,
    }
}

/// Full yt-dlp argument vector for `job`, URL last.
pub fn download_args(job: &JobDescriptor) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--no-playlist".into(),
        "--progress-template".into(),
        format!("download:{PROGRESS_LINE_PREFIX}%(progress)j"),
        "--progress-template".into(),
        format!("postprocess:{PROGRESS_LINE_PREFIX}%(progress)j"),
        "--format".into(),
        job.media_selector.clone(),
        "--output".into(),
        job.output_template.clone(),
        "--no-overwrites".into(),
        "--continue".into(),
    ];

    if let Some(container) = job.merge_container {
        args.extend(["--merge-output-format".into(), container.as_str().into()]);
    }

    args.extend([
        "--retries".into(),
        job.retry.max_retries.to_string(),
        "--fragment-retries".into(),
        job.retry.max_fragment_retries.to_string(),
    ]);
    args.push(if job.retry.skip_unavailable_fragments {
        "--skip-unavailable-fragments".into()
    } else {
        "--abort-on-unavailable-fragments".into()
    });

    let network = &job.network;
    if let Some(proxy) = &network.proxy_url {
        args.extend(["--proxy".into(), proxy.clone()]);
    }
    if let Some(rate) = network.rate_limit_bytes_per_sec {
        args.extend(["--limit-rate".into(), rate.to_string()]);
    }
    if let Some(fragments) = network.concurrent_fragments {
        args.extend(["--concurrent-fragments".into(), fragments.to_string()]);
    }
    if let Some(cookies) = &network.cookie_source {
        args.extend(["--cookies-from-browser".into(), cookies.clone()]);
    }

    for step in &job.post_processing {
        match step {
            PostProcessStep::SponsorBlockRemove(categories) => {
                args.extend(["--sponsorblock-remove".into(), categories.join(",")]);
            }
            PostProcessStep::ExtractAudio(codec) => {
                args.extend([
                    "--extract-audio".into(),
                    "--audio-format".into(),
                    codec.as_str().into(),
                    "--audio-quality".into(),
                    AUDIO_QUALITY.into(),
                ]);
            }
            PostProcessStep::WriteSubtitles(langs) => {
                args.extend([
                    "--write-subs".into(),
                    "--sub-langs".into(),
                    langs.join(","),
                ]);
            }
            PostProcessStep::EmbedSubtitles => args.push("--embed-subs".into()),
            PostProcessStep::WriteThumbnail => args.push("--write-thumbnail".into()),
            PostProcessStep::EmbedThumbnail => args.push("--embed-thumbnail".into()),
            PostProcessStep::WriteMetadata => args.push("--embed-metadata".into()),
        }
    }

    args.push(job.source_url.clone());
    args
}

/// Runs `<program> <version_flag>` to fail loudly when a dependency such as
/// yt-dlp is missing.
pub fn ensure_program_available(program: &Path, version_flag: &str) -> anyhow::Result<()> {
    let status = std::process::Command::new(program)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => anyhow::bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => anyhow::bail!(
            "{} is not installed or not in PATH: {}",
            program.display(),
            err
        ),
    }
}

/// Whether any step of `job` needs ffmpeg on the host.
pub fn needs_ffmpeg(job: &JobDescriptor) -> bool {
    job.merge_container.is_some()
        || job.post_processing.iter().any(|step| {
            matches!(
                step,
                PostProcessStep::ExtractAudio(_)
                    | PostProcessStep::EmbedSubtitles
                    | PostProcessStep::EmbedThumbnail
                    | PostProcessStep::WriteMetadata
                    | PostProcessStep::SponsorBlockRemove(_)
            )
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::{AudioCodec, DownloadOptions, MediaKind, RetryPolicy};
    use crate::progress::Phase;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::fs;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    /// Writes an executable stand-in for yt-dlp into `dir`. Every invocation
    /// appends its arguments to `calls.log` next to the script.
    pub(crate) fn install_ytdlp_stub(dir: &Path) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
here="$(cd "$(dirname "$0")" && pwd)"
echo "$*" >> "$here/calls.log"
url="${@: -1}"

if [[ " $* " == *" --version "* ]]; then
  echo "2024.12.13"
  exit 0
fi

if [[ "$url" == *missing* ]]; then
  echo "ERROR: [generic] Unsupported URL: $url" >&2
  exit 1
fi

if [[ " $* " == *" --dump-single-json "* ]]; then
  id="${url##*/}"
  printf '{"id":"%s","extractor_key":"Youtube","title":"Title %s","duration":125,"uploader":"Uploader","view_count":10,"thumbnail":"https://img.example.com/%s.jpg","formats":[{"format_id":"18","ext":"mp4","height":360}]}\n' "$id" "$id" "$id"
  exit 0
fi

if [[ " $* " == *" -F "* ]]; then
  echo "ID  EXT  RESOLUTION"
  echo "18  mp4  640x360"
  exit 0
fi

if [[ "$url" == *flaky* ]]; then
  echo "[download] Got error: HTTP Error 503. Retrying (3/3)..." >&2
  echo "ERROR: fragment 1 not found; Giving up after 3 retries" >&2
  exit 1
fi

if [[ "$url" == *slow* ]]; then
  echo 'mediagrab-progress {"status":"downloading","downloaded_bytes":10,"total_bytes":100}'
  sleep 30
  exit 0
fi

echo "[youtube] Extracting URL: $url"
echo 'mediagrab-progress {"status":"downloading","downloaded_bytes":50,"total_bytes":100,"speed":25.0,"eta":2}'
echo 'mediagrab-progress {"status":"finished","downloaded_bytes":100,"total_bytes":100}'
echo 'mediagrab-progress {"status":"started","postprocessor":"Metadata"}'
echo 'mediagrab-progress {"status":"finished","postprocessor":"Metadata"}'
exit 0
"#;
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn job(url: &str, options: &DownloadOptions) -> JobDescriptor {
        JobDescriptor::build(url, options).unwrap()
    }

    #[test]
    fn download_args_cover_every_descriptor_field() {
        let options = DownloadOptions {
            output_dir: PathBuf::from("/out"),
            media_kind: MediaKind::Audio,
            audio_codec: AudioCodec::Opus,
            write_thumbnail: true,
            embed_thumbnail: true,
            sponsorblock_remove: vec!["sponsor".into()],
            proxy: Some("http://proxy.local:3128".into()),
            rate_limit: Some("1M".into()),
            concurrent_fragments: Some(4),
            cookies_from_browser: Some("firefox".into()),
            retry: RetryPolicy {
                max_retries: 3,
                max_fragment_retries: 5,
                skip_unavailable_fragments: false,
            },
            ..DownloadOptions::default()
        };
        let args = download_args(&job("https://example.com/watch/1", &options));
        let joined = args.join(" ");

        assert_eq!(args.last().map(String::as_str), Some("https://example.com/watch/1"));
        assert!(joined.contains("--format bestaudio/best"));
        assert!(joined.contains("--retries 3 --fragment-retries 5 --abort-on-unavailable-fragments"));
        assert!(joined.contains("--proxy http://proxy.local:3128"));
        assert!(joined.contains("--limit-rate 1048576"));
        assert!(joined.contains("--concurrent-fragments 4"));
        assert!(joined.contains("--cookies-from-browser firefox"));
        assert!(joined.contains(
            "--sponsorblock-remove sponsor --extract-audio --audio-format opus --audio-quality 192K --write-thumbnail --embed-thumbnail --embed-metadata"
        ));
        assert!(!joined.contains("--merge-output-format"));
        assert!(args.contains(&format!("download:{PROGRESS_LINE_PREFIX}%(progress)j")));
    }

    #[test]
    fn video_jobs_merge_into_requested_container() {
        let args = download_args(&job("https://example.com/v", &DownloadOptions::default()));
        let joined = args.join(" ");
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(joined.contains("--skip-unavailable-fragments"));
        assert!(joined.contains("--embed-metadata"));
    }

    #[cfg(unix)]
    #[test]
    fn failures_report_exhausted_retries() {
        let status = std::process::Command::new("false").status().unwrap();
        let err = classify_failure(
            &[
                "[download] Got error: HTTP Error 503. Retrying (3/3)...".to_string(),
                "ERROR: fragment 1 not found; Giving up after 3 retries".to_string(),
            ],
            status,
        );
        match err {
            JobError::Download {
                message,
                retries_exhausted,
            } => {
                assert!(retries_exhausted);
                assert_eq!(message, "fragment 1 not found; Giving up after 3 retries");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = classify_failure(&[], status);
        assert!(err.to_string().starts_with("download failed: engine exited with"));
    }

    #[test]
    fn probe_json_falls_back_to_alternate_fields() {
        let info: VideoInfo = serde_json::from_str(
            r#"{"id":"x1","extractor":"vimeo","fulltitle":"Full","channel":"Chan","duration":59.6}"#,
        )
        .unwrap();
        let probe = info.into_probe("https://vimeo.com/x1").unwrap();
        assert_eq!(probe.title, "Full");
        assert_eq!(probe.uploader.as_deref(), Some("Chan"));
        assert_eq!(probe.duration_seconds, Some(60));
        assert_eq!(probe.archive_id().to_string(), "vimeo x1");

        let missing: VideoInfo = serde_json::from_str(r#"{"title":"no id"}"#).unwrap();
        assert!(missing.into_probe("https://example.com").is_err());
    }

    #[test]
    fn probe_json_accepts_float_numbers() {
        let info: VideoInfo = serde_json::from_str(
            r#"{"id":"f1","extractor_key":"Youtube","view_count":42.0,"formats":[{"format_id":"137","height":1080.0,"width":1920,"filesize":1234.5,"filesize_approx":2000.0}]}"#,
        )
        .unwrap();
        let probe = info.into_probe("https://youtu.be/f1").unwrap();
        assert_eq!(probe.view_count, Some(42));
        let format = &probe.formats[0];
        assert_eq!(format.height, Some(1080.0));
        assert_eq!(format.width, Some(1920.0));
        assert_eq!(format.filesize, Some(1234.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stub_probe_and_list_formats() {
        let temp = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(temp.path()));

        let probe = engine.probe("https://example.com/watch/alpha").await.unwrap();
        assert_eq!(probe.id, "alpha");
        assert_eq!(probe.archive_id().to_string(), "youtube alpha");
        assert_eq!(probe.duration_seconds, Some(125));
        assert_eq!(probe.formats.len(), 1);

        let table = engine.list_formats("https://example.com/watch/alpha").await.unwrap();
        assert!(table.contains("640x360"));

        let err = engine.probe("https://example.com/missing").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Extraction);
        assert!(err.to_string().contains("Unsupported URL"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stub_download_streams_progress() {
        let temp = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(temp.path()));
        let (tx, mut rx) = mpsc::channel(16);
        let adapter = ProgressAdapter::new(0, tx);
        let descriptor = job("https://example.com/watch/alpha", &DownloadOptions::default());

        engine
            .download(&descriptor, &adapter, &CancellationToken::new())
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert_eq!(
            phases,
            vec![
                Phase::Downloading,
                Phase::Finished,
                Phase::PostProcessing,
                Phase::PostProcessing
            ]
        );
        assert!(adapter.saw_post_processing());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stub_download_failure_and_cancellation() {
        let temp = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(temp.path()));
        let adapter = ProgressAdapter::detached(0);

        let flaky = job("https://example.com/watch/flaky", &DownloadOptions::default());
        let err = engine
            .download(&flaky, &adapter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Download {
                retries_exhausted: true,
                ..
            }
        ));

        let slow = job("https://example.com/watch/slow", &DownloadOptions::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = engine.download(&slow, &adapter, &cancel).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn ensure_program_available_reports_missing_binary() {
        let err = ensure_program_available(Path::new("definitely-not-a-real-binary"), "--version")
            .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}

#![forbid(unsafe_code)]

//! Command-line front end: resolves settings, checks prerequisites, then runs
//! the URLs (one, a batch file, or an interactive prompt) through the batch
//! orchestrator.

use anyhow::{Context, Result};
use clap::Parser;
use mediagrab::archive::ArchiveLedger;
use mediagrab::batch::{BatchOrchestrator, BatchRunSummary, read_batch_file};
use mediagrab::config::{ConfigLayer, ExitPolicy, RuntimeOverrides, Settings, resolve_settings};
use mediagrab::console::Console;
use mediagrab::engine::{DownloadEngine, YtDlpEngine, ensure_program_available, needs_ffmpeg};
use mediagrab::interactive::InteractiveSession;
use mediagrab::job::{AudioCodec, JobDescriptor, VideoContainer};
use mediagrab::logging;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EXIT_FATAL: u8 = 1;
const EXIT_JOBS_FAILED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Download videos or audio through yt-dlp, with archive-based deduplication.
#[derive(Parser, Debug)]
#[command(name = "mediagrab")]
struct Cli {
    /// Video URL to download.
    url: Option<String>,

    /// Output directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Quality preset.
    #[arg(short, long, value_parser = ["best", "worst", "720p", "1080p", "480p", "360p"])]
    quality: Option<String>,

    /// Download audio only.
    #[arg(short, long)]
    audio: bool,

    /// Audio format for --audio.
    #[arg(short = 'f', long = "format", value_parser = clap::value_parser!(AudioCodec))]
    audio_format: Option<AudioCodec>,

    /// Container for merged video.
    #[arg(short = 'v', long, value_parser = clap::value_parser!(VideoContainer))]
    video_format: Option<VideoContainer>,

    /// Download subtitles.
    #[arg(long)]
    subtitles: bool,

    /// Embed subtitles into the video file.
    #[arg(long)]
    embed_subs: bool,

    /// Subtitle languages, comma separated.
    #[arg(long)]
    sub_langs: Option<String>,

    /// Save the thumbnail next to the media file.
    #[arg(long)]
    write_thumbnail: bool,

    /// Embed the thumbnail as cover art.
    #[arg(long)]
    embed_thumbnail: bool,

    /// Load cookies from a browser profile.
    #[arg(long)]
    cookies_from_browser: Option<String>,

    /// Proxy URL.
    #[arg(long)]
    proxy: Option<String>,

    /// Download rate limit, e.g. 50K or 4.2M.
    #[arg(long)]
    rate_limit: Option<String>,

    /// Fragments of a DASH/HLS stream fetched at once.
    #[arg(long)]
    concurrent_fragments: Option<u32>,

    /// SponsorBlock categories to cut, comma separated.
    #[arg(long)]
    sponsorblock_remove: Option<String>,

    /// File with one URL per line.
    #[arg(long)]
    batch_file: Option<PathBuf>,

    /// Download archive file.
    #[arg(long)]
    archive: Option<PathBuf>,

    /// yt-dlp output template.
    #[arg(long)]
    filename_template: Option<String>,

    /// List available formats instead of downloading.
    #[arg(short, long)]
    list_formats: bool,

    /// Prompt for the URL and download options.
    #[arg(long)]
    interactive: bool,

    /// TOML config file (default: ./mediagrab.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Downloads running at once.
    #[arg(long)]
    jobs: Option<usize>,

    /// Retries per download.
    #[arg(long)]
    retries: Option<u32>,

    /// Retries per fragment.
    #[arg(long)]
    fragment_retries: Option<u32>,

    /// Fail a download when a fragment stays unavailable instead of skipping it.
    #[arg(long)]
    abort_on_unavailable_fragments: bool,

    /// Skip the metadata probe; the archive is then keyed by URL.
    #[arg(long)]
    no_probe: bool,

    /// Also write the run summary as JSON to this path.
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Exit with status 2 when any job failed.
    #[arg(long)]
    strict: bool,

    /// Show debug logs on stderr.
    #[arg(short = 'V', long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        let flag = |set: bool| set.then_some(true);
        RuntimeOverrides {
            config_path: self.config.clone(),
            cli: ConfigLayer {
                output: self.output.clone(),
                quality: self.quality.clone(),
                audio: flag(self.audio),
                audio_format: self.audio_format,
                video_format: self.video_format,
                subtitles: flag(self.subtitles),
                embed_subs: flag(self.embed_subs),
                sub_langs: self.sub_langs.clone().map(|langs| vec![langs]),
                write_thumbnail: flag(self.write_thumbnail),
                embed_thumbnail: flag(self.embed_thumbnail),
                cookies_from_browser: self.cookies_from_browser.clone(),
                proxy: self.proxy.clone(),
                rate_limit: self.rate_limit.clone(),
                concurrent_fragments: self.concurrent_fragments,
                sponsorblock_remove: self.sponsorblock_remove.clone().map(|cats| vec![cats]),
                archive: self.archive.clone(),
                filename_template: self.filename_template.clone(),
                retries: self.retries,
                fragment_retries: self.fragment_retries,
                skip_unavailable_fragments: self.abort_on_unavailable_fragments.then_some(false),
                jobs: self.jobs,
                probe: self.no_probe.then_some(false),
                ytdlp_path: None,
                summary_json: self.summary_json.clone(),
                exit_policy: self.strict.then_some(ExitPolicy::FailOnError),
            },
        }
    }

    fn wants_interactive(&self) -> bool {
        self.interactive || (self.url.is_none() && self.batch_file.is_none())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut settings = resolve_settings(cli.overrides()).context("Loading configuration")?;
    let log_path = logging::init(&settings.download.output_dir, cli.verbose)?;
    if let Some(config_file) = &settings.config_file {
        info!(path = %config_file.display(), "loaded config file");
    }
    info!(log = %log_path.display(), "mediagrab starting");

    ensure_program_available(&settings.ytdlp_path, "--version")?;
    let console = Console::stdout();

    let urls = if cli.wants_interactive() {
        let (url, choice) = {
            let mut session = InteractiveSession::new(std::io::stdin().lock(), console.clone());
            session.banner();
            let url = match &cli.url {
                Some(url) => url.clone(),
                None => session.ask_url()?,
            };
            let choice = if cli.list_formats {
                None
            } else {
                Some(session.ask_choice()?)
            };
            (url, choice)
        };
        match choice {
            Some(choice) => choice.apply(&mut settings.download),
            None => return list_formats(&settings, &console, &[url]).await,
        }
        vec![url]
    } else if let Some(batch_file) = &cli.batch_file {
        let mut urls = read_batch_file(batch_file)?;
        urls.extend(cli.url.clone());
        urls
    } else {
        let urls: Vec<String> = cli.url.iter().cloned().collect();
        if cli.list_formats {
            return list_formats(&settings, &console, &urls).await;
        }
        urls
    };
    let batch_mode = cli.batch_file.is_some();

    settings
        .download
        .validate()
        .context("Invalid download options")?;
    warn_if_ffmpeg_missing(&settings, &urls, &console);

    let archive_path = settings.download.resolved_archive_path();
    let ledger = ArchiveLedger::open(&archive_path)
        .with_context(|| format!("Opening archive {}", archive_path.display()))?;
    let network = settings.download.network_policy()?;
    let engine: Arc<dyn DownloadEngine> =
        Arc::new(YtDlpEngine::new(&settings.ytdlp_path).with_network(network));

    console.line("===================================");
    console.line("mediagrab");
    console.line("===================================");
    console.line(format!("Output: {}", settings.download.output_dir.display()));
    console.line(format!("Archive: {}", archive_path.display()));
    console.line(format!("URLs: {}", urls.len()));
    console.blank();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let orchestrator = BatchOrchestrator::new(
        engine,
        ledger,
        settings.download.clone(),
        console.clone(),
        cancel,
    )
    .with_workers(settings.jobs)
    .with_probe(settings.probe);
    let summary = orchestrator.run_batch(&urls).await;
    summary.render(&console);

    if let Some(path) = &settings.summary_json {
        write_summary(&summary, path, &console);
    }

    Ok(exit_status(&summary, settings.exit_policy, batch_mode))
}

async fn list_formats(settings: &Settings, console: &Console, urls: &[String]) -> Result<u8> {
    let engine = YtDlpEngine::new(&settings.ytdlp_path)
        .with_network(settings.download.network_policy()?);
    let mut status = 0;
    for url in urls {
        match engine.list_formats(url).await {
            Ok(table) => console.line(table.trim_end()),
            Err(err) => {
                console.line(format!("✗ {url} [{}] {}", err.kind(), err.detail()));
                status = EXIT_FATAL;
            }
        }
    }
    Ok(status)
}

fn warn_if_ffmpeg_missing(settings: &Settings, urls: &[String], console: &Console) {
    let needed = urls
        .iter()
        .find_map(|url| JobDescriptor::build(url, &settings.download).ok())
        .is_some_and(|job| needs_ffmpeg(&job));
    if !needed {
        return;
    }
    if let Err(err) = ensure_program_available(Path::new("ffmpeg"), "-version") {
        warn!("{err:#}");
        console.line("Warning: ffmpeg not found; merging and post-processing will fail.");
    }
}

fn write_summary(summary: &BatchRunSummary, path: &Path, console: &Console) {
    match summary.write_json(path) {
        Ok(()) => console.line(format!("Summary written to {}", path.display())),
        Err(err) => {
            warn!("{err:#}");
            console.line(format!("Could not write summary: {err:#}"));
        }
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, stopping downloads");
        cancel.cancel();
    }
}

/// Interrupts win over failures. A lone URL that failed is an error of the
/// invocation; inside a batch failures only count under the strict policy.
fn exit_status(summary: &BatchRunSummary, policy: ExitPolicy, batch_mode: bool) -> u8 {
    if summary.was_interrupted() {
        EXIT_INTERRUPTED
    } else if !summary.has_failures() {
        0
    } else if policy == ExitPolicy::FailOnError {
        EXIT_JOBS_FAILED
    } else if batch_mode {
        0
    } else {
        EXIT_FATAL
    }
}

#![forbid(unsafe_code)]

//! Batch orchestration: runs one job per URL, isolates failures, consults the
//! download archive, and produces a [`BatchRunSummary`] whose results follow
//! the input order.
//!
//! Jobs are admitted in input order through a semaphore. With the default
//! single worker a job starts only after the previous one finished; with more
//! workers they overlap, and the archive claim keeps two jobs from fetching
//! the same item.

use crate::archive::{ArchiveId, ArchiveLedger, Claim};
use crate::console::Console;
use crate::engine::{DownloadEngine, ProbeInfo};
use crate::error::{ErrorKind, JobError};
use crate::job::{DownloadOptions, JobDescriptor};
use crate::progress::{
    PROGRESS_QUEUE_CAPACITY, Phase, ProgressAdapter, ProgressEvent, ProgressReporter,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a job re-checks a claim held by another worker.
const CLAIM_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of one job. `Succeeded`, `Failed`, `Skipped` and `Cancelled`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Probing,
    Building,
    Downloading,
    PostProcessing,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn can_transition(self, next: Self) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Probing)
                | (Pending, Building)
                | (Probing, Building)
                | (Probing, Skipped)
                | (Pending, Skipped)
                | (Building, Downloading)
                | (Downloading, PostProcessing)
                | (PostProcessing, Succeeded)
        )
    }
}

struct JobTracker {
    index: usize,
    state: JobState,
}

impl JobTracker {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: JobState::Pending,
        }
    }

    fn advance(&mut self, next: JobState) {
        if self.state.can_transition(next) {
            debug!(job = self.index, from = ?self.state, to = ?next, "job state");
            self.state = next;
        } else {
            warn!(job = self.index, from = ?self.state, to = ?next, "ignoring illegal job transition");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub url: String,
    pub outcome: JobOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl JobResult {
    fn new(url: &str, outcome: JobOutcome) -> Self {
        Self {
            url: url.to_string(),
            outcome,
            error_kind: None,
            error_detail: None,
            archive_id: None,
            title: None,
        }
    }

    fn failed(url: &str, err: &JobError) -> Self {
        let outcome = if matches!(err, JobError::Cancelled) {
            JobOutcome::Cancelled
        } else {
            JobOutcome::Failed
        };
        Self {
            error_kind: Some(err.kind()),
            error_detail: Some(err.detail()),
            ..Self::new(url, outcome)
        }
    }

    fn with_probe(mut self, id: &ArchiveId, title: Option<&str>) -> Self {
        self.archive_id = Some(id.to_string());
        self.title = title.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<JobResult>,
}

impl BatchRunSummary {
    fn from_results(results: Vec<JobResult>, started_at: DateTime<Utc>) -> Self {
        let count = |outcome| results.iter().filter(|r| r.outcome == outcome).count();
        Self {
            total: results.len(),
            succeeded: count(JobOutcome::Succeeded),
            failed: count(JobOutcome::Failed),
            skipped: count(JobOutcome::Skipped),
            cancelled: count(JobOutcome::Cancelled),
            started_at,
            finished_at: Utc::now(),
            results,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn was_interrupted(&self) -> bool {
        self.cancelled > 0
    }

    pub fn render(&self, console: &Console) {
        console.blank();
        console.line("===================================");
        console.line("Batch summary");
        console.line("===================================");
        console.line(format!(
            "Total: {}  Succeeded: {}  Failed: {}  Skipped: {}  Cancelled: {}",
            self.total, self.succeeded, self.failed, self.skipped, self.cancelled
        ));
        for result in &self.results {
            let line = match result.outcome {
                JobOutcome::Succeeded => format!("  ✓ {}", result.url),
                JobOutcome::Skipped => format!(
                    "  - {} ({})",
                    result.url,
                    result.error_detail.as_deref().unwrap_or("already in archive")
                ),
                JobOutcome::Failed | JobOutcome::Cancelled => format!(
                    "  ✗ {} [{}] {}",
                    result.url,
                    result.error_kind.map(ErrorKind::as_str).unwrap_or("error"),
                    result.error_detail.as_deref().unwrap_or("")
                ),
            };
            console.line(line);
        }
    }

    /// Writes the summary as JSON through a temp file so readers never see a
    /// half-written report.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(self).context("serializing run summary")?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| format!("finalizing {}", path.display()))?;
        Ok(())
    }
}

/// Drives a batch of URLs through probe, archive check, build and download.
#[derive(Clone)]
pub struct BatchOrchestrator {
    engine: Arc<dyn DownloadEngine>,
    ledger: Arc<ArchiveLedger>,
    options: Arc<DownloadOptions>,
    console: Console,
    cancel: CancellationToken,
    workers: usize,
    probe: bool,
}

impl BatchOrchestrator {
    pub fn new(
        engine: Arc<dyn DownloadEngine>,
        ledger: Arc<ArchiveLedger>,
        options: DownloadOptions,
        console: Console,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            ledger,
            options: Arc::new(options),
            console,
            cancel,
            workers: 1,
            probe: true,
        }
    }

    /// Number of jobs allowed to run at once (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Without a probe the archive is keyed by URL and only used for local
    /// accounting.
    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    pub async fn run_batch(&self, urls: &[String]) -> BatchRunSummary {
        let started_at = Utc::now();
        let total = urls.len();
        info!(
            total,
            workers = self.workers,
            engine = self.engine.name(),
            archive = %self.ledger.path().display(),
            "starting batch"
        );

        let (tx, rx) = mpsc::channel(PROGRESS_QUEUE_CAPACITY);
        let reporter = ProgressReporter::spawn(rx, self.console.clone());
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut running = JoinSet::new();

        for (index, url) in urls.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                warn!(remaining = total - index, "batch interrupted, not starting queued jobs");
                break;
            };

            let this = self.clone();
            let url = url.clone();
            let tx = tx.clone();
            running.spawn(async move {
                let result = this.run_job(index, total, &url, tx).await;
                drop(permit);
                (index, result)
            });
        }
        drop(tx);

        let mut slots: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => error!("job worker stopped unexpectedly: {err}"),
            }
        }
        if let Err(err) = reporter.await {
            debug!("progress reporter ended abnormally: {err}");
        }

        let results = slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    if self.cancel.is_cancelled() {
                        JobResult::failed(url, &JobError::Cancelled)
                    } else {
                        JobResult {
                            error_detail: Some("job worker stopped unexpectedly".to_string()),
                            ..JobResult::new(url, JobOutcome::Failed)
                        }
                    }
                })
            })
            .collect();

        let summary = BatchRunSummary::from_results(results, started_at);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "batch finished"
        );
        summary
    }

    async fn run_job(
        &self,
        index: usize,
        total: usize,
        url: &str,
        tx: mpsc::Sender<ProgressEvent>,
    ) -> JobResult {
        let adapter = ProgressAdapter::new(index, tx);
        let mut tracker = JobTracker::new(index);
        self.console.line(format!("[{}/{}] {}", index + 1, total, url));
        adapter.mark(Phase::Pending);

        if self.cancel.is_cancelled() {
            return self.fail(&mut tracker, &adapter, url, JobError::Cancelled, None);
        }
        // Options and URL are checked before anything touches the network.
        let job = match JobDescriptor::build(url, &self.options) {
            Ok(job) => job,
            Err(err) => return self.fail(&mut tracker, &adapter, url, err, None),
        };

        let (archive_id, title) = if self.probe {
            tracker.advance(JobState::Probing);
            let probed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(JobError::Cancelled),
                probed = self.engine.probe(url) => probed,
            };
            match probed {
                Ok(info) => {
                    self.show_info(&info);
                    (info.archive_id(), Some(info.title))
                }
                Err(err) => return self.fail(&mut tracker, &adapter, url, err, None),
            }
        } else {
            (ArchiveId::from_url(url), None)
        };

        let guard = loop {
            let claim = match self.ledger.try_claim(&archive_id) {
                Ok(claim) => claim,
                Err(err) => {
                    let id = Some((&archive_id, title.as_deref()));
                    return self.fail(&mut tracker, &adapter, url, err, id);
                }
            };
            match claim {
                Claim::Claimed(guard) => break guard,
                Claim::Archived => {
                    let reason = "already in archive";
                    return self.skip(&mut tracker, url, &archive_id, title.as_deref(), reason);
                }
                Claim::InFlight => {
                    // Another worker holds the id. Wait until it commits or lets go.
                    debug!(url, id = %archive_id, "waiting for the running download of this id");
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(CLAIM_RETRY_INTERVAL) => false,
                    };
                    if cancelled {
                        let id = Some((&archive_id, title.as_deref()));
                        return self.fail(&mut tracker, &adapter, url, JobError::Cancelled, id);
                    }
                }
            }
        };

        tracker.advance(JobState::Building);

        tracker.advance(JobState::Downloading);
        debug!(url, selector = %job.media_selector, template = %job.output_template, "downloading");
        let downloaded = self.engine.download(&job, &adapter, &self.cancel).await;
        let dropped = adapter.dropped_events();
        if dropped > 0 {
            debug!(url, dropped, "progress updates dropped while the queue was full");
        }
        if let Err(err) = downloaded {
            // Dropping the claim without committing keeps the archive as it was.
            drop(guard);
            let id = Some((&archive_id, title.as_deref()));
            return self.fail(&mut tracker, &adapter, url, err, id);
        }

        tracker.advance(JobState::PostProcessing);
        if let Err(err) = guard.commit() {
            let id = Some((&archive_id, title.as_deref()));
            return self.fail(&mut tracker, &adapter, url, err, id);
        }
        tracker.advance(JobState::Succeeded);
        adapter.mark(Phase::Finished);
        info!(url, id = %archive_id, "download complete");
        self.console.line(format!(
            "  ✓ complete, saved under {}",
            self.options.output_dir.display()
        ));

        JobResult::new(url, JobOutcome::Succeeded).with_probe(&archive_id, title.as_deref())
    }

    fn skip(
        &self,
        tracker: &mut JobTracker,
        url: &str,
        id: &ArchiveId,
        title: Option<&str>,
        reason: &str,
    ) -> JobResult {
        tracker.advance(JobState::Skipped);
        info!(url, %id, "{reason}, skipping");
        self.console.line(format!("  {reason} ({id}), skipping"));
        JobResult {
            error_detail: Some(reason.to_string()),
            ..JobResult::new(url, JobOutcome::Skipped).with_probe(id, title)
        }
    }

    fn fail(
        &self,
        tracker: &mut JobTracker,
        adapter: &ProgressAdapter,
        url: &str,
        err: JobError,
        probed: Option<(&ArchiveId, Option<&str>)>,
    ) -> JobResult {
        let cancelled = matches!(err, JobError::Cancelled);
        tracker.advance(if cancelled {
            JobState::Cancelled
        } else {
            JobState::Failed
        });
        adapter.mark(Phase::Failed);

        let result = JobResult::failed(url, &err);
        let detail = result.error_detail.as_deref().unwrap_or_default();
        // The console line already reaches the terminal; the log file keeps these.
        if cancelled {
            info!(url, "job cancelled");
        } else {
            info!(url, kind = %err.kind(), "job failed: {detail}");
        }
        self.console.line(format!("  ✗ {url} [{}] {detail}", err.kind()));

        match probed {
            Some((id, title)) => result.with_probe(id, title),
            None => result,
        }
    }

    fn show_info(&self, info: &ProbeInfo) {
        self.console.line(format!("  Title: {}", info.title));
        self.console.line(format!(
            "  Uploader: {}",
            info.uploader.as_deref().unwrap_or("Unknown")
        ));
        self.console.line(format!(
            "  Duration: {}",
            info.duration_seconds
                .map(format_duration)
                .unwrap_or_else(|| "Unknown".to_string())
        ));
        if let Some(views) = info.view_count {
            self.console.line(format!("  Views: {views}"));
        }
    }
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips.
pub fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Reads a batch file: one URL per line. Blank lines and lines starting with
/// `#`, `;` or `]` are ignored, as yt-dlp does.
pub fn read_batch_file(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading batch file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(['#', ';', ']']))
        .map(str::to_string)
        .collect())
}

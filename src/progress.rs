#![forbid(unsafe_code)]

//! Progress plumbing between the engine and the terminal.
//!
//! The engine calls into a [`ProgressAdapter`] from its own read loop. The
//! adapter normalizes each raw event into a [`ProgressEvent`] and pushes it
//! into a bounded channel without ever blocking or failing; a
//! [`ProgressReporter`] task drains that channel and renders to the console at
//! its own pace.

use crate::console::Console;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Marker the engine puts in front of every progress line it emits.
pub const PROGRESS_LINE_PREFIX: &str = "mediagrab-progress ";
pub const PROGRESS_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Downloading,
    PostProcessing,
    Finished,
    Failed,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::PostProcessing => "post-processing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_index: usize,
    pub phase: Phase,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
    /// `bytes_total` came from the engine's estimate rather than a known size.
    pub total_is_estimate: bool,
    pub rate_bytes_per_sec: Option<f64>,
    pub rate_display: Option<String>,
    pub eta_seconds: Option<u64>,
    pub fragment: Option<(u64, u64)>,
    pub postprocessor: Option<String>,
}

impl ProgressEvent {
    fn bare(job_index: usize, phase: Phase) -> Self {
        Self {
            job_index,
            phase,
            bytes_done: None,
            bytes_total: None,
            total_is_estimate: false,
            rate_bytes_per_sec: None,
            rate_display: None,
            eta_seconds: None,
            fragment: None,
            postprocessor: None,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        if self.phase == Phase::Finished {
            return Some(100.0);
        }
        match (self.bytes_done, self.bytes_total) {
            (Some(done), Some(total)) if total > 0 => {
                Some((done as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// Progress dictionary as yt-dlp serializes it for `%(progress)j`. Sizes come
/// through as floats when estimated, so every number is read as `f64`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProgress {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub downloaded_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes_estimate: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub fragment_index: Option<f64>,
    #[serde(default)]
    pub fragment_count: Option<f64>,
    #[serde(default)]
    pub postprocessor: Option<String>,
}

#[derive(Default)]
struct AdapterState {
    phase: Option<Phase>,
    last_done: Option<u64>,
    last_total: Option<u64>,
    total_is_estimate: bool,
    dropped: u64,
}

/// Per-job translator handed to the engine.
pub struct ProgressAdapter {
    job_index: usize,
    tx: Option<mpsc::Sender<ProgressEvent>>,
    state: Mutex<AdapterState>,
}

impl ProgressAdapter {
    pub fn new(job_index: usize, tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            job_index,
            tx: Some(tx),
            state: Mutex::new(AdapterState::default()),
        }
    }

    /// Adapter that keeps state but publishes nowhere.
    pub fn detached(job_index: usize) -> Self {
        Self {
            job_index,
            tx: None,
            state: Mutex::new(AdapterState::default()),
        }
    }

    /// Feeds one line of engine output. Returns whether the line carried
    /// progress; anything else is engine chatter the caller may log.
    pub fn on_engine_line(&self, line: &str) -> bool {
        let Some(payload) = line.trim_start().strip_prefix(PROGRESS_LINE_PREFIX) else {
            return false;
        };
        match serde_json::from_str::<RawProgress>(payload.trim()) {
            Ok(raw) => self.on_engine_event(raw),
            Err(err) => debug!(job = self.job_index, "unreadable progress line: {err}"),
        }
        true
    }

    pub fn on_engine_event(&self, raw: RawProgress) {
        match self.translate(&raw) {
            Some(event) => self.publish(event),
            None => debug!(
                job = self.job_index,
                status = raw.status.as_deref().unwrap_or("<none>"),
                "ignoring progress event with unknown status"
            ),
        }
    }

    /// Publishes a phase the orchestrator knows about (queued, failed) without
    /// an engine event behind it.
    pub fn mark(&self, phase: Phase) {
        let event = {
            let mut state = self.state.lock();
            state.phase = Some(phase);
            let mut event = ProgressEvent::bare(self.job_index, phase);
            event.bytes_done = state.last_done;
            event.bytes_total = state.last_total;
            event.total_is_estimate = state.total_is_estimate;
            event
        };
        self.publish(event);
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase.unwrap_or(Phase::Pending)
    }

    pub fn saw_post_processing(&self) -> bool {
        matches!(self.state.lock().phase, Some(Phase::PostProcessing))
    }

    pub fn dropped_events(&self) -> u64 {
        self.state.lock().dropped
    }

    fn translate(&self, raw: &RawProgress) -> Option<ProgressEvent> {
        let status = raw.status.as_deref()?.trim().to_ascii_lowercase();
        let mut state = self.state.lock();

        if let Some(postprocessor) = raw.postprocessor.as_deref() {
            let phase = match status.as_str() {
                "started" | "processing" | "finished" => Phase::PostProcessing,
                "error" => Phase::Failed,
                _ => return None,
            };
            state.phase = Some(phase);
            let mut event = ProgressEvent::bare(self.job_index, phase);
            event.postprocessor = Some(postprocessor.to_string());
            event.bytes_done = state.last_done;
            event.bytes_total = state.last_total;
            event.total_is_estimate = state.total_is_estimate;
            return Some(event);
        }

        let phase = match status.as_str() {
            "downloading" => Phase::Downloading,
            "finished" => Phase::Finished,
            "error" => Phase::Failed,
            _ => return None,
        };

        let done = raw.downloaded_bytes.and_then(to_count);
        let (total, estimated) = match (
            raw.total_bytes.and_then(to_count),
            raw.total_bytes_estimate.and_then(to_count),
        ) {
            (Some(total), _) => (Some(total), false),
            (None, Some(estimate)) => (Some(estimate), true),
            (None, None) => (None, false),
        };

        let mut event = ProgressEvent::bare(self.job_index, phase);
        if phase == Phase::Finished {
            // Unknown-size streams only report what arrived; that is the total.
            let final_size = total.or(done).or(state.last_done).or(state.last_total);
            event.bytes_done = final_size;
            event.bytes_total = final_size;
            event.total_is_estimate = false;
        } else {
            event.bytes_done = done.or(state.last_done);
            event.bytes_total = total.or(state.last_total);
            event.total_is_estimate = if total.is_some() {
                estimated
            } else {
                state.total_is_estimate
            };
        }

        if phase == Phase::Downloading
            && let Some(speed) = raw.speed.filter(|speed| speed.is_finite() && *speed >= 0.0)
        {
            event.rate_bytes_per_sec = Some(speed);
            event.rate_display = Some(format_rate(speed));
        }
        if phase == Phase::Downloading {
            event.eta_seconds = raw.eta.and_then(to_count);
        }
        if let (Some(index), Some(count)) = (
            raw.fragment_index.and_then(to_count),
            raw.fragment_count.and_then(to_count),
        ) {
            event.fragment = Some((index, count));
        }

        state.phase = Some(phase);
        state.last_done = event.bytes_done;
        state.last_total = event.bytes_total;
        state.total_is_estimate = event.total_is_estimate;
        Some(event)
    }

    fn publish(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let mut state = self.state.lock();
                state.dropped += 1;
                trace!(
                    job = self.job_index,
                    phase = event.phase.label(),
                    dropped = state.dropped,
                    "progress queue full, dropping update"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn to_count(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0).then(|| value.round() as u64)
}

#[derive(Default)]
struct RenderState {
    phase: Option<Phase>,
    decile: Option<u8>,
    postprocessor: Option<String>,
}

/// Drains progress events and renders them. Prints phase changes, each new
/// postprocessor, and every tenth of download progress.
pub struct ProgressReporter;

impl ProgressReporter {
    pub fn spawn(mut rx: mpsc::Receiver<ProgressEvent>, console: Console) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut jobs: HashMap<usize, RenderState> = HashMap::new();
            while let Some(event) = rx.recv().await {
                let state = jobs.entry(event.job_index).or_default();
                if let Some(line) = render_update(state, &event) {
                    console.line(line);
                }
            }
        })
    }
}

fn render_update(state: &mut RenderState, event: &ProgressEvent) -> Option<String> {
    let phase_changed = state.phase != Some(event.phase);
    state.phase = Some(event.phase);

    match event.phase {
        Phase::Pending => None,
        Phase::Downloading => {
            // Each stream of a split video+audio download starts over.
            if phase_changed {
                state.decile = None;
            }
            let decile = event.percent().map(|pct| (pct / 10.0).floor() as u8);
            let advanced = decile.is_some() && decile > state.decile;
            if advanced {
                state.decile = decile;
            }
            (phase_changed || advanced).then(|| format!("  {}", describe_download(event)))
        }
        Phase::PostProcessing => {
            let step_changed = event.postprocessor.is_some()
                && event.postprocessor != state.postprocessor;
            if step_changed {
                state.postprocessor = event.postprocessor.clone();
            }
            (phase_changed || step_changed).then(|| match &event.postprocessor {
                Some(step) => format!("  post-processing: {step}"),
                None => "  post-processing".to_string(),
            })
        }
        Phase::Finished => phase_changed.then(|| match event.bytes_total {
            Some(total) => format!("  100% of {}", format_bytes(total)),
            None => "  100%".to_string(),
        }),
        Phase::Failed => phase_changed.then(|| "  failed".to_string()),
    }
}

fn describe_download(event: &ProgressEvent) -> String {
    let mut line = match event.percent() {
        Some(pct) => format!("{pct:5.1}%"),
        None => "  ?  %".to_string(),
    };
    if let Some(total) = event.bytes_total {
        let marker = if event.total_is_estimate { "~" } else { "" };
        line.push_str(&format!(" of {marker}{}", format_bytes(total)));
    } else if let Some(done) = event.bytes_done {
        line.push_str(&format!(" ({} so far)", format_bytes(done)));
    }
    if let Some(rate) = &event.rate_display {
        line.push_str(&format!(" at {rate}"));
    }
    if let Some(eta) = event.eta_seconds {
        line.push_str(&format!(", ETA {}", format_eta(eta)));
    }
    if let Some((index, count)) = event.fragment {
        line.push_str(&format!(" (frag {index}/{count})"));
    }
    line
}

/// Renders a byte count with binary units, e.g. `12.30MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0).round() as u64))
}

/// `MM:SS`, or `H:MM:SS` past the hour.
pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

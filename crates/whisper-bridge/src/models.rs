//! Model lifecycle operations driven through the worker script.
//!
//! All four operations are thin protocols over [`ProcessRunner`]: the worker
//! is invoked with a `--mode` discriminator and reports a single JSON object
//! on stdout. Downloads additionally stream `PROGRESS:`-prefixed JSON lines
//! on stderr and are the only cancellable operation.

use crate::process::{self, Invocation, ProcessOutput, ProcessRunner, KILL_GRACE};
use crate::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed prefix marking a progress line on the worker's stderr.
pub(crate) const PROGRESS_PREFIX: &str = "PROGRESS:";

/// Model downloads can legitimately take a long time; this only guards
/// against a hung worker.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);
const CHECK_FFMPEG_TIMEOUT: Duration = Duration::from_secs(15);

/// Worker payload for `--mode check` and the final download report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model: String,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub hf_repo: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub size_mb: Option<f64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Worker payload for `--mode list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListing {
    #[serde(default)]
    pub models: Vec<ModelStatus>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub success: bool,
}

/// Worker payload for `--mode delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReport {
    pub model: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub freed_bytes: Option<u64>,
    #[serde(default)]
    pub freed_mb: Option<f64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Worker payload for `--mode check-ffmpeg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegStatus {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One progress event from a streaming download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub speed_mbps: f64,
}

#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Completed(ModelStatus),
    /// The worker was stopped by an explicit cancel (or died to a signal);
    /// reported as an outcome rather than a failure.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Default)]
struct SessionState {
    pid: Option<u32>,
    cancel_requested: bool,
}

/// Tracks the single in-flight download so a cancel request can signal it.
/// At most one download is representable; callers serialize.
#[derive(Clone, Default)]
pub struct DownloadSession {
    state: Arc<Mutex<SessionState>>,
}

impl DownloadSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, pid: Option<u32>) {
        if let Ok(mut state) = self.state.lock() {
            state.pid = pid;
            state.cancel_requested = false;
        }
    }

    fn finish(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                state.pid = None;
                state.cancel_requested
            }
            Err(_) => false,
        }
    }

    fn active_pid(&self) -> Option<u32> {
        self.state.lock().ok().and_then(|state| state.pid)
    }

    fn request_cancel(&self) -> Option<u32> {
        match self.state.lock() {
            Ok(mut state) => {
                if state.pid.is_some() {
                    state.cancel_requested = true;
                }
                state.pid
            }
            Err(_) => None,
        }
    }

    /// Two-phase cancellation: graceful signal first so the worker can drop
    /// partially written model files, forced kill after the grace window.
    pub async fn cancel(&self) -> CancelOutcome {
        let Some(pid) = self.request_cancel() else {
            return CancelOutcome {
                success: false,
                message: "no model download in progress".to_string(),
            };
        };

        info!("cancelling model download (pid {pid})");
        process::send_term_signal(pid);
        tokio::time::sleep(KILL_GRACE).await;
        if self.active_pid() == Some(pid) {
            warn!("download worker ignored the termination signal, killing it");
            process::send_kill_signal(pid);
        }

        CancelOutcome {
            success: true,
            message: "download cancelled".to_string(),
        }
    }
}

/// Model operations bound to a resolved interpreter and worker script.
pub(crate) struct ModelOps<'a> {
    pub runner: &'a ProcessRunner,
    pub python: &'a Path,
    pub script: &'a Path,
    pub session: &'a DownloadSession,
}

impl ModelOps<'_> {
    fn invocation(&self, mode: &str, model: Option<&str>, timeout: Duration) -> Invocation {
        let mut invocation = Invocation::new(self.python)
            .arg(self.script)
            .arg("--mode")
            .arg(mode);
        if let Some(model) = model {
            invocation = invocation.arg("--model").arg(model);
        }
        invocation.timeout(timeout)
    }

    pub async fn download<F>(&self, model: &str, mut on_progress: F) -> Result<DownloadOutcome>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        info!("starting download of model {model}");
        let invocation = self.invocation("download", Some(model), DOWNLOAD_TIMEOUT);
        let session = self.session;

        let result = self
            .runner
            .run_streaming(
                invocation,
                |pid| session.begin(pid),
                |line| match parse_progress_line(line) {
                    ProgressLine::Event(progress) => {
                        on_progress(progress);
                        true
                    }
                    ProgressLine::Malformed => {
                        debug!("dropping malformed progress line");
                        true
                    }
                    ProgressLine::Other => false,
                },
            )
            .await;
        let cancelled = session.finish();

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if cancelled {
                    return Ok(DownloadOutcome::Cancelled);
                }
                return Err(e);
            }
        };
        resolve_download(output, cancelled)
    }

    pub async fn check(&self, model: &str) -> Result<ModelStatus> {
        self.query("check", Some(model)).await
    }

    pub async fn list(&self) -> Result<ModelListing> {
        self.query("list", None).await
    }

    pub async fn delete(&self, model: &str) -> Result<DeleteReport> {
        self.query("delete", Some(model)).await
    }

    /// The worker exits non-zero when ffmpeg is unavailable but still prints
    /// the status payload; prefer the payload over the exit code.
    pub async fn check_ffmpeg(&self) -> Result<FfmpegStatus> {
        let output = self
            .runner
            .run(self.invocation("check-ffmpeg", None, CHECK_FFMPEG_TIMEOUT))
            .await?;
        match parse_payload::<FfmpegStatus>(&output.stdout) {
            Ok(status) => Ok(status),
            Err(_) if !output.success() => Err(output.exit_error()),
            Err(e) => Err(e),
        }
    }

    async fn query<T: DeserializeOwned>(&self, mode: &str, model: Option<&str>) -> Result<T> {
        let output = self
            .runner
            .run(self.invocation(mode, model, QUERY_TIMEOUT))
            .await?;
        if !output.success() {
            return Err(output.exit_error());
        }
        parse_payload(&output.stdout)
    }
}

/// First stdout line that is a syntactically complete JSON object. The
/// worker's libraries print log noise around the payload, so the scan is
/// tolerant of leading and trailing garbage.
pub(crate) fn first_json_object_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|line| {
        line.starts_with('{')
            && line.ends_with('}')
            && serde_json::from_str::<serde_json::Value>(line).is_ok()
    })
}

pub(crate) fn parse_payload<T: DeserializeOwned>(stdout: &str) -> Result<T> {
    let line = first_json_object_line(stdout).ok_or_else(|| {
        BridgeError::MalformedOutput(format!(
            "no JSON object in worker output: {}",
            truncate(stdout, 200)
        ))
    })?;
    Ok(serde_json::from_str(line)?)
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > limit {
        let clipped: String = trimmed.chars().take(limit).collect();
        format!("{clipped}...")
    } else {
        trimmed.to_string()
    }
}

/// Map a finished download process to its outcome. A cancel request that
/// loses the race with a clean exit still counts as completed; only signal
/// deaths and post-cancel failures are "interrupted".
fn resolve_download(output: ProcessOutput, cancelled: bool) -> Result<DownloadOutcome> {
    if output.success() {
        return match parse_payload::<ModelStatus>(&output.stdout) {
            Ok(report) => Ok(DownloadOutcome::Completed(report)),
            Err(_) if cancelled => Ok(DownloadOutcome::Cancelled),
            Err(e) => Err(e),
        };
    }
    // A graceful or forced kill surfaces as a signal exit (no code).
    if cancelled || output.exit_code.is_none() {
        info!("model download interrupted by user");
        return Ok(DownloadOutcome::Cancelled);
    }
    Err(output.exit_error())
}

/// Classification of a single worker stderr line during a download.
#[derive(Debug)]
pub(crate) enum ProgressLine {
    Event(DownloadProgress),
    /// Carried the progress prefix but not a parseable payload; consumed
    /// so it never pollutes the diagnostics buffer.
    Malformed,
    Other,
}

pub(crate) fn parse_progress_line(line: &str) -> ProgressLine {
    let Some(payload) = line.trim().strip_prefix(PROGRESS_PREFIX) else {
        return ProgressLine::Other;
    };
    match serde_json::from_str(payload) {
        Ok(progress) => ProgressLine::Event(progress),
        Err(_) => ProgressLine::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse_the_json_remainder() {
        let line = r#"PROGRESS:{"type":"progress","model":"base","downloaded_bytes":1024,"total_bytes":2048,"percentage":50.0,"speed_mbps":8.5}"#;
        match parse_progress_line(line) {
            ProgressLine::Event(progress) => {
                assert_eq!(progress.model.as_deref(), Some("base"));
                assert_eq!(progress.downloaded_bytes, 1024);
                assert!((progress.percentage - 50.0).abs() < f64::EPSILON);
            }
            other => panic!("expected a progress event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_progress_lines_are_consumed_not_forwarded() {
        assert!(matches!(
            parse_progress_line("PROGRESS:not json at all"),
            ProgressLine::Malformed
        ));
        assert!(matches!(parse_progress_line("PROGRESS:"), ProgressLine::Malformed));
    }

    #[test]
    fn ordinary_stderr_lines_are_not_progress() {
        assert!(matches!(
            parse_progress_line("[MLX] Starting transcription"),
            ProgressLine::Other
        ));
        assert!(matches!(parse_progress_line(""), ProgressLine::Other));
    }

    fn finished(exit_code: Option<i32>, stdout: &str) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn clean_exit_with_a_payload_beats_a_racing_cancel() {
        let output = finished(Some(0), r#"{"model": "base", "downloaded": true, "success": true}"#);
        match resolve_download(output, true).unwrap() {
            DownloadOutcome::Completed(status) => assert_eq!(status.model, "base"),
            DownloadOutcome::Cancelled => panic!("completed download reported as cancelled"),
        }
    }

    #[test]
    fn signal_death_is_cancelled_even_without_a_recorded_request() {
        let outcome = resolve_download(finished(None, ""), false).unwrap();
        assert!(matches!(outcome, DownloadOutcome::Cancelled));
    }

    #[test]
    fn failed_exit_after_a_cancel_request_is_cancelled() {
        let outcome = resolve_download(finished(Some(1), ""), true).unwrap();
        assert!(matches!(outcome, DownloadOutcome::Cancelled));
    }

    #[test]
    fn failed_exit_without_a_cancel_is_an_error() {
        let err = resolve_download(finished(Some(1), ""), false).unwrap_err();
        assert!(matches!(err, BridgeError::ProcessExit { .. }));
    }

    #[test]
    fn payload_is_found_between_log_noise() {
        let stdout = "loading weights...\n{\"model\": \"base\", \"downloaded\": true, \"success\": true}\ntrailing noise";
        let status: ModelStatus = parse_payload(stdout).unwrap();
        assert_eq!(status.model, "base");
        assert!(status.downloaded);
        assert!(status.success);
    }

    #[test]
    fn missing_payload_is_a_malformed_output_error() {
        let err = parse_payload::<ModelStatus>("no json here\nstill none").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedOutput(_)));
    }

    #[test]
    fn listing_payload_round_trips() {
        let stdout = r#"{"models": [{"model": "tiny", "downloaded": false, "success": true}], "cache_dir": "/home/u/.cache/huggingface/hub", "success": true}"#;
        let listing: ModelListing = parse_payload(stdout).unwrap();
        assert_eq!(listing.models.len(), 1);
        assert_eq!(listing.models[0].model, "tiny");
        assert!(listing.cache_dir.as_deref().unwrap().contains("huggingface"));
    }

    #[test]
    fn session_tracks_a_single_download() {
        let session = DownloadSession::new();
        assert_eq!(session.active_pid(), None);

        session.begin(Some(4242));
        assert_eq!(session.active_pid(), Some(4242));
        assert_eq!(session.request_cancel(), Some(4242));

        let cancelled = session.finish();
        assert!(cancelled);
        assert_eq!(session.active_pid(), None);
    }

    #[tokio::test]
    async fn cancel_without_active_download_is_a_soft_failure() {
        let session = DownloadSession::new();
        let outcome = session.cancel().await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("no model download"));
    }
}

//! Local Whisper backend orchestration.
//!
//! The heavy lifting (transcription, model downloads) happens in an external
//! Python worker script. This crate's job is everything around it: finding a
//! usable Python 3 interpreter, installing the speech-recognition package into
//! it, locating the bundled or system ffmpeg decoder, and driving the worker
//! subprocess with timeouts, cancellation and structured output parsing.

use std::path::PathBuf;
use thiserror::Error;

pub mod backend;
pub mod ffmpeg;
pub mod install;
pub mod interpreter;
pub mod models;
pub mod pipeline;
pub mod process;

pub use backend::LocalBackend;
pub use ffmpeg::FfmpegLocation;
pub use install::{InstallAttempt, InstallPhase, InstallReport, InstallStrategy};
pub use models::{
    CancelOutcome, DeleteReport, DownloadOutcome, DownloadProgress, FfmpegStatus, ModelListing,
    ModelStatus,
};
pub use pipeline::{AudioInput, TranscribeOptions, Transcript};
pub use process::{CommandRunner, Invocation, ProcessOutput, ProcessRunner};

/// Environment variable naming an interpreter that should be tried first.
pub const PYTHON_OVERRIDE_ENV: &str = "WHISPER_BRIDGE_PYTHON";

/// Orchestrator-specific errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no usable Python 3 interpreter found: {0}")]
    InterpreterNotFound(String),

    #[error("ffmpeg unavailable: {0}")]
    DecoderUnavailable(String),

    #[error("dependency installation failed: {0}")]
    InstallFailed(String),

    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("failed to launch {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("worker exited with {code:?}: {stderr}")]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("malformed worker output: {0}")]
    MalformedOutput(String),

    #[error("download cancelled by user")]
    Cancelled,

    #[error("unsupported audio input: {0}")]
    UnsupportedAudio(String),

    #[error("empty audio: {0}")]
    EmptyAudio(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Configuration for the local backend.
///
/// Everything environment-specific lives here so tests can inject a fresh
/// instance instead of relying on module-level state.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Worker script invoked for transcription and model management.
    pub worker_script: PathBuf,
    /// GPU-accelerated worker variant, preferred when `gpu_available` is set.
    pub gpu_worker_script: Option<PathBuf>,
    /// Whether a GPU runtime was detected on this machine.
    pub gpu_available: bool,
    /// Explicit interpreter override, checked ahead of [`PYTHON_OVERRIDE_ENV`].
    pub python_override: Option<PathBuf>,
    /// ffmpeg binary shipped alongside the application, if any.
    pub bundled_ffmpeg: Option<PathBuf>,
    /// Resource directory of the packaged application bundle.
    pub resource_dir: Option<PathBuf>,
    /// True when running from a packaged bundle rather than a checkout.
    pub packaged: bool,
}

impl BridgeConfig {
    pub fn new(worker_script: impl Into<PathBuf>) -> Self {
        Self {
            worker_script: worker_script.into(),
            gpu_worker_script: None,
            gpu_available: false,
            python_override: None,
            bundled_ffmpeg: None,
            resource_dir: None,
            packaged: false,
        }
    }
}

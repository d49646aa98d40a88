//! Facade tying interpreter discovery, dependency installation, the decoder
//! overlay and the worker protocols together behind one handle.

use crate::ffmpeg::{self, FfmpegLocation};
use crate::install::{InstallReport, Installer};
use crate::models::{
    CancelOutcome, DeleteReport, DownloadOutcome, DownloadProgress, DownloadSession, FfmpegStatus,
    ModelListing, ModelOps, ModelStatus,
};
use crate::pipeline::{AudioInput, Pipeline, TranscribeOptions, Transcript};
use crate::process::ProcessRunner;
use crate::{interpreter, BridgeConfig, BridgeError, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One backend instance per configuration. The resolved interpreter and the
/// decoder location are cached for the lifetime of the instance; the
/// interpreter cache is invalidated after dependency installation because an
/// install can change which environment is preferable.
pub struct LocalBackend {
    config: BridgeConfig,
    python: Mutex<Option<PathBuf>>,
    ffmpeg: OnceLock<FfmpegLocation>,
    decoder_status: Mutex<Option<FfmpegStatus>>,
    session: DownloadSession,
}

impl LocalBackend {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            python: Mutex::new(None),
            ffmpeg: OnceLock::new(),
            decoder_status: Mutex::new(None),
            session: DownloadSession::new(),
        }
    }

    /// Decoder location, resolved once per instance.
    pub fn ffmpeg_location(&self) -> &FfmpegLocation {
        self.ffmpeg.get_or_init(|| ffmpeg::locate(&self.config))
    }

    fn runner(&self) -> ProcessRunner {
        ProcessRunner::new(self.ffmpeg_location().clone())
    }

    /// Worker script for the current hardware: the GPU variant when one is
    /// configured and a GPU runtime was detected.
    fn worker_script(&self) -> &Path {
        if self.config.gpu_available {
            if let Some(gpu) = &self.config.gpu_worker_script {
                return gpu;
            }
        }
        &self.config.worker_script
    }

    /// Resolve (and cache) the interpreter. `force` drops the cached result
    /// and probes the candidate list again.
    pub async fn resolve_python(&self, force: bool) -> Result<PathBuf> {
        let mut cached = self.python.lock().await;
        if !force {
            if let Some(python) = cached.as_ref() {
                debug!("reusing cached interpreter {}", python.display());
                return Ok(python.clone());
            }
        }
        let runner = self.runner();
        let python = interpreter::resolve(&runner, self.config.python_override.as_deref()).await?;
        *cached = Some(python.clone());
        Ok(python)
    }

    /// Transcribe a recording. Fails fast with [`BridgeError::DecoderUnavailable`]
    /// when the worker environment cannot see a usable ffmpeg, since whisper
    /// would otherwise fail late with an opaque decoder backtrace.
    pub async fn transcribe(
        &self,
        audio: AudioInput,
        options: &TranscribeOptions,
    ) -> Result<Transcript> {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        self.verify_decoder(&runner, &python).await?;

        let pipeline = Pipeline {
            runner: &runner,
            python: &python,
            script: self.worker_script(),
        };
        pipeline.transcribe(audio, options).await
    }

    /// Install the whisper package into the resolved interpreter, then
    /// re-resolve so a freshly usable environment is picked up.
    pub async fn install_dependency<F>(&self, on_progress: F) -> Result<InstallReport>
    where
        F: FnMut(&str) + Send,
    {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        let report = Installer::new(&runner, &python).install(on_progress).await?;
        info!("dependency installation finished, re-probing interpreters");
        self.resolve_python(true).await?;
        Ok(report)
    }

    pub async fn download_model<F>(&self, model: &str, on_progress: F) -> Result<DownloadOutcome>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        self.model_ops(&runner, &python)
            .download(model, on_progress)
            .await
    }

    /// Cancel the in-flight model download, if any. Never an error; callers
    /// get a soft failure when nothing is downloading.
    pub async fn cancel_download(&self) -> CancelOutcome {
        self.session.cancel().await
    }

    pub async fn check_model(&self, model: &str) -> Result<ModelStatus> {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        self.model_ops(&runner, &python).check(model).await
    }

    pub async fn list_models(&self) -> Result<ModelListing> {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        self.model_ops(&runner, &python).list().await
    }

    pub async fn delete_model(&self, model: &str) -> Result<DeleteReport> {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        self.model_ops(&runner, &python).delete(model).await
    }

    /// Ask the worker environment whether it can see a usable ffmpeg. Always
    /// probes fresh and refreshes the cached verdict used by [`Self::transcribe`].
    pub async fn check_ffmpeg(&self) -> Result<FfmpegStatus> {
        let python = self.resolve_python(false).await?;
        let runner = self.runner();
        let status = self.model_ops(&runner, &python).check_ffmpeg().await?;
        *self.decoder_status.lock().await = status.available.then(|| status.clone());
        Ok(status)
    }

    /// Decoder verification for the transcription hot path. The first
    /// successful check is cached so each transcription spawns one worker,
    /// not two; a failed check is never cached, so an ffmpeg installed
    /// mid-session is picked up on the next attempt.
    async fn verify_decoder(&self, runner: &ProcessRunner, python: &Path) -> Result<()> {
        {
            let cached = self.decoder_status.lock().await;
            if cached.as_ref().is_some_and(|status| status.available) {
                return Ok(());
            }
        }

        let status = self.model_ops(runner, python).check_ffmpeg().await?;
        if status.available {
            *self.decoder_status.lock().await = Some(status);
            return Ok(());
        }
        Err(BridgeError::DecoderUnavailable(
            status
                .error
                .unwrap_or_else(|| "worker environment reports no ffmpeg".to_string()),
        ))
    }

    fn model_ops<'a>(&'a self, runner: &'a ProcessRunner, python: &'a Path) -> ModelOps<'a> {
        ModelOps {
            runner,
            python,
            script: self.worker_script(),
            session: &self.session,
        }
    }
}

//! Transcription pipeline: audio materialization, worker invocation and
//! guaranteed temp-file cleanup.

use crate::models::first_json_object_line;
use crate::process::{Invocation, ProcessRunner};
use crate::{BridgeError, Result};
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TRANSCRIBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Audio handed to the backend, either raw bytes or a base64 payload as
/// produced by browser recorders.
#[derive(Debug, Clone)]
pub enum AudioInput {
    Bytes(Vec<u8>),
    Base64(String),
}

impl From<Vec<u8>> for AudioInput {
    fn from(bytes: Vec<u8>) -> Self {
        AudioInput::Bytes(bytes)
    }
}

impl From<&[u8]> for AudioInput {
    fn from(bytes: &[u8]) -> Self {
        AudioInput::Bytes(bytes.to_vec())
    }
}

impl AudioInput {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            AudioInput::Bytes(bytes) => Ok(bytes),
            AudioInput::Base64(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| BridgeError::UnsupportedAudio(format!("invalid base64 audio: {e}"))),
        }
    }
}

/// Per-request transcription options.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub model: String,
    /// ISO language hint; `None` lets the model auto-detect.
    pub language: Option<String>,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            language: None,
        }
    }
}

/// A finished transcription.
#[derive(Debug, Clone, PartialEq)]
pub enum Transcript {
    Text {
        text: String,
        /// Which engine produced the text, as reported by the worker.
        backend: Option<String>,
    },
    /// The worker ran but produced nothing usable (silence, noise-only
    /// audio). Not an error; callers typically show a gentle notice.
    NoSpeech { reason: String },
}

#[derive(Deserialize)]
struct WorkerTranscript {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    backend: Option<String>,
}

/// Extract the transcript from the worker's stdout. The worker prints exactly
/// one JSON object; anything around it is library noise.
pub(crate) fn parse_transcript(stdout: &str) -> Result<Transcript> {
    let line = first_json_object_line(stdout).ok_or_else(|| {
        BridgeError::MalformedOutput(format!(
            "worker printed no JSON transcript: {}",
            stdout.trim().chars().take(200).collect::<String>()
        ))
    })?;
    let payload: WorkerTranscript = serde_json::from_str(line)?;

    if !payload.success {
        return Ok(Transcript::NoSpeech {
            reason: payload
                .error
                .unwrap_or_else(|| "transcription produced no result".to_string()),
        });
    }
    match payload.text {
        Some(text) if !text.trim().is_empty() => Ok(Transcript::Text {
            text: text.trim().to_string(),
            backend: payload.backend,
        }),
        _ => Ok(Transcript::NoSpeech {
            reason: "no speech detected in the recording".to_string(),
        }),
    }
}

/// Transcription bound to a resolved interpreter and worker script.
pub(crate) struct Pipeline<'a> {
    pub runner: &'a ProcessRunner,
    pub python: &'a Path,
    pub script: &'a Path,
}

impl Pipeline<'_> {
    pub async fn transcribe(
        &self,
        audio: AudioInput,
        options: &TranscribeOptions,
    ) -> Result<Transcript> {
        let artifact = materialize(audio).await?;
        info!(
            "transcribing {} with model {}",
            artifact.display(),
            options.model
        );

        let result = self.invoke(&artifact, options).await;
        cleanup(&artifact).await;
        let output = result?;

        if !output.success() {
            return Err(output.exit_error());
        }
        parse_transcript(&output.stdout)
    }

    async fn invoke(
        &self,
        artifact: &Path,
        options: &TranscribeOptions,
    ) -> Result<crate::process::ProcessOutput> {
        let mut invocation = Invocation::new(self.python)
            .arg(self.script)
            .arg(artifact)
            .arg("--model")
            .arg(&options.model);
        if let Some(language) = &options.language {
            invocation = invocation.arg("--language").arg(language);
        }
        invocation = invocation
            .arg("--output-format")
            .arg("json")
            .timeout(TRANSCRIBE_TIMEOUT);
        self.runner.run(invocation).await
    }
}

/// Write the audio to a uniquely named temp file. Rejects empty input before
/// any subprocess is spawned.
pub(crate) async fn materialize(audio: AudioInput) -> Result<PathBuf> {
    let bytes = audio.into_bytes()?;
    if bytes.is_empty() {
        return Err(BridgeError::EmptyAudio(
            "recording contained no data".to_string(),
        ));
    }

    let path = std::env::temp_dir().join(format!(
        "whisper-bridge-{}-{}.wav",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&path, &bytes).await?;

    // Guard against a full disk silently truncating the recording.
    let written = tokio::fs::metadata(&path).await?.len();
    if written == 0 {
        cleanup(&path).await;
        return Err(BridgeError::EmptyAudio(format!(
            "temp file {} was written empty",
            path.display()
        )));
    }

    debug!("materialized {written} audio bytes at {}", path.display());
    Ok(path)
}

/// Remove the temp artifact. Failure is logged and swallowed; a leaked temp
/// file must never mask the transcription result.
pub(crate) async fn cleanup(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove temp audio {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_audio_decodes() {
        let input = AudioInput::Base64(
            base64::engine::general_purpose::STANDARD.encode(b"RIFF fake wav"),
        );
        assert_eq!(input.into_bytes().unwrap(), b"RIFF fake wav");
    }

    #[test]
    fn invalid_base64_is_unsupported_audio() {
        let err = AudioInput::Base64("!!! not base64 !!!".to_string())
            .into_bytes()
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAudio(_)));
    }

    #[tokio::test]
    async fn empty_audio_is_rejected_before_any_file_is_written() {
        let err = materialize(AudioInput::Bytes(Vec::new())).await.unwrap_err();
        assert!(matches!(err, BridgeError::EmptyAudio(_)));
    }

    #[tokio::test]
    async fn materialize_writes_a_unique_temp_file() {
        let first = materialize(AudioInput::Bytes(vec![1, 2, 3])).await.unwrap();
        let second = materialize(AudioInput::Bytes(vec![4, 5, 6])).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(tokio::fs::read(&first).await.unwrap(), vec![1, 2, 3]);

        cleanup(&first).await;
        cleanup(&second).await;
        assert!(!first.exists());
    }

    #[tokio::test]
    async fn cleanup_of_a_missing_file_is_silent() {
        cleanup(Path::new("/tmp/whisper-bridge-never-existed.wav")).await;
    }

    #[test]
    fn successful_payload_with_text() {
        let transcript = parse_transcript(
            r#"{"success": true, "text": "  hello world ", "backend": "mlx"}"#,
        )
        .unwrap();
        assert_eq!(
            transcript,
            Transcript::Text {
                text: "hello world".to_string(),
                backend: Some("mlx".to_string()),
            }
        );
    }

    #[test]
    fn blank_text_is_no_speech_not_an_error() {
        let transcript = parse_transcript(r#"{"success": true, "text": "   "}"#).unwrap();
        assert!(matches!(transcript, Transcript::NoSpeech { .. }));
    }

    #[test]
    fn worker_reported_failure_carries_its_reason() {
        let transcript =
            parse_transcript(r#"{"success": false, "error": "model not downloaded"}"#).unwrap();
        assert_eq!(
            transcript,
            Transcript::NoSpeech {
                reason: "model not downloaded".to_string(),
            }
        );
    }

    #[test]
    fn payload_is_extracted_from_library_noise() {
        let stdout = "UserWarning: FP16 is not supported on CPU\n{\"success\": true, \"text\": \"ok\"}\n";
        let transcript = parse_transcript(stdout).unwrap();
        assert!(matches!(transcript, Transcript::Text { .. }));
    }

    #[test]
    fn stdout_without_json_is_malformed() {
        let err = parse_transcript("Traceback (most recent call last):").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedOutput(_)));
    }
}

//! Command-line front end for the local Whisper backend.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use whisper_bridge::{
    AudioInput, BridgeConfig, DownloadOutcome, LocalBackend, TranscribeOptions, Transcript,
};

#[derive(Parser)]
#[command(name = "whisper-bridge", about = "Local Whisper backend orchestrator")]
struct Cli {
    /// Worker script driven for transcription and model management.
    #[arg(long, env = "WHISPER_BRIDGE_WORKER")]
    worker: PathBuf,

    /// GPU-accelerated worker variant.
    #[arg(long)]
    gpu_worker: Option<PathBuf>,

    /// Prefer the GPU worker when one is configured.
    #[arg(long)]
    gpu: bool,

    /// Python interpreter to try first.
    #[arg(long, env = "WHISPER_BRIDGE_PYTHON")]
    python: Option<PathBuf>,

    /// Bundled ffmpeg binary.
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe an audio file.
    Transcribe {
        audio: PathBuf,
        #[arg(long, default_value = "base")]
        model: String,
        /// ISO language hint; omit for auto-detection.
        #[arg(long)]
        language: Option<String>,
    },
    /// Install the openai-whisper package into the resolved interpreter.
    Install,
    /// Download a model into the local cache.
    Download { model: String },
    /// Report whether a model is downloaded.
    Check { model: String },
    /// List models and their download state.
    List,
    /// Delete a downloaded model.
    Delete { model: String },
    /// Report the resolved interpreter and decoder environment.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = BridgeConfig::new(&cli.worker);
    config.gpu_worker_script = cli.gpu_worker.clone();
    config.gpu_available = cli.gpu;
    config.python_override = cli.python.clone();
    config.bundled_ffmpeg = cli.ffmpeg.clone();
    let backend = LocalBackend::new(config);

    match cli.command {
        Command::Transcribe {
            audio,
            model,
            language,
        } => {
            let bytes = std::fs::read(&audio)
                .with_context(|| format!("failed to read {}", audio.display()))?;
            let options = TranscribeOptions { model, language };
            match backend.transcribe(AudioInput::Bytes(bytes), &options).await? {
                Transcript::Text {
                    text,
                    backend: engine,
                } => {
                    if let Some(engine) = engine {
                        tracing::info!("transcribed with the {engine} engine");
                    }
                    println!("{text}");
                }
                Transcript::NoSpeech { reason } => {
                    eprintln!("no speech detected: {reason}");
                }
            }
        }
        Command::Install => {
            let report = backend
                .install_dependency(|phase| eprintln!("{phase}..."))
                .await?;
            eprintln!(
                "installed after {} package attempt(s)",
                report.package_attempts()
            );
        }
        Command::Download { model } => {
            let outcome = backend
                .download_model(&model, |progress| {
                    eprintln!(
                        "{model}: {:.1}% ({:.1} MB/s)",
                        progress.percentage, progress.speed_mbps
                    );
                })
                .await?;
            match outcome {
                DownloadOutcome::Completed(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                DownloadOutcome::Cancelled => eprintln!("download cancelled"),
            }
        }
        Command::Check { model } => {
            let status = backend.check_model(&model).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::List => {
            let listing = backend.list_models().await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Delete { model } => {
            let report = backend.delete_model(&model).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Doctor => {
            let location = backend.ffmpeg_location();
            println!(
                "ffmpeg: {} ({})",
                location.path.display(),
                if location.bundled { "bundled" } else { "system" }
            );
            let python = backend.resolve_python(false).await?;
            println!("python: {}", python.display());
            let status = backend.check_ffmpeg().await?;
            println!(
                "worker decoder check: {}",
                if status.available {
                    "ok".to_string()
                } else {
                    format!(
                        "unavailable ({})",
                        status.error.as_deref().unwrap_or("no detail")
                    )
                }
            );
        }
    }

    Ok(())
}

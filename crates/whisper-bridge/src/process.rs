//! Generic subprocess execution for worker invocations and toolchain probes.
//!
//! Every external process goes through [`ProcessRunner`]: it applies the
//! decoder environment overlay, captures both output streams as they arrive,
//! races a single timeout against the natural exit, and classifies spawn
//! failures separately from non-zero exits.

use crate::ffmpeg::FfmpegLocation;
use crate::{BridgeError, Result, PYTHON_OVERRIDE_ENV};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::warn;

/// Grace window between the polite termination signal and the forced kill.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(3);

/// How long to keep reading a pipe after the child has exited. Descendants
/// the worker spawned inherit the pipe and can hold it open well past the
/// worker's own death; completion is gated on exit, not EOF.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// One subprocess invocation: command, argument vector, extra environment
/// and an overall timeout.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, OsString)>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Classified error for a non-zero exit, carrying the captured
    /// diagnostics. Appends a remediation hint when the stderr looks like a
    /// decoder failure rather than a worker bug.
    pub fn exit_error(&self) -> BridgeError {
        let mut stderr = self.stderr.trim().to_string();
        if stderr.is_empty() {
            stderr = self.stdout.trim().to_string();
        }
        if looks_like_decoder_failure(&stderr) {
            stderr.push_str(
                "\nhint: ffmpeg could not decode the audio; reinstall the bundled ffmpeg or install ffmpeg on PATH",
            );
        }
        BridgeError::ProcessExit {
            code: self.exit_code,
            stderr,
        }
    }
}

pub(crate) fn looks_like_decoder_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["ffmpeg", "audioread", "nobackenderror"]
        .iter()
        .any(|sig| lower.contains(sig))
}

/// Seam for anything that needs to run a subprocess and read its output.
/// Production code uses [`ProcessRunner`]; tests substitute scripted runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: Invocation) -> Result<ProcessOutput>;
}

/// Runs invocations with the decoder environment overlay applied.
pub struct ProcessRunner {
    ffmpeg: FfmpegLocation,
}

impl ProcessRunner {
    pub fn new(ffmpeg: FfmpegLocation) -> Self {
        Self { ffmpeg }
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.command);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in decoder_env(&self.ffmpeg) {
            cmd.env(key, value);
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        self.build_command(invocation)
            .spawn()
            .map_err(|e| classify_spawn_error(&invocation.command, e))
    }

    /// Run to completion, accumulating both streams as they arrive.
    pub async fn run(&self, invocation: Invocation) -> Result<ProcessOutput> {
        let mut child = self.spawn(&invocation)?;
        let stdout = collect_stream(child.stdout.take());
        let stderr = collect_stream(child.stderr.take());

        let status = if let Some(limit) = invocation.timeout {
            let waited = tokio::time::timeout(limit, child.wait()).await;
            match waited {
                Ok(status) => status?,
                Err(_) => {
                    warn!(
                        "{} exceeded its {}s timeout, terminating",
                        invocation.command.display(),
                        limit.as_secs()
                    );
                    terminate(&mut child, KILL_GRACE).await;
                    stdout.abort();
                    stderr.abort();
                    return Err(BridgeError::Timeout {
                        command: invocation.command.display().to_string(),
                        seconds: limit.as_secs(),
                    });
                }
            }
        } else {
            child.wait().await?
        };

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: stdout.into_string(PIPE_DRAIN_GRACE).await,
            stderr: stderr.into_string(PIPE_DRAIN_GRACE).await,
        })
    }

    /// Run while forwarding stderr lines to `on_stderr_line` as they arrive.
    ///
    /// `on_spawn` receives the child pid immediately after spawn so the caller
    /// can register it for cancellation. `on_stderr_line` returns `true` when
    /// it consumed the line; unconsumed lines accumulate as diagnostics.
    pub async fn run_streaming<S, F>(
        &self,
        invocation: Invocation,
        on_spawn: S,
        mut on_stderr_line: F,
    ) -> Result<ProcessOutput>
    where
        S: FnOnce(Option<u32>) + Send,
        F: FnMut(&str) -> bool + Send,
    {
        let mut child = self.spawn(&invocation)?;
        on_spawn(child.id());
        let stdout = collect_stream(child.stdout.take());
        let mut lines = child.stderr.take().map(|s| BufReader::new(s).lines());

        let io = async {
            let mut stderr_buf = String::new();
            let mut eof = lines.is_none();

            // Forward lines until the child exits. Exit wins the race: a
            // descendant holding the pipe open must not postpone completion.
            let status = loop {
                let Some(reader) = lines.as_mut().filter(|_| !eof) else {
                    break child.wait().await?;
                };
                tokio::select! {
                    status = child.wait() => break status?,
                    next = reader.next_line() => match next {
                        Ok(Some(line)) => {
                            if !on_stderr_line(&line) {
                                stderr_buf.push_str(&line);
                                stderr_buf.push('\n');
                            }
                        }
                        _ => eof = true,
                    },
                }
            };

            // Bounded drain of whatever the child flushed before exiting.
            if !eof {
                if let Some(reader) = lines.as_mut() {
                    let drain = async {
                        while let Ok(Some(line)) = reader.next_line().await {
                            if !on_stderr_line(&line) {
                                stderr_buf.push_str(&line);
                                stderr_buf.push('\n');
                            }
                        }
                    };
                    let _ = tokio::time::timeout(PIPE_DRAIN_GRACE, drain).await;
                }
            }
            Ok::<_, BridgeError>((status, stderr_buf))
        };

        let waited = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, io).await.ok(),
            None => Some(io.await),
        };

        let (status, stderr_buf) = match waited {
            Some(result) => result?,
            None => {
                warn!(
                    "{} exceeded its {}s timeout, terminating",
                    invocation.command.display(),
                    invocation.timeout.unwrap_or_default().as_secs()
                );
                terminate(&mut child, KILL_GRACE).await;
                stdout.abort();
                return Err(BridgeError::Timeout {
                    command: invocation.command.display().to_string(),
                    seconds: invocation.timeout.unwrap_or_default().as_secs(),
                });
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: stdout.into_string(PIPE_DRAIN_GRACE).await,
            stderr: stderr_buf,
        })
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: Invocation) -> Result<ProcessOutput> {
        ProcessRunner::run(self, invocation).await
    }
}

/// Incremental capture of one output stream. The bytes land in a shared
/// buffer so the collected prefix survives even when the pipe never reaches
/// EOF within the drain grace.
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: tokio::task::JoinHandle<()>,
}

impl StreamCapture {
    fn abort(&self) {
        self.task.abort();
    }

    /// Wait for EOF at most `grace` past the child's exit, then hand back
    /// whatever arrived.
    async fn into_string(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            self.task.abort();
        }
        let bytes = match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(_) => Vec::new(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn collect_stream<R>(stream: Option<R>) -> StreamCapture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let task = tokio::spawn({
        let buf = Arc::clone(&buf);
        async move {
            let Some(mut stream) = stream else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = buf.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        }
    });
    StreamCapture { buf, task }
}

fn classify_spawn_error(command: &Path, err: std::io::Error) -> BridgeError {
    let message = if err.kind() == ErrorKind::NotFound {
        format!(
            "executable not found; install Python 3, point {PYTHON_OVERRIDE_ENV} at a working \
             interpreter, or switch transcription to the cloud backend"
        )
    } else {
        err.to_string()
    };
    BridgeError::Spawn {
        command: command.display().to_string(),
        message,
    }
}

/// Ask the child to exit politely, then force-kill after the grace window.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_term_signal(pid);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
pub(crate) fn send_term_signal(pid: u32) {
    // Polite stop so the worker can drop partially written model files.
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .output();
}

#[cfg(unix)]
pub(crate) fn send_kill_signal(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .output();
}

#[cfg(not(unix))]
pub(crate) fn send_term_signal(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output();
}

#[cfg(not(unix))]
pub(crate) fn send_kill_signal(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

/// Environment overlay injected into every worker invocation: the decoder
/// path under three redundant variable names plus an augmented search path.
pub(crate) fn decoder_env(ffmpeg: &FfmpegLocation) -> Vec<(String, OsString)> {
    let decoder: OsString = ffmpeg.path.as_os_str().to_os_string();
    vec![
        ("FFMPEG_PATH".to_string(), decoder.clone()),
        ("FFMPEG_EXECUTABLE".to_string(), decoder.clone()),
        ("FFMPEG_BINARY".to_string(), decoder),
        ("PATH".to_string(), augmented_path(ffmpeg)),
    ]
}

fn augmented_path(ffmpeg: &FfmpegLocation) -> OsString {
    let current = std::env::var_os("PATH").unwrap_or_default();
    augmented_path_from(&current, ffmpeg)
}

fn augmented_path_from(current: &std::ffi::OsStr, ffmpeg: &FfmpegLocation) -> OsString {
    let mut entries: Vec<PathBuf> = std::env::split_paths(current).collect();
    if let Some(dir) = ffmpeg.path.parent() {
        if !dir.as_os_str().is_empty() && !entries.iter().any(|e| e == dir) {
            entries.insert(0, dir.to_path_buf());
        }
    }

    // GUI-launched processes on macOS inherit a minimal environment; make
    // sure the usual binary directories are reachable.
    #[cfg(target_os = "macos")]
    {
        for extra in [
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/usr/bin",
            "/bin",
            "/usr/sbin",
            "/sbin",
        ] {
            let extra = PathBuf::from(extra);
            if !entries.iter().any(|e| e == &extra) {
                entries.push(extra);
            }
        }
    }

    std::env::join_paths(entries).unwrap_or_else(|_| current.to_os_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundled(path: &str) -> FfmpegLocation {
        FfmpegLocation {
            path: PathBuf::from(path),
            bundled: true,
        }
    }

    #[test]
    fn decoder_env_sets_all_three_variables() {
        let env = decoder_env(&bundled("/opt/app/resources/ffmpeg"));
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"FFMPEG_PATH"));
        assert!(keys.contains(&"FFMPEG_EXECUTABLE"));
        assert!(keys.contains(&"FFMPEG_BINARY"));
        assert!(keys.contains(&"PATH"));
        for (key, value) in &env {
            if key.starts_with("FFMPEG") {
                assert_eq!(value.to_string_lossy(), "/opt/app/resources/ffmpeg");
            }
        }
    }

    #[test]
    fn augmented_path_prepends_decoder_dir_once() {
        let ffmpeg = bundled("/opt/app/resources/ffmpeg");
        let current = std::ffi::OsString::from("/usr/bin:/bin");
        let augmented = augmented_path_from(&current, &ffmpeg);
        let entries: Vec<PathBuf> = std::env::split_paths(&augmented).collect();
        assert_eq!(entries[0], PathBuf::from("/opt/app/resources"));

        // Already-present directories are not duplicated.
        let again = augmented_path_from(&augmented, &ffmpeg);
        let entries: Vec<PathBuf> = std::env::split_paths(&again).collect();
        let count = entries
            .iter()
            .filter(|e| **e == PathBuf::from("/opt/app/resources"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn decoder_failure_signatures() {
        assert!(looks_like_decoder_failure("ffmpeg: command not found"));
        assert!(looks_like_decoder_failure(
            "audioread.exceptions.NoBackendError"
        ));
        assert!(!looks_like_decoder_failure("ModuleNotFoundError: whisper"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn runner() -> ProcessRunner {
            ProcessRunner::new(FfmpegLocation {
                path: PathBuf::from("ffmpeg"),
                bundled: false,
            })
        }

        #[tokio::test]
        async fn captures_stdout_and_stderr() {
            let output = runner()
                .run(
                    Invocation::new("sh")
                        .arg("-c")
                        .arg("echo out; echo err >&2")
                        .timeout(Duration::from_secs(10)),
                )
                .await
                .unwrap();
            assert_eq!(output.exit_code, Some(0));
            assert_eq!(output.stdout.trim(), "out");
            assert_eq!(output.stderr.trim(), "err");
        }

        #[tokio::test]
        async fn nonzero_exit_is_not_a_spawn_error() {
            let output = runner()
                .run(
                    Invocation::new("sh")
                        .arg("-c")
                        .arg("echo boom >&2; exit 42")
                        .timeout(Duration::from_secs(10)),
                )
                .await
                .unwrap();
            assert_eq!(output.exit_code, Some(42));
            match output.exit_error() {
                BridgeError::ProcessExit { code, stderr } => {
                    assert_eq!(code, Some(42));
                    assert!(stderr.contains("boom"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn missing_executable_is_a_spawn_error() {
            let err = runner()
                .run(Invocation::new("whisper-bridge-no-such-binary"))
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Spawn { .. }));
        }

        #[tokio::test]
        async fn timeout_terminates_the_child() {
            let err = runner()
                .run(
                    Invocation::new("sh")
                        .arg("-c")
                        .arg("sleep 30")
                        .timeout(Duration::from_millis(200)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Timeout { .. }));
        }

        #[tokio::test]
        async fn completion_is_gated_on_exit_not_pipe_eof() {
            let started = std::time::Instant::now();
            let output = runner()
                .run(
                    Invocation::new("sh")
                        .arg("-c")
                        .arg("sleep 30 & echo done")
                        .timeout(Duration::from_secs(10)),
                )
                .await
                .unwrap();
            assert_eq!(output.exit_code, Some(0));
            assert!(output.stdout.contains("done"));
            // The background child inherits the pipes; returning must not
            // wait for it.
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn streaming_completion_survives_an_inherited_stderr_pipe() {
            let started = std::time::Instant::now();
            let output = runner()
                .run_streaming(
                    Invocation::new("sh")
                        .arg("-c")
                        .arg("echo keep >&2; sleep 30 & echo payload")
                        .timeout(Duration::from_secs(10)),
                    |pid| assert!(pid.is_some()),
                    |_| false,
                )
                .await
                .unwrap();
            assert_eq!(output.exit_code, Some(0));
            assert_eq!(output.stdout.trim(), "payload");
            assert!(output.stderr.contains("keep"));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn streaming_forwards_stderr_lines() {
            let output = runner()
                .run_streaming(
                    Invocation::new("sh")
                        .arg("-c")
                        .arg("echo keep >&2; echo drop-me >&2; echo payload")
                        .timeout(Duration::from_secs(10)),
                    |pid| assert!(pid.is_some()),
                    |line| line == "drop-me",
                )
                .await
                .unwrap();
            assert_eq!(output.exit_code, Some(0));
            assert_eq!(output.stdout.trim(), "payload");
            assert_eq!(output.stderr.trim(), "keep");
        }
    }
}

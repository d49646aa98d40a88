//! Python interpreter discovery and validation.
//!
//! Candidates are tried strictly in priority order; the first one that
//! reports a supported version wins. Absolute paths are skipped without
//! spawning when they do not exist; bare names are validated only by
//! invocation so PATH resolution stays with the OS.

use crate::process::{CommandRunner, Invocation};
use crate::{BridgeError, Result, PYTHON_OVERRIDE_ENV};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Most recent CPython minors probed via versioned executable names.
const RECENT_MINORS: [u32; 3] = [12, 11, 10];

/// Parse `major.minor` out of a `Python X.Y[.Z]` banner (stdout or stderr,
/// case-insensitive; old interpreters print the banner on stderr).
pub fn parse_python_version(output: &str) -> Option<(u32, u32)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)python\s+(\d+)\.(\d+)").expect("version pattern"));
    let caps = re.captures(output)?;
    let major = caps[1].parse().ok()?;
    let minor = caps[2].parse().ok()?;
    Some((major, minor))
}

pub fn is_supported(version: (u32, u32)) -> bool {
    version.0 == 3
}

/// Ordered, de-duplicated candidate list for the current platform.
pub fn candidates(override_path: Option<&Path>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    if let Some(path) = override_path {
        push_unique(&mut out, path.display().to_string());
    }
    if let Ok(env_override) = std::env::var(PYTHON_OVERRIDE_ENV) {
        if !env_override.trim().is_empty() {
            push_unique(&mut out, env_override);
        }
    }

    #[cfg(windows)]
    {
        push_unique(&mut out, "py".to_string());
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            let local = PathBuf::from(local);
            for name in ["python.exe", "python3.exe"] {
                push_unique(
                    &mut out,
                    local
                        .join("Microsoft")
                        .join("WindowsApps")
                        .join(name)
                        .display()
                        .to_string(),
                );
            }
            for minor in RECENT_MINORS {
                push_unique(
                    &mut out,
                    local
                        .join("Programs")
                        .join("Python")
                        .join(format!("Python3{minor}"))
                        .join("python.exe")
                        .display()
                        .to_string(),
                );
            }
        }
        for minor in RECENT_MINORS {
            push_unique(&mut out, format!("C:\\Python3{minor}\\python.exe"));
        }
    }

    if let Some(home) = dirs::home_dir() {
        for name in ["python3", "python"] {
            push_unique(
                &mut out,
                home.join(".pyenv")
                    .join("shims")
                    .join(name)
                    .display()
                    .to_string(),
            );
        }
    }

    push_unique(&mut out, "python3".to_string());
    push_unique(&mut out, "python".to_string());
    for minor in RECENT_MINORS {
        push_unique(&mut out, format!("python3.{minor}"));
    }
    for prefix in ["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"] {
        push_unique(&mut out, format!("{prefix}/python3"));
        for minor in RECENT_MINORS {
            push_unique(&mut out, format!("{prefix}/python3.{minor}"));
        }
    }

    out
}

fn push_unique(list: &mut Vec<String>, candidate: String) {
    if !list.contains(&candidate) {
        list.push(candidate);
    }
}

/// Resolve the first supported interpreter from the platform candidate list.
pub async fn resolve(
    runner: &dyn CommandRunner,
    override_path: Option<&Path>,
) -> Result<PathBuf> {
    resolve_from(runner, candidates(override_path)).await
}

pub(crate) async fn resolve_from(
    runner: &dyn CommandRunner,
    candidates: Vec<String>,
) -> Result<PathBuf> {
    let mut probed = 0usize;
    for candidate in candidates {
        let path = Path::new(&candidate);
        if path.is_absolute() && !path.exists() {
            debug!("skipping missing interpreter candidate {candidate}");
            continue;
        }

        probed += 1;
        match probe(runner, &candidate).await {
            Some(version) if is_supported(version) => {
                info!(
                    "resolved python {}.{} via candidate {candidate}",
                    version.0, version.1
                );
                return Ok(PathBuf::from(candidate));
            }
            Some((major, minor)) => {
                debug!("rejecting {candidate}: python {major}.{minor} is unsupported");
            }
            None => debug!("candidate {candidate} failed the version probe"),
        }
    }

    Err(BridgeError::InterpreterNotFound(format!(
        "probed {probed} candidates without finding Python 3; install Python 3 or set \
         {PYTHON_OVERRIDE_ENV} to a working interpreter"
    )))
}

async fn probe(runner: &dyn CommandRunner, candidate: &str) -> Option<(u32, u32)> {
    let invocation = Invocation::new(candidate)
        .arg("--version")
        .timeout(PROBE_TIMEOUT);
    let output = runner.run(invocation).await.ok()?;
    let combined = format!("{} {}", output.stdout, output.stderr);
    parse_python_version(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MappedRunner {
        responses: HashMap<String, ProcessOutput>,
        probed: Mutex<Vec<String>>,
    }

    impl MappedRunner {
        fn new(responses: &[(&str, &str)]) -> Self {
            let responses = responses
                .iter()
                .map(|(cmd, banner)| {
                    (
                        cmd.to_string(),
                        ProcessOutput {
                            exit_code: Some(0),
                            stdout: banner.to_string(),
                            stderr: String::new(),
                        },
                    )
                })
                .collect();
            Self {
                responses,
                probed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for MappedRunner {
        async fn run(&self, invocation: Invocation) -> Result<ProcessOutput> {
            let command = invocation.command.display().to_string();
            self.probed.lock().unwrap().push(command.clone());
            self.responses
                .get(&command)
                .cloned()
                .ok_or_else(|| BridgeError::Spawn {
                    command,
                    message: "not found".into(),
                })
        }
    }

    #[test]
    fn parses_version_banners() {
        assert_eq!(parse_python_version("Python 3.11.4"), Some((3, 11)));
        assert_eq!(parse_python_version("python 2.7.18"), Some((2, 7)));
        assert_eq!(
            parse_python_version("noise\nPython 3.9.0b1\nmore"),
            Some((3, 9))
        );
        assert_eq!(parse_python_version("zsh: command not found"), None);
    }

    #[test]
    fn only_major_three_is_supported() {
        assert!(is_supported((3, 9)));
        assert!(is_supported((3, 13)));
        assert!(!is_supported((2, 7)));
        assert!(!is_supported((4, 0)));
    }

    #[test]
    fn candidate_list_is_deduplicated() {
        let list = candidates(Some(Path::new("python3")));
        let occurrences = list.iter().filter(|c| c.as_str() == "python3").count();
        assert_eq!(occurrences, 1);
        assert_eq!(list[0], "python3");
    }

    #[test]
    fn override_comes_first() {
        let list = candidates(Some(Path::new("/custom/python")));
        assert_eq!(list[0], "/custom/python");
    }

    #[tokio::test]
    async fn first_supported_candidate_wins() {
        let runner = MappedRunner::new(&[
            ("a", "Python 2.7.18"),
            ("b", "Python 3.9.2"),
            ("c", "Python 3.11.5"),
        ]);
        let resolved = resolve_from(
            &runner,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(resolved, PathBuf::from("b"));
        // Resolution is sequential: once b validated, c is never probed.
        assert_eq!(*runner.probed.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_absolute_candidates_are_never_spawned() {
        let runner = MappedRunner::new(&[("python3", "Python 3.10.1")]);
        let resolved = resolve_from(
            &runner,
            vec![
                "/nonexistent/interpreter/python3".to_string(),
                "python3".to_string(),
            ],
        )
        .await
        .unwrap();
        assert_eq!(resolved, PathBuf::from("python3"));
        assert_eq!(*runner.probed.lock().unwrap(), vec!["python3"]);
    }

    #[tokio::test]
    async fn exhausting_candidates_fails_with_guidance() {
        let runner = MappedRunner::new(&[("old", "Python 2.6.9")]);
        let err = resolve_from(&runner, vec!["old".to_string(), "gone".to_string()])
            .await
            .unwrap_err();
        match err {
            BridgeError::InterpreterNotFound(message) => {
                assert!(message.contains("probed 2 candidates"));
                assert!(message.contains(PYTHON_OVERRIDE_ENV));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

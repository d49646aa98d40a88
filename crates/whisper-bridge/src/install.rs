//! Layered pip installation with failure-classified fallbacks.
//!
//! Each failed attempt is classified from its sanitized diagnostics and
//! escalates to the next distinct strategy; a strategy is never retried.
//! The classification rules are data-driven so they can be tested apart
//! from the install flow.

use crate::process::{CommandRunner, Invocation};
use crate::{BridgeError, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Package installed into the interpreter environment.
pub const WHISPER_PACKAGE: &str = "openai-whisper";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    Standard,
    User,
    Legacy,
    UserLegacy,
}

impl InstallStrategy {
    fn flags(self) -> &'static [&'static str] {
        match self {
            InstallStrategy::Standard => &[],
            InstallStrategy::User => &["--user"],
            InstallStrategy::Legacy => &["--use-deprecated=legacy-resolver"],
            InstallStrategy::UserLegacy => &["--user", "--use-deprecated=legacy-resolver"],
        }
    }

    pub fn user_scoped(self) -> bool {
        matches!(self, InstallStrategy::User | InstallStrategy::UserLegacy)
    }

    pub fn legacy_resolver(self) -> bool {
        matches!(self, InstallStrategy::Legacy | InstallStrategy::UserLegacy)
    }

    pub fn label(self) -> &'static str {
        match self {
            InstallStrategy::Standard => "standard",
            InstallStrategy::User => "user-scoped",
            InstallStrategy::Legacy => "legacy-resolver",
            InstallStrategy::UserLegacy => "user-scoped legacy-resolver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    PipUpgrade,
    Package,
}

/// One entry in the escalation chain.
#[derive(Debug, Clone)]
pub struct InstallAttempt {
    pub phase: InstallPhase,
    pub strategy: InstallStrategy,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub attempts: Vec<InstallAttempt>,
}

impl InstallReport {
    pub fn package_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.phase == InstallPhase::Package)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    Permission,
    Resolver,
    Other,
}

pub(crate) struct ClassifyRule {
    pub signatures: &'static [&'static str],
    pub class: FailureClass,
}

/// Evaluated in order; the first matching rule wins.
pub(crate) const CLASSIFY_RULES: [ClassifyRule; 2] = [
    ClassifyRule {
        signatures: &[
            "permission denied",
            "access is denied",
            "errno 13",
            "externally-managed-environment",
            "pep 668",
            "--break-system-packages",
        ],
        class: FailureClass::Permission,
    },
    ClassifyRule {
        signatures: &[
            "resolutionimpossible",
            "legacy-resolver",
            "error parsing dependencies",
            "invalid pyproject.toml",
        ],
        class: FailureClass::Resolver,
    },
];

pub(crate) fn classify_failure(text: &str) -> FailureClass {
    let sanitized = strip_ansi(text).to_lowercase();
    for rule in &CLASSIFY_RULES {
        if rule.signatures.iter().any(|sig| sanitized.contains(sig)) {
            return rule.class;
        }
    }
    FailureClass::Other
}

/// Next distinct strategy for a classified failure, or `None` when the
/// escalation chain is exhausted for that class.
pub(crate) fn next_strategy(
    current: InstallStrategy,
    class: FailureClass,
) -> Option<InstallStrategy> {
    match class {
        FailureClass::Permission if !current.user_scoped() => Some(if current.legacy_resolver() {
            InstallStrategy::UserLegacy
        } else {
            InstallStrategy::User
        }),
        FailureClass::Resolver if !current.legacy_resolver() => Some(if current.user_scoped() {
            InstallStrategy::UserLegacy
        } else {
            InstallStrategy::Legacy
        }),
        _ => None,
    }
}

pub(crate) fn strip_ansi(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern"));
    re.replace_all(text, "").into_owned()
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("unknown pip error")
}

/// Reformat a terminal failure into an actionable message.
fn reformat_failure(text: &str) -> String {
    let sanitized = strip_ansi(text);
    let lower = sanitized.to_lowercase();
    if lower.contains("microsoft visual c++") {
        return format!(
            "Microsoft Visual C++ Build Tools are required to build {WHISPER_PACKAGE}; install \
             them from the Visual Studio installer and retry"
        );
    }
    if lower.contains("no matching distribution") {
        return format!(
            "no {WHISPER_PACKAGE} release matches this Python version; install Python 3.10-3.12 \
             and retry ({})",
            first_line(&sanitized)
        );
    }
    sanitized.trim().to_string()
}

pub struct Installer<'a> {
    runner: &'a dyn CommandRunner,
    python: &'a Path,
    entry: InstallStrategy,
}

impl<'a> Installer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, python: &'a Path) -> Self {
        // The macOS system interpreter commonly rejects unscoped installs
        // outright, so user scope is the entry point there.
        let entry = if cfg!(target_os = "macos") {
            InstallStrategy::User
        } else {
            InstallStrategy::Standard
        };
        Self::with_entry(runner, python, entry)
    }

    pub(crate) fn with_entry(
        runner: &'a dyn CommandRunner,
        python: &'a Path,
        entry: InstallStrategy,
    ) -> Self {
        Self {
            runner,
            python,
            entry,
        }
    }

    fn pip_upgrade_chain(&self) -> [InstallStrategy; 3] {
        if self.entry.user_scoped() {
            [
                InstallStrategy::User,
                InstallStrategy::UserLegacy,
                InstallStrategy::Legacy,
            ]
        } else {
            [
                InstallStrategy::Standard,
                InstallStrategy::User,
                InstallStrategy::Legacy,
            ]
        }
    }

    async fn run_pip(
        &self,
        package: &str,
        strategy: InstallStrategy,
    ) -> Result<(bool, String)> {
        let mut invocation = Invocation::new(self.python)
            .arg("-m")
            .arg("pip")
            .arg("install")
            .arg("--upgrade")
            .arg(package);
        for flag in strategy.flags() {
            invocation = invocation.arg(flag);
        }
        let output = self
            .runner
            .run(invocation.timeout(INSTALL_TIMEOUT))
            .await?;
        let diagnostics = format!("{}\n{}", output.stderr, output.stdout);
        Ok((output.success(), diagnostics))
    }

    /// Run the full escalation chain: upgrade pip itself, then install the
    /// whisper package, escalating per classified failure.
    pub async fn install<F>(&self, mut on_progress: F) -> Result<InstallReport>
    where
        F: FnMut(&str) + Send,
    {
        let mut report = InstallReport::default();
        self.upgrade_pip(&mut report, &mut on_progress).await?;
        self.install_package(&mut report, &mut on_progress).await?;
        Ok(report)
    }

    async fn upgrade_pip<F>(&self, report: &mut InstallReport, on_progress: &mut F) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        on_progress("upgrading pip");
        let mut last_diagnostics = String::new();
        for strategy in self.pip_upgrade_chain() {
            let (ok, diagnostics) = self.run_pip("pip", strategy).await?;
            report.attempts.push(InstallAttempt {
                phase: InstallPhase::PipUpgrade,
                strategy,
                success: ok,
                error: (!ok).then(|| first_line(&strip_ansi(&diagnostics)).to_string()),
            });
            if ok {
                return Ok(());
            }
            warn!("pip self-upgrade failed with the {} strategy", strategy.label());
            last_diagnostics = diagnostics;
        }
        Err(BridgeError::InstallFailed(format!(
            "could not upgrade pip: {}",
            reformat_failure(&last_diagnostics)
        )))
    }

    async fn install_package<F>(
        &self,
        report: &mut InstallReport,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        on_progress("installing openai-whisper");
        let mut strategy = self.entry;
        let mut tried: Vec<InstallStrategy> = Vec::new();
        loop {
            let (ok, diagnostics) = self.run_pip(WHISPER_PACKAGE, strategy).await?;
            report.attempts.push(InstallAttempt {
                phase: InstallPhase::Package,
                strategy,
                success: ok,
                error: (!ok).then(|| first_line(&strip_ansi(&diagnostics)).to_string()),
            });
            if ok {
                info!(
                    "installed {WHISPER_PACKAGE} with the {} strategy",
                    strategy.label()
                );
                return Ok(());
            }

            tried.push(strategy);
            let class = classify_failure(&diagnostics);
            match next_strategy(strategy, class) {
                Some(next) if !tried.contains(&next) => {
                    on_progress(match class {
                        FailureClass::Permission => "retrying with a user-scoped install",
                        FailureClass::Resolver => "retrying with the legacy dependency resolver",
                        FailureClass::Other => "retrying",
                    });
                    warn!(
                        "install failed with the {} strategy, escalating to {}",
                        strategy.label(),
                        next.label()
                    );
                    strategy = next;
                }
                _ => return Err(BridgeError::InstallFailed(reformat_failure(&diagnostics))),
            }
        }
    }
}

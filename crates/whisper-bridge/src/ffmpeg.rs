//! Locating the audio decoder binary (bundled or system ffmpeg).
//!
//! Locating never fails hard: a verified bundled binary is preferred, but the
//! final resort is always the bare PATH name with existence deferred to
//! invocation time.

use crate::BridgeConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory segment the app packager keeps compressed; binaries inside it
/// cannot be executed and must be addressed through the unpacked sibling.
const ARCHIVE_SEGMENT: &str = "app.asar";
const UNPACKED_SEGMENT: &str = "app.asar.unpacked";

#[derive(Debug, Clone)]
pub struct FfmpegLocation {
    pub path: PathBuf,
    /// True when the binary ships with the application rather than the OS.
    pub bundled: bool,
}

impl FfmpegLocation {
    pub fn system_fallback() -> Self {
        Self {
            path: PathBuf::from(exe_name()),
            bundled: false,
        }
    }
}

fn exe_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

/// Resolve the decoder path. Callers cache the result for the process
/// lifetime; the binary's location is immutable for a running instance.
pub fn locate(config: &BridgeConfig) -> FfmpegLocation {
    for candidate in bundled_candidates(config) {
        if !candidate.exists() {
            debug!("bundled ffmpeg candidate missing: {}", candidate.display());
            continue;
        }
        if is_executable(&candidate) {
            info!("using bundled ffmpeg at {}", candidate.display());
            return FfmpegLocation {
                path: candidate,
                bundled: true,
            };
        }
        warn!(
            "bundled ffmpeg at {} exists but is not executable",
            candidate.display()
        );
    }

    debug!("no bundled ffmpeg found, deferring to the system PATH");
    FfmpegLocation::system_fallback()
}

fn bundled_candidates(config: &BridgeConfig) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();

    // Packaged runtime: construct the expected path directly instead of
    // resolving through the archive, which lies about file layout.
    if config.packaged {
        if let Some(resources) = &config.resource_dir {
            push_unique(&mut out, reconstructed_path(resources));
        }
    }

    if let Some(dev_path) = &config.bundled_ffmpeg {
        push_unique(&mut out, dev_path.clone());
        if let Some(unpacked) = unpack_transform(dev_path) {
            push_unique(&mut out, unpacked);
        }
    }

    if let Some(resources) = &config.resource_dir {
        push_unique(&mut out, reconstructed_path(resources));
    }

    out
}

fn reconstructed_path(resources: &Path) -> PathBuf {
    resources
        .join(UNPACKED_SEGMENT)
        .join("node_modules")
        .join("ffmpeg-static")
        .join(exe_name())
}

/// Replace the archive segment with its unpacked sibling, if present.
pub(crate) fn unpack_transform(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut changed = false;
    for component in path.components() {
        if component.as_os_str() == ARCHIVE_SEGMENT {
            out.push(UNPACKED_SEGMENT);
            changed = true;
        } else {
            out.push(component.as_os_str());
        }
    }
    changed.then_some(out)
}

fn push_unique(list: &mut Vec<PathBuf>, candidate: PathBuf) {
    if !list.contains(&candidate) {
        list.push(candidate);
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

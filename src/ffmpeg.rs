//! Invocation of the system `ffmpeg`/`ffprobe` binaries.
//!
//! The binaries are looked up from `MPGIF_FFMPEG` / `MPGIF_FFPROBE` and fall
//! back to whatever is on `PATH`.

use std::env;
use std::ffi::OsString;
use std::io;
use std::process::{Command, ExitStatus, Output, Stdio};

use thiserror::Error;
use tracing::debug;

pub const FFMPEG_ENV: &str = "MPGIF_FFMPEG";
pub const FFPROBE_ENV: &str = "MPGIF_FFPROBE";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {tool} (is it installed and on PATH?): {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{tool} is not available; install it or point {env} at the binary")]
    Unavailable {
        tool: &'static str,
        env: &'static str,
    },
    #[error("{0}")]
    Probe(String),
    #[error("I/O error while talking to {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    /// Captured diagnostic output of a failed run.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

pub fn ffmpeg_binary() -> OsString {
    env::var_os(FFMPEG_ENV).unwrap_or_else(|| "ffmpeg".into())
}

pub fn ffprobe_binary() -> OsString {
    env::var_os(FFPROBE_ENV).unwrap_or_else(|| "ffprobe".into())
}

pub fn ffmpeg_command() -> Command {
    Command::new(ffmpeg_binary())
}

pub fn ffprobe_command() -> Command {
    Command::new(ffprobe_binary())
}

pub fn is_ffmpeg_available() -> bool {
    ffmpeg_command()
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Fails fast when the ffmpeg binary cannot be started.
pub fn ensure_ffmpeg() -> Result<(), ToolError> {
    if is_ffmpeg_available() {
        Ok(())
    } else {
        Err(ToolError::Unavailable {
            tool: "ffmpeg",
            env: FFMPEG_ENV,
        })
    }
}

/// Runs `cmd` to completion, capturing stdout and stderr. A non-zero exit
/// becomes [`ToolError::Failed`] carrying the trimmed stderr.
pub fn run(tool: &str, cmd: &mut Command) -> Result<Output, ToolError> {
    debug!(tool, command = ?cmd, "Running external tool");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ToolError::Spawn {
            tool: tool.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: tool.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn failed_run_keeps_trimmed_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo '  bad input  ' >&2; exit 3"]);
        let err = run("ffmpeg", &mut cmd).unwrap_err();
        assert_eq!(err.stderr(), Some("bad input"));
        assert!(err.to_string().starts_with("ffmpeg exited with"));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let mut cmd = Command::new("/nonexistent/mpgif-tool");
        let err = run("ffprobe", &mut cmd).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { ref tool, .. } if tool == "ffprobe"));
        assert_eq!(err.stderr(), None);
    }
}

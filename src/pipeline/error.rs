use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Terminal failure of a single job. Assigned only by the job orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ProcessingError {
    #[error("input not found or not a {expected}: {}", path.display())]
    InputNotFound { path: PathBuf, expected: String },
    #[error("{engine} is not available: {detail}")]
    EngineMissing { engine: String, detail: String },
    #[error("invalid {engine} parameters: {reason}")]
    InvalidParameters { engine: String, reason: String },
    #[error("failed to start {program}: {message}")]
    ProcessSpawn { program: String, message: String },
    #[error("{engine} process failed with exit code {exit_code}: {stderr_excerpt}")]
    ProcessFailed {
        engine: String,
        exit_code: i32,
        stderr_excerpt: String,
    },
    #[error("{engine} process timed out after {timeout_secs}s")]
    TimedOut { engine: String, timeout_secs: u64 },
    #[error("expected output not found in {}: {expected}", output_dir.display())]
    OutputNotFound {
        output_dir: PathBuf,
        expected: String,
    },
    #[error("output {} is not a valid image: {reason}", path.display())]
    OutputInvalid { path: PathBuf, reason: String },
    #[error("workspace error: {message}")]
    Workspace { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProcessingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputNotFound { .. } => "input_not_found",
            Self::EngineMissing { .. } => "engine_missing",
            Self::InvalidParameters { .. } => "invalid_parameters",
            Self::ProcessSpawn { .. } => "process_spawn",
            Self::ProcessFailed { .. } => "process_failed",
            Self::TimedOut { .. } => "timed_out",
            Self::OutputNotFound { .. } => "output_not_found",
            Self::OutputInvalid { .. } => "output_invalid",
            Self::Workspace { .. } => "workspace",
            Self::Internal { .. } => "internal",
        }
    }
}

const STDERR_EXCERPT_LINES: usize = 8;
const STDERR_EXCERPT_MAX_CHARS: usize = 2000;

/// Keeps the tail of a process's stderr, which is where tracebacks end up.
pub fn stderr_excerpt(stderr: &str) -> String {
    let lines = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let start = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
    let joined = lines[start..].join("\n");
    let char_count = joined.chars().count();
    if char_count <= STDERR_EXCERPT_MAX_CHARS {
        return joined;
    }
    let tail = joined
        .chars()
        .skip(char_count - STDERR_EXCERPT_MAX_CHARS)
        .collect::<String>();
    format!("...{tail}")
}

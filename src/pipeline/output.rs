use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::ImageReader;
use tracing::debug;

use super::error::ProcessingError;
use super::request::{InputShape, ProcessingRequest};

/// Extensions engines are known to write, in lookup priority order.
pub const OUTPUT_EXTENSION_PRIORITY: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(meta: &Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

/// Files present in an output directory before an engine run, keyed by name.
/// Anything unchanged since the capture cannot be the product of that run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSnapshot {
    files: HashMap<OsString, FileStamp>,
}

impl OutputSnapshot {
    /// An unreadable or missing directory yields an empty snapshot.
    pub fn capture(dir: &Path) -> Self {
        let files = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter_map(|entry| {
                        let meta = entry.metadata().ok().filter(Metadata::is_file)?;
                        Some((entry.file_name(), FileStamp::of(&meta)))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True when `path` did not exist at capture time or has changed since.
    pub fn is_fresh(&self, path: &Path) -> bool {
        let (Some(name), Ok(meta)) = (path.file_name(), fs::metadata(path)) else {
            return false;
        };
        self.files.get(name) != Some(&FileStamp::of(&meta))
    }
}

/// [`resolve_fresh_output`] without a prior snapshot: every file counts.
pub fn resolve_output(
    request: &ProcessingRequest,
    output_dir: &Path,
    suffix: &str,
) -> Result<PathBuf, ProcessingError> {
    resolve_fresh_output(request, output_dir, suffix, &OutputSnapshot::default())
}

/// Locates and validates the artifact an engine wrote for `request`.
///
/// Exact `<stem>_<suffix>.<ext>` candidates are checked first in
/// [`OUTPUT_EXTENSION_PRIORITY`] order; only if none exists does the loose
/// match run, which takes the lexicographically-first file in `output_dir`
/// whose name contains the input stem. Directory-shaped requests resolve to
/// `output_dir` itself. Files unchanged since `before` was captured are
/// leftovers of an earlier run and are skipped by both searches.
pub fn resolve_fresh_output(
    request: &ProcessingRequest,
    output_dir: &Path,
    suffix: &str,
    before: &OutputSnapshot,
) -> Result<PathBuf, ProcessingError> {
    if request.input_shape() == InputShape::Directory {
        return Ok(output_dir.to_path_buf());
    }

    let stem = request.input_stem().unwrap_or_default();
    let expected = format!("{stem}_{suffix}.{{{}}}", OUTPUT_EXTENSION_PRIORITY.join(","));
    let not_found = || ProcessingError::OutputNotFound {
        output_dir: output_dir.to_path_buf(),
        expected: expected.clone(),
    };
    if stem.is_empty() {
        return Err(not_found());
    }

    let found = find_exact_candidate(output_dir, stem.as_str(), suffix, before)
        .or_else(|| loose_match(output_dir, stem.as_str(), request.input_path(), before))
        .ok_or_else(not_found)?;
    validate_image(found.as_path())?;
    debug!(output = %found.display(), "resolved engine output");
    Ok(found)
}

fn find_exact_candidate(
    output_dir: &Path,
    stem: &str,
    suffix: &str,
    before: &OutputSnapshot,
) -> Option<PathBuf> {
    OUTPUT_EXTENSION_PRIORITY
        .iter()
        .map(|ext| output_dir.join(format!("{stem}_{suffix}.{ext}")))
        .find(|candidate| candidate.is_file() && before.is_fresh(candidate))
}

fn loose_match(
    output_dir: &Path,
    stem: &str,
    input_path: &Path,
    before: &OutputSnapshot,
) -> Option<PathBuf> {
    let entries = fs::read_dir(output_dir).ok()?;
    let mut matches = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| entry.file_name().to_string_lossy().contains(stem))
        .map(|entry| entry.path())
        .filter(|path| !same_file(path.as_path(), input_path))
        .filter(|path| before.is_fresh(path))
        .collect::<Vec<_>>();
    matches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    matches.into_iter().next()
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Fully decodes the file; existence alone is not accepted as success.
pub fn validate_image(path: &Path) -> Result<(u32, u32), ProcessingError> {
    let invalid = |reason: String| ProcessingError::OutputInvalid {
        path: path.to_path_buf(),
        reason,
    };
    let decoded = ImageReader::open(path)
        .map_err(|error| invalid(error.to_string()))?
        .with_guessed_format()
        .map_err(|error| invalid(error.to_string()))?
        .decode()
        .map_err(|error| invalid(error.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        return Err(invalid(format!("image has zero dimension {width}x{height}")));
    }
    Ok((width, height))
}

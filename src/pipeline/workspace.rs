use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use thiserror::Error;
use tracing::debug;

use super::request::{EngineParams, ProcessingRequest, RequestError};
use super::settings_layer::EngineSettings;

pub const BATCH_INPUT_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];
pub const SCRATCH_INPUT_FILE_NAME: &str = "temp_input.png";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read directory '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write scratch image '{path}': {source}")]
    WriteImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Creates the scratch and output directories under the app root.
pub fn ensure_workspace_dirs(settings: &EngineSettings) -> Result<(), WorkspaceError> {
    for dir in [settings.scratch_dir(), settings.default_output_dir()] {
        fs::create_dir_all(&dir).map_err(|source| WorkspaceError::CreateDir {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Engines only read from disk, so an in-memory image is written to the
/// scratch slot first. The slot is overwritten on every call.
pub fn materialize_scratch_input(
    image: &DynamicImage,
    settings: &EngineSettings,
) -> Result<PathBuf, WorkspaceError> {
    let dir = settings.scratch_dir();
    fs::create_dir_all(&dir).map_err(|source| WorkspaceError::CreateDir {
        path: dir.clone(),
        source,
    })?;
    let path = dir.join(SCRATCH_INPUT_FILE_NAME);
    image
        .save(&path)
        .map_err(|source| WorkspaceError::WriteImage {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), "materialized scratch input");
    Ok(path)
}

pub fn is_batch_input(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| BATCH_INPUT_EXTENSIONS.contains(&ext.as_str()))
}

/// Supported images directly inside `dir`, sorted by file name.
pub fn list_batch_inputs(dir: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    let read_err = |source| WorkspaceError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut inputs = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_file() && is_batch_input(path.as_path()) {
            inputs.push(path);
        }
    }
    inputs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(inputs)
}

pub fn batch_requests(
    folder: &Path,
    output_dir: &Path,
    params: &EngineParams,
) -> Result<Vec<ProcessingRequest>, WorkspaceError> {
    list_batch_inputs(folder)?
        .into_iter()
        .map(|input| {
            ProcessingRequest::new(input, output_dir, params.clone()).map_err(WorkspaceError::from)
        })
        .collect()
}

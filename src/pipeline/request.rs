use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::EngineKind;

pub const SUPPORTED_RESTORE_MODELS: [&str; 2] = ["RealESRGAN_x4plus", "RealESRGAN_x4plus_anime_6B"];
pub const SUPPORTED_RENDER_FACTORS: [u32; 8] = [10, 15, 20, 25, 30, 35, 40, 45];

pub const DEFAULT_RESTORE_MODEL: &str = "RealESRGAN_x4plus";
pub const DEFAULT_OUTSCALE: f64 = 2.0;
pub const DEFAULT_RENDER_FACTOR: u32 = 35;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreParams {
    pub model_name: String,
    pub outscale: f64,
    pub face_enhance: bool,
}

impl Default for RestoreParams {
    fn default() -> Self {
        Self {
            model_name: String::from(DEFAULT_RESTORE_MODEL),
            outscale: DEFAULT_OUTSCALE,
            face_enhance: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColorizeParams {
    pub artistic: bool,
    pub render_factor: u32,
}

impl Default for ColorizeParams {
    fn default() -> Self {
        Self {
            artistic: true,
            render_factor: DEFAULT_RENDER_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum EngineParams {
    Restore(RestoreParams),
    Colorize(ColorizeParams),
}

impl EngineParams {
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Restore(_) => EngineKind::Restore,
            Self::Colorize(_) => EngineKind::Colorize,
        }
    }

    pub fn default_for(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Restore => Self::Restore(RestoreParams::default()),
            EngineKind::Colorize => Self::Colorize(ColorizeParams::default()),
        }
    }
}

/// Whether the engine receives a single image or a whole folder in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputShape {
    File,
    Directory,
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("outscale must be a finite number greater than zero (got {0})")]
    InvalidOutscale(f64),
    #[error("render factor {0} is not supported; expected one of 10, 15, ..., 45")]
    UnsupportedRenderFactor(u32),
    #[error("model name must not be empty")]
    EmptyModelName,
}

/// One unit of work for an engine. Fields are read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingRequest {
    input_path: PathBuf,
    output_dir: PathBuf,
    input_shape: InputShape,
    params: EngineParams,
}

impl ProcessingRequest {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        params: EngineParams,
    ) -> Result<Self, RequestError> {
        validate_params(&params)?;
        Ok(Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            input_shape: InputShape::File,
            params,
        })
    }

    pub fn restore(
        input_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        params: RestoreParams,
    ) -> Result<Self, RequestError> {
        Self::new(input_path, output_dir, EngineParams::Restore(params))
    }

    pub fn colorize(
        input_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        params: ColorizeParams,
    ) -> Result<Self, RequestError> {
        Self::new(input_path, output_dir, EngineParams::Colorize(params))
    }

    /// Hands an entire folder to the restoration engine in a single invocation.
    /// Colorization has no folder mode.
    pub fn restore_directory(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        params: RestoreParams,
    ) -> Result<Self, RequestError> {
        let mut request = Self::restore(input_dir, output_dir, params)?;
        request.input_shape = InputShape::Directory;
        Ok(request)
    }

    /// Skips parameter validation so lower layers can be tested against bad input.
    #[cfg(test)]
    pub(crate) fn unchecked(
        input_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        params: EngineParams,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            input_shape: InputShape::File,
            params,
        }
    }

    /// Returns a copy whose paths no longer depend on the process working directory.
    pub fn absolutized(&self) -> std::io::Result<Self> {
        Ok(Self {
            input_path: std::path::absolute(self.input_path.as_path())?,
            output_dir: std::path::absolute(self.output_dir.as_path())?,
            ..self.clone()
        })
    }

    pub fn kind(&self) -> EngineKind {
        self.params.kind()
    }

    pub fn input_path(&self) -> &Path {
        self.input_path.as_path()
    }

    pub fn output_dir(&self) -> &Path {
        self.output_dir.as_path()
    }

    pub fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// File name used for progress and error reporting.
    pub fn display_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.input_path.to_string_lossy().to_string())
    }

    pub fn input_stem(&self) -> Option<String> {
        self.input_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
    }
}

pub fn is_supported_render_factor(value: u32) -> bool {
    SUPPORTED_RENDER_FACTORS.contains(&value)
}

fn validate_params(params: &EngineParams) -> Result<(), RequestError> {
    match params {
        EngineParams::Restore(p) => {
            if p.model_name.trim().is_empty() {
                return Err(RequestError::EmptyModelName);
            }
            if !p.outscale.is_finite() || p.outscale <= 0.0 {
                return Err(RequestError::InvalidOutscale(p.outscale));
            }
            Ok(())
        }
        EngineParams::Colorize(p) => {
            if is_supported_render_factor(p.render_factor) {
                Ok(())
            } else {
                Err(RequestError::UnsupportedRenderFactor(p.render_factor))
            }
        }
    }
}

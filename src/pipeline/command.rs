use thiserror::Error;

use super::environment::{EngineEnvironment, ExecutionMode};
use super::request::{
    is_supported_render_factor, ColorizeParams, EngineParams, ProcessingRequest, RestoreParams,
};
use super::settings_layer::EngineSettings;

/// Output extension handed to Real-ESRGAN. Output lookup still checks the others.
pub const RESTORE_OUTPUT_EXT: &str = "png";

#[derive(Debug, Error, PartialEq)]
pub enum CommandBuildError {
    #[error("render factor {0} is outside the supported set 10..=45 step 5")]
    UnsupportedRenderFactor(u32),
    #[error("outscale must be a finite number greater than zero (got {0})")]
    InvalidOutscale(f64),
}

/// Builds the argument vector for one engine invocation. Pure: no I/O, and the
/// same inputs always yield the same vector.
pub fn build_engine_command(
    request: &ProcessingRequest,
    env: &EngineEnvironment,
    settings: &EngineSettings,
) -> Result<Vec<String>, CommandBuildError> {
    let layout = settings.layout(request.kind());
    let mut argv = Vec::new();
    if env.mode == ExecutionMode::Delegated {
        let name = env
            .delegate_name
            .as_deref()
            .unwrap_or(settings.delegate.name.as_str());
        argv.extend([
            settings.delegate.launcher.clone(),
            String::from("run"),
            String::from("-n"),
            name.to_string(),
        ]);
    }
    argv.push(settings.python_program.clone());
    argv.push(layout.entrypoint.clone());

    match request.params() {
        EngineParams::Restore(params) => {
            push_restore_args(&mut argv, request, params, layout.output_suffix.as_str())?
        }
        EngineParams::Colorize(params) => push_colorize_args(&mut argv, request, params)?,
    }
    Ok(argv)
}

fn push_restore_args(
    argv: &mut Vec<String>,
    request: &ProcessingRequest,
    params: &RestoreParams,
    suffix: &str,
) -> Result<(), CommandBuildError> {
    if !params.outscale.is_finite() || params.outscale <= 0.0 {
        return Err(CommandBuildError::InvalidOutscale(params.outscale));
    }
    argv.extend([
        String::from("-n"),
        params.model_name.clone(),
        String::from("-i"),
        request.input_path().to_string_lossy().to_string(),
        String::from("-o"),
        request.output_dir().to_string_lossy().to_string(),
        String::from("--outscale"),
        format_scale(params.outscale),
        String::from("--suffix"),
        suffix.to_string(),
        String::from("--ext"),
        String::from(RESTORE_OUTPUT_EXT),
        String::from("--fp32"),
    ]);
    if params.face_enhance {
        argv.push(String::from("--face_enhance"));
    }
    Ok(())
}

fn push_colorize_args(
    argv: &mut Vec<String>,
    request: &ProcessingRequest,
    params: &ColorizeParams,
) -> Result<(), CommandBuildError> {
    if !is_supported_render_factor(params.render_factor) {
        return Err(CommandBuildError::UnsupportedRenderFactor(
            params.render_factor,
        ));
    }
    argv.extend([
        String::from("--mode"),
        String::from(if params.artistic { "artistic" } else { "stable" }),
        String::from("--render_factor"),
        params.render_factor.to_string(),
        String::from("-i"),
        request.input_path().to_string_lossy().to_string(),
        String::from("-o"),
        request.output_dir().to_string_lossy().to_string(),
    ]);
    Ok(())
}

/// Always renders a decimal point so `2` and `2.0` produce the same flag value.
fn format_scale(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

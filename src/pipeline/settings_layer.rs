use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::EngineKind;

pub const ENV_DELEGATE_NAME: &str = "REVIVE_DELEGATE_NAME";
pub const ENV_PYTHON: &str = "REVIVE_PYTHON";
pub const ENV_RESTORE_TIMEOUT_SECS: &str = "REVIVE_RESTORE_TIMEOUT_SECS";
pub const ENV_COLORIZE_TIMEOUT_SECS: &str = "REVIVE_COLORIZE_TIMEOUT_SECS";

const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 60;

/// Where an engine lives on disk and how long a real inference may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLayout {
    pub home: PathBuf,
    pub entrypoint: String,
    pub required_assets: Vec<String>,
    pub output_suffix: String,
    pub timeout: Duration,
}

impl EngineLayout {
    pub fn entrypoint_path(&self) -> PathBuf {
        self.home.join(self.entrypoint.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateSettings {
    pub launcher: String,
    pub name: String,
    pub active_env_var: String,
}

impl Default for DelegateSettings {
    fn default() -> Self {
        Self {
            launcher: String::from("conda"),
            name: String::from("depression"),
            active_env_var: String::from("CONDA_DEFAULT_ENV"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub app_root: PathBuf,
    pub python_program: String,
    pub delegate: DelegateSettings,
    pub restore: EngineLayout,
    pub colorize: EngineLayout,
    pub health_check_timeout: Duration,
    pub output_dir_name: String,
    pub scratch_dir_name: String,
}

impl EngineSettings {
    pub fn defaults(app_root: impl Into<PathBuf>) -> Self {
        let app_root = app_root.into();
        Self {
            python_program: String::from("python"),
            delegate: DelegateSettings::default(),
            restore: EngineLayout {
                home: app_root.join("Real-ESRGAN"),
                entrypoint: String::from("inference_realesrgan.py"),
                required_assets: Vec::new(),
                output_suffix: String::from("out"),
                timeout: Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS),
            },
            colorize: EngineLayout {
                home: app_root.join("DeOldify"),
                entrypoint: String::from("colorize_image.py"),
                required_assets: vec![String::from("models")],
                output_suffix: String::from("colorized"),
                timeout: Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS),
            },
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
            output_dir_name: String::from("output"),
            scratch_dir_name: String::from("input"),
            app_root,
        }
    }

    pub fn layout(&self, kind: EngineKind) -> &EngineLayout {
        match kind {
            EngineKind::Restore => &self.restore,
            EngineKind::Colorize => &self.colorize,
        }
    }

    fn layout_mut(&mut self, kind: EngineKind) -> &mut EngineLayout {
        match kind {
            EngineKind::Restore => &mut self.restore,
            EngineKind::Colorize => &mut self.colorize,
        }
    }

    pub fn default_output_dir(&self) -> PathBuf {
        self.app_root.join(self.output_dir_name.as_str())
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.app_root.join(self.scratch_dir_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineLayoutOverlay {
    pub home: Option<String>,
    pub entrypoint: Option<String>,
    pub required_assets: Option<Vec<String>>,
    pub output_suffix: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineSettingsOverlay {
    pub python_program: Option<String>,
    pub delegate_launcher: Option<String>,
    pub delegate_name: Option<String>,
    pub active_env_var: Option<String>,
    pub health_check_timeout_secs: Option<u64>,
    pub output_dir_name: Option<String>,
    pub scratch_dir_name: Option<String>,
    pub restore: EngineLayoutOverlay,
    pub colorize: EngineLayoutOverlay,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsLayerError {
    #[error("failed to read engine settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse engine settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse engine settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("engine settings root must be an object")]
    RootMustBeObject,
    #[error("engine settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
}

/// Defaults, then the settings file, then environment overrides.
pub fn load_engine_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<EngineSettings, SettingsLayerError> {
    let file_overlay = load_settings_file_overlay(app_root, explicit_path)?;
    let env_overlay = env_settings_overlay(|key| std::env::var(key).ok())?;
    let merged = merge_settings_overlays(&file_overlay, &env_overlay);
    Ok(apply_settings_overlay(EngineSettings::defaults(app_root), &merged))
}

pub fn load_settings_file_overlay(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<EngineSettingsOverlay, SettingsLayerError> {
    if let Some(path) = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
    {
        if !path.exists() {
            return Err(SettingsLayerError::ReadFile {
                path: path.display().to_string(),
                message: String::from("file does not exist"),
            });
        }
        return load_optional_overlay_by_extension(path.as_path());
    }

    let toml_path = app_root.join("config/engines.toml");
    if toml_path.exists() {
        return load_optional_overlay_from_toml_path(toml_path.as_path());
    }
    load_optional_overlay_from_json_path(app_root.join("config/engines.json").as_path())
}

pub fn env_settings_overlay(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<EngineSettingsOverlay, SettingsLayerError> {
    let non_empty = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let secs = |key: &str| -> Result<Option<u64>, SettingsLayerError> {
        non_empty(key)
            .map(|raw| {
                raw.parse::<u64>()
                    .ok()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| SettingsLayerError::InvalidFieldType {
                        field: key.to_string(),
                    })
            })
            .transpose()
    };

    let mut out = EngineSettingsOverlay {
        python_program: non_empty(ENV_PYTHON),
        delegate_name: non_empty(ENV_DELEGATE_NAME),
        ..EngineSettingsOverlay::default()
    };
    out.restore.timeout_secs = secs(ENV_RESTORE_TIMEOUT_SECS)?;
    out.colorize.timeout_secs = secs(ENV_COLORIZE_TIMEOUT_SECS)?;
    Ok(out)
}

pub fn merge_settings_overlays(
    base: &EngineSettingsOverlay,
    overrides: &EngineSettingsOverlay,
) -> EngineSettingsOverlay {
    EngineSettingsOverlay {
        python_program: overrides
            .python_program
            .clone()
            .or_else(|| base.python_program.clone()),
        delegate_launcher: overrides
            .delegate_launcher
            .clone()
            .or_else(|| base.delegate_launcher.clone()),
        delegate_name: overrides
            .delegate_name
            .clone()
            .or_else(|| base.delegate_name.clone()),
        active_env_var: overrides
            .active_env_var
            .clone()
            .or_else(|| base.active_env_var.clone()),
        health_check_timeout_secs: overrides
            .health_check_timeout_secs
            .or(base.health_check_timeout_secs),
        output_dir_name: overrides
            .output_dir_name
            .clone()
            .or_else(|| base.output_dir_name.clone()),
        scratch_dir_name: overrides
            .scratch_dir_name
            .clone()
            .or_else(|| base.scratch_dir_name.clone()),
        restore: merge_layout_overlays(&base.restore, &overrides.restore),
        colorize: merge_layout_overlays(&base.colorize, &overrides.colorize),
    }
}

fn merge_layout_overlays(
    base: &EngineLayoutOverlay,
    overrides: &EngineLayoutOverlay,
) -> EngineLayoutOverlay {
    EngineLayoutOverlay {
        home: overrides.home.clone().or_else(|| base.home.clone()),
        entrypoint: overrides
            .entrypoint
            .clone()
            .or_else(|| base.entrypoint.clone()),
        required_assets: overrides
            .required_assets
            .clone()
            .or_else(|| base.required_assets.clone()),
        output_suffix: overrides
            .output_suffix
            .clone()
            .or_else(|| base.output_suffix.clone()),
        timeout_secs: overrides.timeout_secs.or(base.timeout_secs),
    }
}

pub fn apply_settings_overlay(
    mut settings: EngineSettings,
    overlay: &EngineSettingsOverlay,
) -> EngineSettings {
    if let Some(v) = overlay.python_program.as_ref() {
        settings.python_program = v.clone();
    }
    if let Some(v) = overlay.delegate_launcher.as_ref() {
        settings.delegate.launcher = v.clone();
    }
    if let Some(v) = overlay.delegate_name.as_ref() {
        settings.delegate.name = v.clone();
    }
    if let Some(v) = overlay.active_env_var.as_ref() {
        settings.delegate.active_env_var = v.clone();
    }
    if let Some(v) = overlay.health_check_timeout_secs {
        settings.health_check_timeout = Duration::from_secs(v);
    }
    if let Some(v) = overlay.output_dir_name.as_ref() {
        settings.output_dir_name = v.clone();
    }
    if let Some(v) = overlay.scratch_dir_name.as_ref() {
        settings.scratch_dir_name = v.clone();
    }
    let app_root = settings.app_root.clone();
    for (kind, layer) in [
        (EngineKind::Restore, &overlay.restore),
        (EngineKind::Colorize, &overlay.colorize),
    ] {
        let layout = settings.layout_mut(kind);
        if let Some(v) = layer.home.as_ref() {
            let home = PathBuf::from(v);
            layout.home = if home.is_absolute() {
                home
            } else {
                app_root.join(home)
            };
        }
        if let Some(v) = layer.entrypoint.as_ref() {
            layout.entrypoint = v.clone();
        }
        if let Some(v) = layer.required_assets.as_ref() {
            layout.required_assets = v.clone();
        }
        if let Some(v) = layer.output_suffix.as_ref() {
            layout.output_suffix = v.clone();
        }
        if let Some(v) = layer.timeout_secs {
            layout.timeout = Duration::from_secs(v);
        }
    }
    settings
}

pub fn parse_engine_settings_overlay_json(
    value: &Value,
) -> Result<EngineSettingsOverlay, SettingsLayerError> {
    let root = value
        .as_object()
        .ok_or(SettingsLayerError::RootMustBeObject)?;
    let engines = root
        .get("engines")
        .unwrap_or(value)
        .as_object()
        .ok_or(SettingsLayerError::RootMustBeObject)?;

    let mut out = EngineSettingsOverlay::default();
    if let Some(v) = engines.get("python") {
        out.python_program = Some(parse_string(v, "python")?);
    }
    if let Some(v) = engines.get("health_check_timeout_secs") {
        out.health_check_timeout_secs = Some(parse_secs(v, "health_check_timeout_secs")?);
    }
    if let Some(v) = engines.get("output_dir") {
        out.output_dir_name = Some(parse_string(v, "output_dir")?);
    }
    if let Some(v) = engines.get("scratch_dir") {
        out.scratch_dir_name = Some(parse_string(v, "scratch_dir")?);
    }
    if let Some(delegate) = engines.get("delegate") {
        let delegate =
            delegate
                .as_object()
                .ok_or_else(|| SettingsLayerError::InvalidFieldType {
                    field: String::from("delegate"),
                })?;
        if let Some(v) = delegate.get("launcher") {
            out.delegate_launcher = Some(parse_string(v, "delegate.launcher")?);
        }
        if let Some(v) = delegate.get("name") {
            out.delegate_name = Some(parse_string(v, "delegate.name")?);
        }
        if let Some(v) = delegate.get("active_env_var") {
            out.active_env_var = Some(parse_string(v, "delegate.active_env_var")?);
        }
    }
    if let Some(v) = engines.get("restore") {
        out.restore = parse_layout_overlay(v, "restore")?;
    }
    if let Some(v) = engines.get("colorize") {
        out.colorize = parse_layout_overlay(v, "colorize")?;
    }
    Ok(out)
}

fn parse_layout_overlay(
    value: &Value,
    prefix: &str,
) -> Result<EngineLayoutOverlay, SettingsLayerError> {
    let obj = value
        .as_object()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: prefix.to_string(),
        })?;
    let field = |name: &str| format!("{prefix}.{name}");
    let mut out = EngineLayoutOverlay::default();
    if let Some(v) = obj.get("home") {
        out.home = Some(parse_string(v, field("home").as_str())?);
    }
    if let Some(v) = obj.get("entrypoint") {
        out.entrypoint = Some(parse_string(v, field("entrypoint").as_str())?);
    }
    if let Some(v) = obj.get("required_assets") {
        out.required_assets = Some(parse_string_array(
            v,
            field("required_assets").as_str(),
        )?);
    }
    if let Some(v) = obj.get("output_suffix") {
        out.output_suffix = Some(parse_string(v, field("output_suffix").as_str())?);
    }
    if let Some(v) = obj.get("timeout_secs") {
        out.timeout_secs = Some(parse_secs(v, field("timeout_secs").as_str())?);
    }
    Ok(out)
}

fn load_optional_overlay_by_extension(
    path: &Path,
) -> Result<EngineSettingsOverlay, SettingsLayerError> {
    match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "toml" => load_optional_overlay_from_toml_path(path),
        _ => load_optional_overlay_from_json_path(path),
    }
}

fn load_optional_overlay_from_json_path(
    path: &Path,
) -> Result<EngineSettingsOverlay, SettingsLayerError> {
    if !path.exists() {
        return Ok(EngineSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| SettingsLayerError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed =
        serde_json::from_str::<Value>(raw.as_str()).map_err(|error| SettingsLayerError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_engine_settings_overlay_json(&parsed)
}

fn load_optional_overlay_from_toml_path(
    path: &Path,
) -> Result<EngineSettingsOverlay, SettingsLayerError> {
    if !path.exists() {
        return Ok(EngineSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path).map_err(|error| SettingsLayerError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
        SettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    })?;
    let json_value =
        serde_json::to_value(parsed).map_err(|error| SettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_engine_settings_overlay_json(&json_value)
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsLayerError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_secs(value: &Value, field: &str) -> Result<u64, SettingsLayerError> {
    value
        .as_u64()
        .filter(|v| *v > 0)
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_string_array(value: &Value, field: &str) -> Result<Vec<String>, SettingsLayerError> {
    let arr = value
        .as_array()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(parse_string(item, field)?);
    }
    Ok(out)
}

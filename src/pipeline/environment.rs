use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use super::error::ProcessingError;
use super::request::{EngineParams, ProcessingRequest};
use super::settings_layer::EngineSettings;
use super::EngineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The current process already runs inside the engine's isolated environment.
    Direct,
    /// Every invocation goes through the environment launcher.
    Delegated,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Delegated => "delegated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineEnvironment {
    pub kind: EngineKind,
    pub mode: ExecutionMode,
    pub delegate_name: Option<String>,
    pub home: PathBuf,
}

/// Resolves and caches how each engine kind is reached. Only successful
/// resolutions are cached; a missing engine is looked up again on the next call.
pub struct EnvironmentResolver {
    settings: Arc<EngineSettings>,
    active_env: Option<String>,
    cache: RwLock<[Option<EngineEnvironment>; 2]>,
}

impl EnvironmentResolver {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        let active_env = std::env::var(settings.delegate.active_env_var.as_str()).ok();
        Self::with_active_env(settings, active_env)
    }

    pub fn with_active_env(settings: Arc<EngineSettings>, active_env: Option<String>) -> Self {
        Self {
            settings,
            active_env: active_env
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            cache: RwLock::new([None, None]),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        self.settings.as_ref()
    }

    pub fn resolve(&self, kind: EngineKind) -> Result<EngineEnvironment, ProcessingError> {
        if let Some(cached) = self.cached(kind) {
            return Ok(cached);
        }

        let resolved = self.discover(kind)?;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another worker may have filled the slot while we looked.
        if let Some(existing) = cache[kind.slot()].as_ref() {
            return Ok(existing.clone());
        }
        info!(
            engine = kind.as_str(),
            mode = resolved.mode.as_str(),
            home = %resolved.home.display(),
            "resolved engine environment"
        );
        cache[kind.slot()] = Some(resolved.clone());
        Ok(resolved)
    }

    pub fn cached(&self, kind: EngineKind) -> Option<EngineEnvironment> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)[kind.slot()].clone()
    }

    pub fn invalidate(&self, kind: EngineKind) {
        debug!(engine = kind.as_str(), "invalidating engine environment");
        self.cache.write().unwrap_or_else(PoisonError::into_inner)[kind.slot()] = None;
    }

    pub fn invalidate_all(&self) {
        for kind in EngineKind::ALL {
            self.invalidate(kind);
        }
    }

    /// Checks assets that depend on the request rather than on the engine kind.
    pub fn verify_request_assets(
        &self,
        request: &ProcessingRequest,
        env: &EngineEnvironment,
    ) -> Result<(), ProcessingError> {
        let EngineParams::Colorize(params) = request.params() else {
            return Ok(());
        };
        let weights = if params.artistic {
            "ColorizeArtistic_gen.pth"
        } else {
            "ColorizeStable_gen.pth"
        };
        let candidates = [
            env.home.join("models").join(weights),
            self.settings.app_root.join("models").join(weights),
        ];
        if candidates.iter().any(|path| path.is_file()) {
            return Ok(());
        }
        Err(ProcessingError::EngineMissing {
            engine: request.kind().tool_name().to_string(),
            detail: format!(
                "model weights {weights} not found in {}",
                env.home.join("models").display()
            ),
        })
    }

    fn discover(&self, kind: EngineKind) -> Result<EngineEnvironment, ProcessingError> {
        let layout = self.settings.layout(kind);
        let missing = |detail: String| ProcessingError::EngineMissing {
            engine: kind.tool_name().to_string(),
            detail,
        };

        if !layout.home.is_dir() {
            return Err(missing(format!(
                "engine directory not found: {}",
                layout.home.display()
            )));
        }
        let entrypoint = layout.entrypoint_path();
        if !entrypoint.is_file() {
            return Err(missing(format!(
                "entrypoint not found: {}",
                entrypoint.display()
            )));
        }
        if let Some(asset) = layout
            .required_assets
            .iter()
            .map(|asset| layout.home.join(asset))
            .find(|path| !path.exists())
        {
            return Err(missing(format!(
                "required asset not found: {}",
                asset.display()
            )));
        }

        let delegate = &self.settings.delegate;
        let in_delegate_env = self.active_env.as_deref() == Some(delegate.name.as_str());
        Ok(EngineEnvironment {
            kind,
            mode: if in_delegate_env {
                ExecutionMode::Direct
            } else {
                ExecutionMode::Delegated
            },
            delegate_name: (!in_delegate_env).then(|| delegate.name.clone()),
            home: layout.home.clone(),
        })
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use serde::Serialize;
use tracing::info;

use super::environment::ExecutionMode;
use super::error::ProcessingError;
use super::orchestrator::JobOrchestrator;
use super::request::{EngineParams, ProcessingRequest};
use super::runner::ProcessRunner;
use super::EngineKind;

const SAMPLE_IMAGE_SIZE: u32 = 64;
const SAMPLE_SQUARE_SIZE: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub engine: EngineKind,
    pub mode: Option<ExecutionMode>,
    pub ok: bool,
    pub output_path: Option<PathBuf>,
    pub error: Option<ProcessingError>,
}

impl HealthReport {
    fn failed(engine: EngineKind, mode: Option<ExecutionMode>, error: ProcessingError) -> Self {
        Self {
            engine,
            mode,
            ok: false,
            output_path: None,
            error: Some(error),
        }
    }
}

/// Re-resolves the engine from scratch and runs a tiny default-parameter job
/// against a generated sample image, using the short health-check timeout.
pub fn check_engine<R: ProcessRunner>(
    orchestrator: &JobOrchestrator<R>,
    kind: EngineKind,
) -> HealthReport {
    let resolver = orchestrator.resolver();
    resolver.invalidate(kind);
    let env = match resolver.resolve(kind) {
        Ok(env) => env,
        Err(error) => return HealthReport::failed(kind, None, error),
    };

    let settings = orchestrator.settings();
    let sample_dir = settings.app_root.join(format!("test_{}", kind.as_str()));
    let sample_input = match write_sample_image(sample_dir.as_path()) {
        Ok(path) => path,
        Err(message) => {
            return HealthReport::failed(kind, Some(env.mode), ProcessingError::Workspace { message })
        }
    };

    let request = match ProcessingRequest::new(
        sample_input,
        sample_dir.join("output"),
        EngineParams::default_for(kind),
    ) {
        Ok(request) => request,
        Err(error) => {
            return HealthReport::failed(
                kind,
                Some(env.mode),
                ProcessingError::Internal {
                    message: error.to_string(),
                },
            )
        }
    };

    let report = match orchestrator.run_with_timeout(&request, settings.health_check_timeout) {
        Ok(output) => HealthReport {
            engine: kind,
            mode: Some(output.mode),
            ok: true,
            output_path: Some(output.output_path),
            error: None,
        },
        Err(error) => HealthReport::failed(kind, Some(env.mode), error),
    };
    info!(
        engine = kind.as_str(),
        ok = report.ok,
        mode = env.mode.as_str(),
        "engine health check finished"
    );
    report
}

/// Black square with a white centre, enough for any engine to produce output.
pub fn sample_image() -> RgbImage {
    let offset = (SAMPLE_IMAGE_SIZE - SAMPLE_SQUARE_SIZE) / 2;
    let range = offset..offset + SAMPLE_SQUARE_SIZE;
    RgbImage::from_fn(SAMPLE_IMAGE_SIZE, SAMPLE_IMAGE_SIZE, |x, y| {
        if range.contains(&x) && range.contains(&y) {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

fn write_sample_image(dir: &Path) -> Result<PathBuf, String> {
    fs::create_dir_all(dir)
        .map_err(|error| format!("cannot create {}: {error}", dir.display()))?;
    let path = dir.join("test.png");
    sample_image()
        .save(&path)
        .map_err(|error| format!("cannot write sample image {}: {error}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::environment::EnvironmentResolver;
    use crate::pipeline::runner::{CommandSpec, ProcessOutcome, ProcessSpawnError};
    use crate::pipeline::settings_layer::EngineSettings;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    #[derive(Clone, Default)]
    struct CopyingRunner {
        timeouts: Arc<Mutex<Vec<Duration>>>,
    }

    impl ProcessRunner for CopyingRunner {
        fn run(&self, spec: &CommandSpec) -> Result<ProcessOutcome, ProcessSpawnError> {
            self.timeouts.lock().expect("lock").push(spec.timeout);
            let arg = |flag: &str| {
                spec.argv
                    .iter()
                    .position(|a| a == flag)
                    .and_then(|i| spec.argv.get(i + 1))
                    .cloned()
                    .expect("flag present")
            };
            let out_dir = PathBuf::from(arg("-o"));
            fs::copy(arg("-i"), out_dir.join("test_out.png")).expect("copy sample");
            Ok(ProcessOutcome {
                exit_code: Some(0),
                ..ProcessOutcome::default()
            })
        }
    }

    fn temp_app_root() -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("revive_health_{stamp}"));
        fs::create_dir_all(&root).expect("temp root should exist");
        root
    }

    #[test]
    fn sample_image_has_white_centre_on_black() {
        let image = sample_image();
        assert_eq!(image.dimensions(), (64, 64));
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(32, 32), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(15, 32), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(16, 16), &Rgb([255, 255, 255]));
    }

    #[test]
    fn healthy_engine_reports_output_and_uses_short_timeout() {
        let root = temp_app_root();
        fs::create_dir_all(root.join("Real-ESRGAN")).expect("engine dir");
        fs::write(root.join("Real-ESRGAN/inference_realesrgan.py"), b"# stub").expect("entry");
        let runner = CopyingRunner::default();
        let settings = Arc::new(EngineSettings::defaults(root.as_path()));
        let orch = JobOrchestrator::with_resolver(
            EnvironmentResolver::with_active_env(settings, Some(String::from("depression"))),
            runner.clone(),
        );

        let report = check_engine(&orch, EngineKind::Restore);
        assert!(report.ok, "unexpected failure: {:?}", report.error);
        assert_eq!(report.mode, Some(ExecutionMode::Direct));
        assert_eq!(
            report.output_path,
            Some(root.join("test_restore/output/test_out.png"))
        );
        assert_eq!(
            runner.timeouts.lock().expect("lock").as_slice(),
            [Duration::from_secs(60)]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_engine_fails_before_any_sample_is_written() {
        let root = temp_app_root();
        let orch = JobOrchestrator::with_resolver(
            EnvironmentResolver::with_active_env(
                Arc::new(EngineSettings::defaults(root.as_path())),
                None,
            ),
            CopyingRunner::default(),
        );

        let report = check_engine(&orch, EngineKind::Colorize);
        assert!(!report.ok);
        assert_eq!(report.mode, None);
        assert_eq!(
            report.error.as_ref().map(ProcessingError::code),
            Some("engine_missing")
        );
        assert!(!root.join("test_colorize").exists());
        let _ = fs::remove_dir_all(root);
    }
}

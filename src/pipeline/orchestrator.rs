use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::command::build_engine_command;
use super::environment::{EngineEnvironment, EnvironmentResolver, ExecutionMode};
use super::error::{stderr_excerpt, ProcessingError};
use super::output::{resolve_fresh_output, OutputSnapshot};
use super::request::{InputShape, ProcessingRequest};
use super::runner::{CommandSpec, ProcessRunner, StdProcessRunner};
use super::settings_layer::EngineSettings;
use super::EngineKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingOutput {
    pub output_path: PathBuf,
    pub mode: ExecutionMode,
}

pub type ProcessingResult = Result<ProcessingOutput, ProcessingError>;

/// Anything that can turn one request into a terminal result. The batch
/// coordinator only depends on this.
pub trait JobRunner: Send + Sync + 'static {
    fn run_job(&self, request: &ProcessingRequest) -> ProcessingResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Validating,
    ResolvingEnvironment,
    Building,
    Executing,
    ResolvingOutput,
    Done,
}

impl JobStage {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStage::{Building, Done, Executing, ResolvingEnvironment, ResolvingOutput, Validating};

        matches!(
            (self, next),
            (Validating, ResolvingEnvironment)
                | (ResolvingEnvironment, Building)
                | (Building, Executing)
                | (Executing, ResolvingOutput)
                | (Validating, Done)
                | (ResolvingEnvironment, Done)
                | (Building, Done)
                | (Executing, Done)
                | (ResolvingOutput, Done)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::ResolvingEnvironment => "resolving_environment",
            Self::Building => "building",
            Self::Executing => "executing",
            Self::ResolvingOutput => "resolving_output",
            Self::Done => "done",
        }
    }
}

struct StageCursor {
    current: JobStage,
}

impl StageCursor {
    fn new() -> Self {
        Self {
            current: JobStage::Validating,
        }
    }

    fn advance(&mut self, next: JobStage) {
        debug_assert!(
            self.current.can_transition_to(next),
            "illegal job stage transition {:?} -> {:?}",
            self.current,
            next
        );
        debug!(from = self.current.as_str(), to = next.as_str(), "job stage");
        self.current = next;
    }
}

/// Runs single jobs end to end and owns the translation of every lower-layer
/// failure into a [`ProcessingError`].
pub struct JobOrchestrator<R: ProcessRunner = StdProcessRunner> {
    resolver: EnvironmentResolver,
    runner: R,
    engine_locks: [Mutex<()>; 2],
}

impl JobOrchestrator<StdProcessRunner> {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        Self::with_runner(settings, StdProcessRunner::default())
    }
}

impl<R: ProcessRunner> JobOrchestrator<R> {
    pub fn with_runner(settings: Arc<EngineSettings>, runner: R) -> Self {
        Self::with_resolver(EnvironmentResolver::new(settings), runner)
    }

    pub fn with_resolver(resolver: EnvironmentResolver, runner: R) -> Self {
        Self {
            resolver,
            runner,
            engine_locks: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        self.resolver.settings()
    }

    pub fn resolver(&self) -> &EnvironmentResolver {
        &self.resolver
    }

    pub fn run(&self, request: &ProcessingRequest) -> ProcessingResult {
        self.execute(request, None)
    }

    /// Same as [`run`](Self::run) but overrides the engine's configured timeout.
    pub fn run_with_timeout(
        &self,
        request: &ProcessingRequest,
        timeout: Duration,
    ) -> ProcessingResult {
        self.execute(request, Some(timeout))
    }

    fn execute(&self, request: &ProcessingRequest, timeout: Option<Duration>) -> ProcessingResult {
        let kind = request.kind();
        let job_id = Uuid::new_v4();
        let span = info_span!("job", job_id = %job_id, engine = kind.as_str());
        let _entered = span.enter();

        info!(
            input = %request.input_path().display(),
            output_dir = %request.output_dir().display(),
            params = ?request.params(),
            "job started"
        );
        let started = Instant::now();
        let mut cursor = StageCursor::new();
        let result = self.run_stages(request, timeout, &mut cursor);
        let failed_at = cursor.current;
        cursor.advance(JobStage::Done);

        let elapsed_ms = millis_u64(started.elapsed());
        match &result {
            Ok(output) => info!(
                output = %output.output_path.display(),
                elapsed_ms,
                "job finished"
            ),
            Err(error) => warn!(
                code = error.code(),
                stage = failed_at.as_str(),
                elapsed_ms,
                error = %error,
                "job failed"
            ),
        }
        result
    }

    fn run_stages(
        &self,
        request: &ProcessingRequest,
        timeout: Option<Duration>,
        cursor: &mut StageCursor,
    ) -> ProcessingResult {
        let kind = request.kind();
        let request = validate_input(request)?;

        cursor.advance(JobStage::ResolvingEnvironment);
        let env = self.resolver.resolve(kind)?;
        self.resolver.verify_request_assets(&request, &env)?;

        cursor.advance(JobStage::Building);
        let settings = self.resolver.settings();
        let argv = build_engine_command(&request, &env, settings).map_err(|error| {
            ProcessingError::InvalidParameters {
                engine: kind.tool_name().to_string(),
                reason: error.to_string(),
            }
        })?;
        fs::create_dir_all(request.output_dir()).map_err(|error| ProcessingError::Workspace {
            message: format!(
                "cannot create output directory {}: {error}",
                request.output_dir().display()
            ),
        })?;

        let layout = settings.layout(kind);
        let spec = CommandSpec {
            argv,
            cwd: env.home.clone(),
            timeout: timeout.unwrap_or(layout.timeout),
        };

        // Held through output resolution so a concurrent job of the same kind
        // cannot write a competing artifact in between.
        let _guard = self.engine_locks[kind.slot()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let before = match request.input_shape() {
            InputShape::File => OutputSnapshot::capture(request.output_dir()),
            InputShape::Directory => OutputSnapshot::default(),
        };

        cursor.advance(JobStage::Executing);
        self.execute_command(kind, &env, &spec)?;

        cursor.advance(JobStage::ResolvingOutput);
        let output_path = resolve_fresh_output(
            &request,
            request.output_dir(),
            layout.output_suffix.as_str(),
            &before,
        )?;
        Ok(ProcessingOutput {
            output_path,
            mode: env.mode,
        })
    }

    fn execute_command(
        &self,
        kind: EngineKind,
        env: &EngineEnvironment,
        spec: &CommandSpec,
    ) -> Result<(), ProcessingError> {
        info!(
            command = %spec.argv.join(" "),
            cwd = %spec.cwd.display(),
            mode = env.mode.as_str(),
            timeout_secs = spec.timeout.as_secs(),
            "executing engine command"
        );
        let outcome = self
            .runner
            .run(spec)
            .map_err(|error| ProcessingError::ProcessSpawn {
                program: spec.program().to_string(),
                message: error.to_string(),
            })?;

        if outcome.stdout_truncated || outcome.stderr_truncated {
            debug!(
                stdout_truncated = outcome.stdout_truncated,
                stderr_truncated = outcome.stderr_truncated,
                "engine output exceeded capture limit"
            );
        }
        if outcome.timed_out {
            return Err(ProcessingError::TimedOut {
                engine: kind.tool_name().to_string(),
                timeout_secs: spec.timeout.as_secs(),
            });
        }
        if outcome.exit_code != Some(0) {
            return Err(ProcessingError::ProcessFailed {
                engine: kind.tool_name().to_string(),
                exit_code: outcome.exit_code.unwrap_or(-1),
                stderr_excerpt: stderr_excerpt(outcome.stderr_lossy().as_str()),
            });
        }
        Ok(())
    }
}

impl<R: ProcessRunner> JobRunner for JobOrchestrator<R> {
    fn run_job(&self, request: &ProcessingRequest) -> ProcessingResult {
        self.run(request)
    }
}

fn millis_u64(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn validate_input(request: &ProcessingRequest) -> Result<ProcessingRequest, ProcessingError> {
    let expected = match request.input_shape() {
        InputShape::File => "file",
        InputShape::Directory => "directory",
    };
    let not_found = || ProcessingError::InputNotFound {
        path: request.input_path().to_path_buf(),
        expected: expected.to_string(),
    };
    let request = request.absolutized().map_err(|_| not_found())?;
    let present = match request.input_shape() {
        InputShape::File => request.input_path().is_file(),
        InputShape::Directory => request.input_path().is_dir(),
    };
    if present {
        Ok(request)
    } else {
        Err(not_found())
    }
}

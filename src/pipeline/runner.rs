use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Per-stream capture ceiling. Output past it is drained and dropped.
pub const DEFAULT_CAPTURE_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutcome {
    /// `None` when the process timed out or was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(self.stdout.as_slice()).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(self.stderr.as_slice()).to_string()
    }
}

#[derive(Debug, Error)]
pub enum ProcessSpawnError {
    #[error("command line is empty")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed while waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

pub trait ProcessRunner: Send + Sync + 'static {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutcome, ProcessSpawnError>;
}

#[derive(Debug, Clone)]
pub struct StdProcessRunner {
    capture_limit: usize,
}

impl Default for StdProcessRunner {
    fn default() -> Self {
        Self {
            capture_limit: DEFAULT_CAPTURE_LIMIT_BYTES,
        }
    }
}

impl StdProcessRunner {
    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }
}

impl ProcessRunner for StdProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutcome, ProcessSpawnError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or(ProcessSpawnError::EmptyCommand)?;

        let mut command = Command::new(program.as_str());
        command
            .args(args.iter().map(String::as_str))
            .current_dir(spec.cwd.as_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout also takes down whatever the
        // environment launcher spawned underneath.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|source| ProcessSpawnError::Spawn {
                program: program.clone(),
                source,
            })?;
        debug!(pid = child.id(), program = program.as_str(), "spawned engine process");

        let stdout_reader = child
            .stdout
            .take()
            .map(|stream| spawn_capture(stream, self.capture_limit));
        let stderr_reader = child
            .stderr
            .take()
            .map(|stream| spawn_capture(stream, self.capture_limit));

        let status = match child.wait_timeout(spec.timeout) {
            // The leader is reaped here, so its pgid may already belong to
            // someone else; the group is only signalled on timeout.
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                warn!(
                    pid = child.id(),
                    timeout_secs = spec.timeout.as_secs(),
                    "engine process timed out; terminating"
                );
                terminate(&mut child);
                None
            }
            Err(source) => {
                terminate(&mut child);
                let _ = join_capture(stdout_reader);
                let _ = join_capture(stderr_reader);
                return Err(ProcessSpawnError::Wait {
                    program: program.clone(),
                    source,
                });
            }
        };

        let (stdout, stdout_truncated) = join_capture(stdout_reader);
        let (stderr, stderr_truncated) = join_capture(stderr_reader);
        Ok(ProcessOutcome {
            exit_code: status.as_ref().and_then(ExitStatus::code),
            stdout,
            stderr,
            timed_out: status.is_none(),
            stdout_truncated,
            stderr_truncated,
        })
    }
}

/// Kills the child and reaps it so no zombie is left behind.
fn terminate(child: &mut Child) {
    kill_process_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    // ESRCH just means the group is already gone.
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn spawn_capture<R>(mut source: R, limit: usize) -> JoinHandle<(Vec<u8>, bool)>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut captured = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(captured.len());
                    if n > room {
                        truncated = true;
                    }
                    captured.extend_from_slice(&buf[..n.min(room)]);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        (captured, truncated)
    })
}

fn join_capture(handle: Option<JoinHandle<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("revive_runner_{label}_{stamp}"));
        fs::create_dir_all(&dir).expect("temp dir should exist");
        dir
    }

    fn sh(script: &str, cwd: PathBuf, timeout: Duration) -> CommandSpec {
        CommandSpec {
            argv: vec![String::from("sh"), String::from("-c"), script.to_string()],
            cwd,
            timeout,
        }
    }

    #[test]
    fn captures_streams_and_reports_non_zero_exit_as_data() {
        let dir = temp_dir("streams");
        let outcome = StdProcessRunner::default()
            .run(&sh(
                "echo hello; echo oops >&2; exit 3",
                dir.clone(),
                Duration::from_secs(10),
            ))
            .expect("process should run");

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert!(!outcome.success());
        assert_eq!(outcome.stdout_lossy().trim(), "hello");
        assert_eq!(outcome.stderr_lossy().trim(), "oops");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn runs_in_the_requested_working_directory() {
        let dir = temp_dir("cwd");
        let before = std::env::current_dir().expect("cwd");
        let outcome = StdProcessRunner::default()
            .run(&sh("pwd -P", dir.clone(), Duration::from_secs(10)))
            .expect("process should run");

        let reported = PathBuf::from(outcome.stdout_lossy().trim());
        assert_eq!(
            reported,
            dir.canonicalize().expect("canonical temp dir")
        );
        assert_eq!(std::env::current_dir().expect("cwd"), before);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn timeout_kills_and_reaps_the_child() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = temp_dir("timeout");
        let started = Instant::now();
        let outcome = StdProcessRunner::default()
            .run(&sh(
                "echo $$ > leader.pid; exec sleep 30",
                dir.clone(),
                Duration::from_millis(300),
            ))
            .expect("process should run");

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = fs::read_to_string(dir.join("leader.pid"))
            .expect("pid file")
            .trim()
            .parse::<i32>()
            .expect("pid");
        assert!(
            kill(Pid::from_raw(pid), None).is_err(),
            "timed out process should be gone"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn normal_exit_leaves_detached_processes_alone() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let dir = temp_dir("normal_exit");
        let outcome = StdProcessRunner::default()
            .run(&sh(
                "sleep 30 >/dev/null 2>&1 & echo $! > bg.pid",
                dir.clone(),
                Duration::from_secs(10),
            ))
            .expect("process should run");
        assert_eq!(outcome.exit_code, Some(0));

        let pid = Pid::from_raw(
            fs::read_to_string(dir.join("bg.pid"))
                .expect("pid file")
                .trim()
                .parse::<i32>()
                .expect("pid"),
        );
        let alive = kill(pid, None).is_ok();
        let _ = kill(pid, Signal::SIGKILL);
        assert!(alive, "a finished job must not signal its old process group");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn truncates_capture_past_limit_and_flags_it() {
        let dir = temp_dir("truncate");
        let outcome = StdProcessRunner::default()
            .with_capture_limit(16)
            .run(&sh("printf '%0100d' 0", dir.clone(), Duration::from_secs(10)))
            .expect("process should run");

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.len(), 16);
        assert!(outcome.stdout_truncated);
        assert!(!outcome.stderr_truncated);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_or_unknown_programs_are_spawn_errors() {
        let dir = temp_dir("spawn");
        let empty = CommandSpec {
            argv: Vec::new(),
            cwd: dir.clone(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            StdProcessRunner::default().run(&empty),
            Err(ProcessSpawnError::EmptyCommand)
        ));

        let unknown = CommandSpec {
            argv: vec![String::from("revive-definitely-not-a-real-binary")],
            cwd: dir.clone(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            StdProcessRunner::default().run(&unknown),
            Err(ProcessSpawnError::Spawn { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }
}

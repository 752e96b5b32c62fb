use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_DIR_NAME: &str = "logs";

/// Today's log file, one per calendar day.
pub fn log_file_path(app_root: &Path) -> PathBuf {
    app_root.join(LOG_DIR_NAME).join(format!(
        "revive_{}.log",
        Local::now().format("%Y-%m-%d")
    ))
}

/// Console at INFO (overridable through `RUST_LOG`) plus a DEBUG file layer.
/// Returns the log file path, or `None` when only the console is active.
pub fn init_tracing(app_root: &Path) -> Option<PathBuf> {
    let console_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let console = fmt::layer().with_target(false).with_filter(console_filter);

    let path = log_file_path(app_root);
    let (file_layer, open_error) = match open_log_file(path.as_path()) {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();

    match open_error {
        Some(error) => {
            warn!(path = %path.display(), error = %error, "file logging disabled");
            None
        }
        None => Some(path),
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn log_file_is_dated_under_logs_dir() {
        let path = log_file_path(Path::new("/app"));
        assert_eq!(path.parent(), Some(Path::new("/app/logs")));
        let name = path
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .to_string();
        assert!(name.starts_with("revive_"));
        assert!(name.ends_with(".log"));
        // revive_YYYY-MM-DD.log
        assert_eq!(name.len(), "revive_".len() + 10 + ".log".len());
    }

    #[test]
    fn open_log_file_creates_missing_directory_and_appends() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("revive_logging_{stamp}"));
        let path = log_file_path(root.as_path());

        {
            use std::io::Write;
            let mut file = open_log_file(path.as_path()).expect("open");
            writeln!(file, "first").expect("write");
            let mut file = open_log_file(path.as_path()).expect("reopen");
            writeln!(file, "second").expect("write");
        }
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "first\nsecond\n");
        let _ = fs::remove_dir_all(root);
    }
}

pub mod logging;
pub mod pipeline;
pub mod worker;

use std::path::PathBuf;

/// App root used when `--app-root` is not given: the directory holding the
/// executable, falling back to the current directory.
pub fn default_app_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

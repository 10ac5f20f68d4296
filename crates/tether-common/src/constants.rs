//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for tether data when no home directory is usable.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/tether";

/// Returns the data directory, preferring `$HOME/.tether` and falling back
/// to `/var/lib/tether`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".tether");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default state file path.
pub fn default_state_file() -> PathBuf {
    data_dir().join("attach-state.json")
}

/// Returns the default configuration file path.
pub fn default_config_file() -> PathBuf {
    data_dir().join("config.json")
}

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Key sequence that detaches from a container without stopping it.
pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

/// Capacity of the signal proxy's pending-signal queue.
///
/// Large enough that a burst of signals is queued rather than dropped.
pub const SIGNAL_BUFFER_SIZE: usize = 2048;

/// Capacity of the coordinator's shutdown-signal queue.
pub const SHUTDOWN_SIGNAL_BUFFER: usize = 1;

/// Capacity of the terminal resize-event stream.
pub const RESIZE_BUFFER: usize = 1;

/// Exit code reported when the engine itself fails.
pub const EXIT_CODE_ENGINE: i32 = 125;

/// Exit code reported when the requested command cannot be invoked.
pub const EXIT_CODE_CANNOT_INVOKE: i32 = 126;

/// Exit code reported when the requested command is not found.
pub const EXIT_CODE_NOT_FOUND: i32 = 127;

//! State and log directory layout.

use std::path::{Path, PathBuf};

/// Overrides the state directory.
pub const HOME_ENV: &str = "CLUSTERGRADE_HOME";

/// Overrides the data migration script root.
pub const DATA_MIGRATION_ENV: &str = "CLUSTERGRADE_DATA_MIGRATION_DIR";

pub const STATUS_FILE: &str = "status.json";
pub const CONFIG_FILE: &str = "config.json";

/// Resolve the hub's state directory.
///
/// Priority:
/// 1. `CLUSTERGRADE_HOME` environment variable
/// 2. `~/.clustergrade`
/// 3. `.clustergrade` in the current directory
pub fn resolve_state_dir() -> PathBuf {
    state_dir_from(std::env::var_os(HOME_ENV).map(PathBuf::from), dirs::home_dir())
}

fn state_dir_from(overridden: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = overridden.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    match home {
        Some(home) => home.join(".clustergrade"),
        None => PathBuf::from(".clustergrade"),
    }
}

/// `~/gpAdminLogs/clustergrade`, where the hub writes its logs.
pub fn resolve_log_dir() -> PathBuf {
    log_dir_from(dirs::home_dir())
}

fn log_dir_from(home: Option<PathBuf>) -> PathBuf {
    home.unwrap_or_else(|| PathBuf::from("."))
        .join("gpAdminLogs")
        .join("clustergrade")
}

/// Root of the data migration scripts, one subdirectory per phase. Kept
/// outside the log directory, which finalize and revert archive before the
/// scripts run.
pub fn resolve_data_migration_dir() -> PathBuf {
    data_migration_dir_from(
        std::env::var_os(DATA_MIGRATION_ENV).map(PathBuf::from),
        dirs::home_dir(),
    )
}

fn data_migration_dir_from(overridden: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = overridden.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    home.unwrap_or_else(|| PathBuf::from("."))
        .join("clustergrade-data-migration-scripts")
}

pub fn status_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATUS_FILE)
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        let dir = state_dir_from(Some("/data/upgrade".into()), Some("/home/gpadmin".into()));
        assert_eq!(dir, PathBuf::from("/data/upgrade"));
    }

    #[test]
    fn empty_override_falls_back_to_home() {
        let dir = state_dir_from(Some(PathBuf::new()), Some("/home/gpadmin".into()));
        assert_eq!(dir, PathBuf::from("/home/gpadmin/.clustergrade"));
    }

    #[test]
    fn log_dir_lives_under_gp_admin_logs() {
        assert_eq!(
            log_dir_from(Some("/home/gpadmin".into())),
            PathBuf::from("/home/gpadmin/gpAdminLogs/clustergrade")
        );
    }

    #[test]
    fn scripts_live_outside_the_log_dir() {
        let home = Some(PathBuf::from("/home/gpadmin"));
        let scripts = data_migration_dir_from(None, home.clone());
        assert!(!scripts.starts_with(log_dir_from(home)));
        assert_eq!(
            data_migration_dir_from(Some("/scripts".into()), None),
            PathBuf::from("/scripts")
        );
    }
}

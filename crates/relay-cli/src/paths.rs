//! Daemon-management paths layered on top of [`relay_core::RelayPaths`] —
//! the CLI and the daemon must agree on `data_root` to manage the same
//! instance.

use std::path::PathBuf;

use relay_core::RelayPaths;

pub fn data_root() -> PathBuf {
    std::env::var_os("RELAY_DATA_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./data"))
}

pub fn relay_paths() -> RelayPaths {
    RelayPaths::from_root(data_root())
}

pub fn pid_file() -> PathBuf {
    data_root().join("daemon.pid")
}

pub fn log_file() -> PathBuf {
    data_root().join("daemon.log")
}

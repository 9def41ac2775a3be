//! Runtime configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::hcs::system::DEFAULT_WATCHDOG_THRESHOLD;
use crate::hcs::{StartLimiter, SystemOptions};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "HCSLITE_DATA_DIR";

/// Configuration for a [`crate::HcsliteRuntime`].
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Root for persisted state, pipes, logs and boot files.
    pub data_dir: PathBuf,
    /// Directory holding the shim pipe endpoints (Unix targets).
    pub pipe_dir: PathBuf,
    /// Directory holding the Linux utility-VM kernel and initrd.
    pub kird_path: Option<PathBuf>,
    /// Optional cap on concurrently starting compute systems.
    pub max_parallel_starts: Option<u32>,
    /// Threshold before a stalled platform call is logged.
    pub watchdog_threshold: Duration,
}

impl RuntimeOptions {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let pipe_dir = data_dir.join("pipes");
        Self {
            data_dir,
            pipe_dir,
            kird_path: None,
            max_parallel_starts: None,
            watchdog_threshold: DEFAULT_WATCHDOG_THRESHOLD,
        }
    }

    /// The sqlite state-store location.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    /// Where shim log files land unless the caller says otherwise.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// The kernel/initrd directory for Linux utility VMs.
    pub fn kird_path(&self) -> PathBuf {
        self.kird_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("kird"))
    }

    /// System-handle tunables derived from these options.
    pub fn system_options(&self, limiter: Option<Arc<StartLimiter>>) -> SystemOptions {
        SystemOptions {
            watchdog_threshold: self.watchdog_threshold,
            start_limiter: limiter,
            ..SystemOptions::default()
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        Self::with_data_dir(data_dir)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hcslite")
}

//! Tracing setup for the CLI and the shim processes.

use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Guard keeping a file logger's background writer alive.
pub type WorkerGuard = tracing_appender::non_blocking::WorkerGuard;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr. Used by the foreground CLI commands.
pub fn init_stderr_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Log to a rolling file. Used by shim processes, whose stderr belongs to
/// the parent handshake. The returned guard must stay alive for the life of
/// the process so the background writer keeps draining.
pub fn init_file_logging(
    directory: &Path,
    file_name: &str,
) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(directory)?;
    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}

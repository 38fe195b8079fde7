use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::CommonConfig;

/// Initialise the tracing subscriber for a binary. `RUST_LOG` overrides
/// the configured level. When `log_output = "file"` the returned guard
/// must be kept alive for the lifetime of the process or buffered lines
/// are lost.
pub fn init(common: &CommonConfig, log_path: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(common.log_level.clone()));

    if common.log_output == "file" {
        let path = Path::new(log_path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let file = path
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| "minidfs.log".into());
        let _ = std::fs::create_dir_all(dir);
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

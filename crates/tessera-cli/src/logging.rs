use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Route tracing output to the configured log file, and optionally stderr.
///
/// `RUST_LOG` overrides the configured level. Failures only print a warning.
pub fn init_tracing(config: &LogConfig) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let Some(log_dir) = config.file_path.parent() else {
        eprintln!(
            "warning: invalid log path {}",
            config.file_path.display()
        );
        return;
    };
    let Some(file_name) = config.file_path.file_name() else {
        eprintln!(
            "warning: invalid log path {}",
            config.file_path.display()
        );
        return;
    };
    if let Err(error) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "warning: failed to create log dir {}: {error}",
            log_dir.display()
        );
        return;
    }

    let appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = TRACE_GUARD.set(guard);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    let init_result = if config.stdout {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
    };
    if let Err(error) = init_result {
        eprintln!("warning: failed to initialize tracing: {error}");
    }
}

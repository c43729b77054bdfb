//! Tracing subscriber initialization with structured logging, a dated log
//! file and optional OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! let log_dir = std::path::Path::new("/home/gpadmin/gpAdminLogs/clustergrade");
//! let _guard = clustergrade_observe::init_tracing(1, Some(log_dir), false).unwrap();
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::NaiveDate;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Keeps the background log file writer alive. Dropping it flushes the file.
#[must_use = "dropping the guard stops writing the log file"]
pub struct TracingGuard {
    _file: Option<WorkerGuard>,
    path: Option<PathBuf>,
}

impl TracingGuard {
    /// The log file being written, if any.
    pub fn log_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Name of the log file written on `date`.
pub fn log_file_name(date: NaiveDate) -> String {
    format!("clustergrade_{}.log", date.format("%Y%m%d"))
}

/// Default filter directive for a `-v` count when `RUST_LOG` is unset.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// How much of the log is echoed to the terminal. Substep progress is
/// rendered by the CLI itself, so only warnings show without `-v`.
fn stderr_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs an `EnvFilter` from `RUST_LOG`, or derived from `verbosity`.
/// - A stderr `fmt` layer whose level follows `verbosity`.
/// - When `log_dir` is given, appends to `<log_dir>/clustergrade_<YYYYMMDD>.log`
///   through a non-blocking writer.
/// - When `enable_otel` is true, bridges spans to OpenTelemetry using a
///   stdout exporter.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or the global
/// subscriber has already been set.
pub fn init_tracing(
    verbosity: u8,
    log_dir: Option<&Path>,
    enable_otel: bool,
) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(verbosity > 1)
        .with_writer(std::io::stderr)
        .with_filter(stderr_level(verbosity));

    let mut guard = TracingGuard {
        _file: None,
        path: None,
    };
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(log_file_name(chrono::Local::now().date_naive()));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let (writer, worker) = tracing_appender::non_blocking(file);
            guard._file = Some(worker);
            guard.path = Some(path);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    let otel_layer = if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("clustergrade");

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(guard)
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_named_by_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(log_file_name(date), "clustergrade_20240309.log");
    }

    #[test]
    fn verbosity_raises_terminal_level() {
        assert_eq!(stderr_level(0), LevelFilter::WARN);
        assert_eq!(stderr_level(1), LevelFilter::INFO);
        assert_eq!(stderr_level(5), LevelFilter::TRACE);
        assert_eq!(default_directive(0), "info");
        assert_eq!(default_directive(2), "debug");
    }

    #[test]
    fn init_creates_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("gpAdminLogs/clustergrade");

        let guard = init_tracing(0, Some(&log_dir), false).unwrap();
        tracing::warn!("hello from the test");
        let path = guard.log_file().unwrap().to_path_buf();
        drop(guard);

        assert!(path.starts_with(&log_dir));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello from the test"));
    }
}

//! Structured logging setup: five semantic log streams (request, error,
//! access, audit, application), each a daily-rolling file plus stdout for
//! the application stream, wired up with `tracing-subscriber` layers
//! filtered by target.

pub mod audit;
pub mod metrics;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Guards for the non-blocking file writers; the caller must keep these
/// alive for the process lifetime or buffered log lines are lost on exit.
pub struct LogGuards {
  _request: WorkerGuard,
  _error: WorkerGuard,
  _access: WorkerGuard,
  _audit: WorkerGuard,
}

pub fn init(log_dir: &str) -> anyhow::Result<LogGuards> {
  std::fs::create_dir_all(log_dir)?;

  let (request_writer, request_guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "request.log"));
  let (error_writer, error_guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "error.log"));
  let (access_writer, access_guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "access.log"));
  let (audit_writer, audit_guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "audit.log"));

  let request_layer = layer()
    .json()
    .with_writer(request_writer)
    .with_filter(filter_fn(|meta| meta.target().starts_with("apex_gateway::proxy")));

  let error_layer = layer()
    .json()
    .with_writer(error_writer)
    .with_filter(filter_fn(|meta| *meta.level() <= tracing::Level::WARN));

  let access_layer = layer()
    .json()
    .with_writer(access_writer)
    .with_filter(filter_fn(|meta| meta.target() == "access"));

  let audit_layer = layer()
    .json()
    .with_writer(audit_writer)
    .with_filter(filter_fn(|meta| meta.target() == "audit"));

  let application_layer = layer()
    .with_writer(std::io::stdout)
    .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

  Registry::default()
    .with(application_layer)
    .with(request_layer)
    .with(error_layer)
    .with(access_layer)
    .with(audit_layer)
    .try_init()?;

  Ok(LogGuards {
    _request: request_guard,
    _error: error_guard,
    _access: access_guard,
    _audit: audit_guard,
  })
}

//! Structured audit logging for attestation runs.
//!
//! - Non-blocking I/O (logging never stalls an in-flight OCSP/RIM round trip)
//! - JSON format to a daily-rotating file (machine-readable audit trail)
//! - Optional pretty console sink, gated by `--verbose`
//!
//! ```text
//! tracing::info!()/warn!()/error!() ──► non-blocking channel ──► background thread
//!                                                                     │
//!                                                                     ▼
//!                                                  logs/gpu-attest.2026-07-30.log
//! ```

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for the audit logging system.
pub struct AuditConfig {
    /// Directory for log files.
    pub log_dir: String,
    /// Base filename for logs (date is appended by the rolling appender).
    pub log_prefix: String,
    /// Enable the pretty console sink alongside the JSON file sink.
    pub console_output: bool,
    /// Log level filter (e.g., "info", "debug", "warn").
    pub level_filter: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::var("ATTESTVERIFIER_LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
            log_prefix: "gpu-attest".to_string(),
            console_output: true,
            level_filter: "info".to_string(),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Returns a `WorkerGuard` that MUST be held for the lifetime of the
/// process; dropping it flushes and closes the log file.
pub fn init_tracing(config: AuditConfig) -> WorkerGuard {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &config.log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level_filter));

    let json_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if config.console_output {
        let console_layer = fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(console_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(json_layer).init();
    }

    guard
}

/// Initialize tracing with the default configuration; `verbose` raises the
/// console sink (and only the console sink) to `debug`.
pub fn init_tracing_default(verbose: bool) -> WorkerGuard {
    let mut config = AuditConfig::default();
    if verbose {
        config.level_filter = "debug".to_string();
    }
    init_tracing(config)
}

/// Structured audit event names, used as the `event` field on log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    RunStarted,
    GpuStateTransition,
    GpuVerified,
    GpuFailed,
    TokenEmitted,
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditEvent::RunStarted => write!(f, "run_started"),
            AuditEvent::GpuStateTransition => write!(f, "gpu_state_transition"),
            AuditEvent::GpuVerified => write!(f, "gpu_verified"),
            AuditEvent::GpuFailed => write!(f, "gpu_failed"),
            AuditEvent::TokenEmitted => write!(f, "token_emitted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_config_default() {
        std::env::remove_var("ATTESTVERIFIER_LOG_DIR");
        let config = AuditConfig::default();
        assert_eq!(config.log_dir, "logs");
        assert_eq!(config.log_prefix, "gpu-attest");
        assert!(config.console_output);
        assert_eq!(config.level_filter, "info");
    }

    #[test]
    fn test_audit_event_display() {
        assert_eq!(AuditEvent::RunStarted.to_string(), "run_started");
        assert_eq!(AuditEvent::GpuStateTransition.to_string(), "gpu_state_transition");
        assert_eq!(AuditEvent::GpuVerified.to_string(), "gpu_verified");
        assert_eq!(AuditEvent::GpuFailed.to_string(), "gpu_failed");
        assert_eq!(AuditEvent::TokenEmitted.to_string(), "token_emitted");
    }
}

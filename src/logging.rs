use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tracing::{error, trace, warn, Level};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Operations slower than this are reported at `warn`.
const SLOW_OPERATION: Duration = Duration::from_millis(100);

/// Install a global subscriber. `RUST_LOG` overrides `level` when set.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: Level, json_output: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skipdb={},warn", level)));

    let installed = if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true);
        Registry::default().with(env_filter).with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true);
        Registry::default().with(env_filter).with(fmt_layer).try_init()
    };
    installed.map_err(|e| Error::Config(format!("logging already initialised: {}", e)))
}

/// Times one database operation and logs its outcome.
pub struct OperationTimer {
    start: Instant,
    operation: &'static str,
    key: Vec<u8>,
}

impl OperationTimer {
    pub fn new(operation: &'static str, key: &[u8]) -> Self {
        Self {
            start: Instant::now(),
            operation,
            key: key.to_vec(),
        }
    }

    pub fn complete<T>(self, result: &Result<T>) {
        let duration = self.start.elapsed();
        let key = String::from_utf8_lossy(&self.key);

        match result {
            Ok(_) if duration > SLOW_OPERATION => warn!(
                operation = self.operation,
                key = %key,
                duration_ms = duration.as_millis() as u64,
                "Slow operation"
            ),
            Ok(_) => trace!(
                operation = self.operation,
                key = %key,
                duration_us = duration.as_micros() as u64,
                "Operation completed"
            ),
            Err(e) => error!(
                operation = self.operation,
                key = %key,
                error = %e,
                "Operation failed"
            ),
        }
    }
}

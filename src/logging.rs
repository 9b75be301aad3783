/*!
 * Logging initialization
 *
 * Every subsystem thread in this server carries a name (`-keepalive-`,
 * `-sched-`, `pool:<name>-<n>`, `-job:<queue><n>-`, `-listen:<driver>-`), so
 * the thread name is the one field a log line always needs; targets and
 * source locations stay off. Lines go to stdout, or as line-delimited JSON
 * to the configured log file when one is set. An explicit `RUST_LOG` beats
 * the configured level.
 */

use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, ServerConfig};
use crate::error::{Result, ServerError};

/// Filter directive when `RUST_LOG` is absent.
fn default_directive(level: LogLevel) -> String {
    let level = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };
    format!("starport={level}")
}

fn filter_for(level: LogLevel) -> Result<EnvFilter> {
    let spec = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env_spec) => env_spec,
        Err(_) => default_directive(level),
    };
    EnvFilter::try_new(&spec)
        .map_err(|e| ServerError::Config(format!("bad log filter '{}': {}", spec, e)))
}

/// Install the process-wide subscriber from configuration.
pub fn init_logging(config: &ServerConfig) -> Result<()> {
    let filter = filter_for(config.server.log_level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);

    match config.server.log_file.as_deref() {
        None => builder.compact().init(),
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                ServerError::Config(format!("cannot open log file {}: {}", path, e))
            })?;
            builder
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
    }
    Ok(())
}

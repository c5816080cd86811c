//! Logging and tracing initialization.
//!
//! Human-readable console lines by default, JSON lines with `--json-logs`.
//! Task executions run inside a `transfer` span, so every line logged by a
//! strategy carries the task id and strategy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::core::models::TaskId;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line
    pub json: bool,
    /// DEBUG instead of INFO for this crate
    pub verbose: bool,
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, after configuration is loaded. `RUST_LOG` overrides the
/// default filter. Logs go to stderr so stdout stays free for results.
///
/// # Examples
///
/// ```ignore
/// shuttle::logging::init(LogConfig::default());
/// shuttle::logging::init(LogConfig { json: true, verbose: true });
/// ```
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "shuttle={level},warn",
            level = default_level.as_str().to_lowercase()
        ))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Rate limit for per-task progress lines in the CLI.
///
/// Each task has its own window. A task's first update always passes, and
/// so does any update that crosses a quarter mark (25, 50, 75 %) since the
/// last line logged for it.
pub struct ProgressLogThrottle {
    interval: Duration,
    tasks: HashMap<TaskId, LastLine>,
}

struct LastLine {
    at: Instant,
    percent: u8,
}

impl ProgressLogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tasks: HashMap::new(),
        }
    }

    /// Whether a progress line for `id` at `percent` should be logged now.
    pub fn should_log(&mut self, id: TaskId, percent: u8, now: Instant) -> bool {
        let Some(last) = self.tasks.get_mut(&id) else {
            self.tasks.insert(id, LastLine { at: now, percent });
            return true;
        };

        let crossed_mark = percent / 25 > last.percent / 25;
        if crossed_mark || now.saturating_duration_since(last.at) >= self.interval {
            *last = LastLine { at: now, percent };
            true
        } else {
            false
        }
    }

    /// Drop the window of a task that has finished.
    pub fn forget(&mut self, id: TaskId) {
        self.tasks.remove(&id);
    }
}

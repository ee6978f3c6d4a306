// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry: tracing initialization and the NDJSON event feed.
//!
//! Operator-facing logs go through `tracing`; machine consumers (the external
//! dashboard tails the feed) get one JSON object per line through
//! [`EventLog`], with the fixed field set
//! `{timestamp, level, agentId, agentRole, taskId?, message, data?}`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,

    /// Whether to use compact log format.
    pub compact: bool,

    /// Emit logs as JSON instead of human-readable text.
    pub json: bool,

    /// Custom filter directive (overrides default_level).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            ansi_colors: true,
            compact: true,
            json: false,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Create a config suitable for unattended runs: JSON, no colors.
    pub fn headless() -> Self {
        Self {
            default_level: Level::INFO,
            ansi_colors: false,
            compact: true,
            json: true,
            filter_directive: None,
        }
    }

    /// Set the default log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Set a custom filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }
}

/// Guard that flushes telemetry on drop.
///
/// Keep this guard alive for the duration of your program.
pub struct TelemetryGuard {
    _private: (),
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Reserved for flushing buffered exporters.
    }
}

/// Initialize telemetry with the given configuration.
///
/// This should be called once at application startup.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    // RUST_LOG env var takes precedence over the configured level.
    let filter = match &config.filter_directive {
        Some(directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.default_level))),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.default_level))),
    };

    let fmt_layer = fmt::layer().with_ansi(config.ansi_colors).with_target(true);

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init()
    } else if config.compact {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
    };

    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(TelemetryGuard { _private: () })
}

// ============================================================================
// NDJSON event feed
// ============================================================================

/// One line of the NDJSON event feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub agent_id: String,
    pub agent_role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEvent {
    /// Create an info-level event.
    pub fn info(
        agent_id: impl Into<String>,
        agent_role: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level: "info".to_string(),
            agent_id: agent_id.into(),
            agent_role: agent_role.into(),
            task_id: None,
            message: message.into(),
            data: None,
        }
    }

    /// Set the level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Attach a task id.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Append-only NDJSON sink for [`LogEvent`]s.
///
/// Write failures are swallowed with a warning; the feed is observability,
/// not control flow, and must never take the orchestrator down.
pub struct EventLog {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl EventLog {
    /// Open an event log at `path`, appending to an existing file.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Some(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Create a disabled event log that drops every event.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Whether events are actually being written.
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Emit one event as a single JSON line.
    pub fn emit(&self, event: &LogEvent) {
        let Some(writer) = &self.writer else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize log event: {}", e);
                return;
            }
        };
        let mut guard = match writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(guard, "{}", line).and_then(|_| guard.flush()) {
            tracing::warn!("Failed to write log event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, Level::INFO);
        assert!(config.ansi_colors);
        assert!(!config.json);
    }

    #[test]
    fn test_telemetry_config_headless() {
        let config = TelemetryConfig::headless();
        assert!(config.json);
        assert!(!config.ansi_colors);
    }

    #[test]
    fn test_log_event_builder() {
        let event = LogEvent::info("planner", "planner", "dispatched batch")
            .with_level("debug")
            .with_task("task-003")
            .with_data(serde_json::json!({"count": 4}));

        assert_eq!(event.level, "debug");
        assert_eq!(event.task_id.as_deref(), Some("task-003"));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"agentId\":\"planner\""));
        assert!(json.contains("\"taskId\":\"task-003\""));
        assert!(json.contains("\"count\":4"));
    }

    #[test]
    fn test_log_event_omits_absent_fields() {
        let event = LogEvent::info("monitor", "monitor", "tick");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("taskId"));
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_event_log_writes_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let log = EventLog::open(&path).unwrap();
        assert!(log.is_enabled());

        log.emit(&LogEvent::info("a", "worker", "line one"));
        log.emit(&LogEvent::info("b", "worker", "line two").with_task("t2"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: LogEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.message, "line one");
        let second: LogEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.task_id.as_deref(), Some("t2"));
    }

    #[test]
    fn test_event_log_disabled() {
        let log = EventLog::disabled();
        assert!(!log.is_enabled());
        // Must not panic.
        log.emit(&LogEvent::info("x", "x", "dropped"));
    }
}

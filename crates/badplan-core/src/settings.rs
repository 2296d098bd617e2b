//! Runtime-tunable parameters of the plugin.
//!
//! The store publishes an immutable [`Settings`] value behind an `Arc`.
//! Readers take a snapshot once per callback and never see a half-applied
//! write: a ratio change swaps the whole value, bounds included.
//!
//! Parameters can be set either through the typed setters or by name with a
//! textual value, the way a host configuration registry passes them in:
//!
//! ```
//! use badplan_core::settings::SettingsStore;
//!
//! let store = SettingsStore::new();
//! store.set("pg_badplan.ratio", "0.5").unwrap();
//! store.set("min_row_threshold", "200").unwrap();
//! assert_eq!(store.snapshot().bounds.over, 2.0);
//! assert_eq!(store.show("pg_badplan.min_row_threshold").unwrap(), "200");
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::module::MODULE_NAME;
use crate::ratio::RatioBounds;

pub const DEFAULT_ENABLED: bool = true;
pub const DEFAULT_RATIO: f64 = 0.2;
pub const DEFAULT_MIN_ROW_THRESHOLD: u32 = 1000;
pub const DEFAULT_MIN_DUMP_INTERVAL_MS: u32 = 60_000;

/// Upper bound for integer parameters (host integers are 32-bit).
const INT_MAX: i64 = i32::MAX as i64;

/// One consistent view of every parameter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Settings {
    pub enabled: bool,
    pub bounds: RatioBounds,
    pub min_row_threshold: u32,
    /// When set, flagged queries are dumped to files here instead of logged.
    pub log_directory: Option<PathBuf>,
    pub min_dump_interval_ms: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_ENABLED,
            bounds: RatioBounds::new(DEFAULT_RATIO),
            min_row_threshold: DEFAULT_MIN_ROW_THRESHOLD,
            log_directory: None,
            min_dump_interval_ms: DEFAULT_MIN_DUMP_INTERVAL_MS,
        }
    }
}

/// Parameters exposed to the configuration registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parameter {
    Enabled,
    Ratio,
    MinRowThreshold,
    LogDirectory,
    MinDumpIntervalMs,
}

impl Parameter {
    pub const ALL: [Parameter; 5] = [
        Parameter::Enabled,
        Parameter::Ratio,
        Parameter::MinRowThreshold,
        Parameter::LogDirectory,
        Parameter::MinDumpIntervalMs,
    ];

    /// Name without the module prefix.
    pub fn short_name(self) -> &'static str {
        match self {
            Parameter::Enabled => "enabled",
            Parameter::Ratio => "ratio",
            Parameter::MinRowThreshold => "min_row_threshold",
            Parameter::LogDirectory => "log_directory",
            Parameter::MinDumpIntervalMs => "min_dump_interval_ms",
        }
    }

    /// Fully qualified name, e.g. `pg_badplan.ratio`.
    pub fn name(self) -> String {
        format!("{MODULE_NAME}.{}", self.short_name())
    }

    pub fn description(self) -> &'static str {
        match self {
            Parameter::Enabled => "Enable / Disable pg_badplan",
            Parameter::Ratio => "Ratio of actual to estimated rows considered a bad plan",
            Parameter::MinRowThreshold => {
                "Minimum estimated or actual rows before a plan is considered"
            }
            Parameter::LogDirectory => {
                "Directory to dump bad plan queries to; empty logs them inline"
            }
            Parameter::MinDumpIntervalMs => "Minimum interval in milliseconds between dumps",
        }
    }

    pub fn default_value(self) -> String {
        match self {
            Parameter::Enabled => format_bool(DEFAULT_ENABLED),
            Parameter::Ratio => DEFAULT_RATIO.to_string(),
            Parameter::MinRowThreshold => DEFAULT_MIN_ROW_THRESHOLD.to_string(),
            Parameter::LogDirectory => String::new(),
            Parameter::MinDumpIntervalMs => DEFAULT_MIN_DUMP_INTERVAL_MS.to_string(),
        }
    }

    /// Resolves a parameter name, with or without the module prefix.
    /// Matching is case-insensitive.
    pub fn lookup(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let prefix = format!("{MODULE_NAME}.");
        let short = name.strip_prefix(&prefix).unwrap_or(&name);
        Self::ALL.into_iter().find(|p| p.short_name() == short)
    }
}

/// Row of the `show` listing.
#[derive(Clone, Debug, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    pub value: String,
    pub default: String,
    pub description: &'static str,
}

/// Process-wide parameter store.
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore {
    /// Store holding the defaults. The default ratio bounds are announced the
    /// same way a later ratio change is.
    pub fn new() -> Self {
        let settings = Settings {
            bounds: RatioBounds::recalculate(DEFAULT_RATIO),
            ..Settings::default()
        };
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// Returns the currently published settings.
    pub fn snapshot(&self) -> Arc<Settings> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.publish(|s| s.enabled = enabled);
    }

    /// Sets the base ratio and recomputes the bounds before publishing them.
    pub fn set_ratio(&self, ratio: f64) -> Result<(), ConfigError> {
        if ratio.is_nan() {
            return Err(ConfigError::InvalidValue {
                name: Parameter::Ratio.name(),
                value: ratio.to_string(),
            });
        }
        if ratio <= 0.0 || ratio > 1.0 {
            return Err(ConfigError::OutOfRange {
                name: Parameter::Ratio.name(),
                value: ratio.to_string(),
                min: "0 (exclusive)".to_string(),
                max: "1".to_string(),
            });
        }
        let bounds = RatioBounds::recalculate(ratio);
        self.publish(|s| s.bounds = bounds);
        Ok(())
    }

    pub fn set_min_row_threshold(&self, rows: i64) -> Result<(), ConfigError> {
        let rows = check_int_range(Parameter::MinRowThreshold, rows)?;
        self.publish(|s| s.min_row_threshold = rows);
        Ok(())
    }

    pub fn set_min_dump_interval_ms(&self, ms: i64) -> Result<(), ConfigError> {
        let ms = check_int_range(Parameter::MinDumpIntervalMs, ms)?;
        self.publish(|s| s.min_dump_interval_ms = ms);
        Ok(())
    }

    /// Sets the dump directory.
    ///
    /// An empty value unsets it (queries are logged inline). A non-empty
    /// value must name a directory the current process can create files in.
    pub fn set_log_directory(&self, dir: &str) -> Result<(), ConfigError> {
        let dir = dir.trim();
        if dir.is_empty() {
            self.publish(|s| s.log_directory = None);
            return Ok(());
        }

        let path = PathBuf::from(dir);
        check_writable(&path)?;
        info!(directory = %path.display(), "pg_badplan: dumping bad plan queries to directory");
        self.publish(|s| s.log_directory = Some(path));
        Ok(())
    }

    /// Sets a parameter from its textual representation.
    pub fn set(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let param =
            Parameter::lookup(name).ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))?;
        let invalid = || ConfigError::InvalidValue {
            name: param.name(),
            value: value.to_string(),
        };

        match param {
            Parameter::Enabled => {
                let enabled = parse_bool(value).ok_or_else(invalid)?;
                self.set_enabled(enabled);
            }
            Parameter::Ratio => {
                let ratio: f64 = value.trim().parse().map_err(|_| invalid())?;
                self.set_ratio(ratio)?;
            }
            Parameter::MinRowThreshold => {
                let rows: i64 = value.trim().parse().map_err(|_| invalid())?;
                self.set_min_row_threshold(rows)?;
            }
            Parameter::LogDirectory => self.set_log_directory(value)?,
            Parameter::MinDumpIntervalMs => {
                let ms: i64 = value.trim().parse().map_err(|_| invalid())?;
                self.set_min_dump_interval_ms(ms)?;
            }
        }
        debug!(parameter = %param.name(), value, "parameter set");
        Ok(())
    }

    /// Renders the current value of a parameter.
    pub fn show(&self, name: &str) -> Result<String, ConfigError> {
        let param =
            Parameter::lookup(name).ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))?;
        Ok(render(param, &self.snapshot()))
    }

    /// Lists every parameter with its current and default value.
    pub fn parameters(&self) -> Vec<ParameterInfo> {
        let settings = self.snapshot();
        Parameter::ALL
            .into_iter()
            .map(|p| ParameterInfo {
                name: p.name(),
                value: render(p, &settings),
                default: p.default_value(),
                description: p.description(),
            })
            .collect()
    }

    /// Copy-on-write swap of the published settings.
    fn publish(&self, apply: impl FnOnce(&mut Settings)) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Settings::clone(&guard);
        apply(&mut next);
        *guard = Arc::new(next);
    }
}

fn render(param: Parameter, settings: &Settings) -> String {
    match param {
        Parameter::Enabled => format_bool(settings.enabled),
        Parameter::Ratio => settings.bounds.ratio.to_string(),
        Parameter::MinRowThreshold => settings.min_row_threshold.to_string(),
        Parameter::LogDirectory => settings
            .log_directory
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        Parameter::MinDumpIntervalMs => settings.min_dump_interval_ms.to_string(),
    }
}

fn check_int_range(param: Parameter, value: i64) -> Result<u32, ConfigError> {
    if !(0..=INT_MAX).contains(&value) {
        return Err(ConfigError::OutOfRange {
            name: param.name(),
            value: value.to_string(),
            min: "0".to_string(),
            max: INT_MAX.to_string(),
        });
    }
    Ok(value as u32)
}

/// Probes the directory by creating (and immediately dropping) an anonymous file.
fn check_writable(path: &Path) -> Result<(), ConfigError> {
    tempfile::tempfile_in(path)
        .map(drop)
        .map_err(|source| ConfigError::Directory {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" | "t" | "y" => Some(true),
        "off" | "false" | "no" | "0" | "f" | "n" => Some(false),
        _ => None,
    }
}

fn format_bool(value: bool) -> String {
    let text = if value { "on" } else { "off" };
    text.to_string()
}

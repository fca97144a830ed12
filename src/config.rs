//! Configuration management for the monitoring daemon
//!
//! This module handles loading, parsing, and validating the daemon's JSON
//! configuration file, which declares the monitored commands, the regular
//! expressions extracting numeric properties from their output, and the
//! charts grouping those properties.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mad.json";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port for the HTTP service; overrides the CLI flag when set
    #[serde(rename = "Port", default)]
    pub port: Option<u16>,

    /// Monitored command declarations
    #[serde(rename = "Handlers", default)]
    pub handlers: Vec<HandlerConfig>,
}

/// Kind of poller a handler entry configures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Executes a command line and extracts properties from its output
    Command,
    /// Reads kernel CPU counters from /proc/stat
    CpuLoad,
}

/// Configuration for one registered handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Handler type; defaults to "command", matched case-insensitively
    #[serde(rename = "Type", default)]
    pub handler_type: String,

    /// Human readable label used in HTML pages
    #[serde(rename = "Name", default)]
    pub name: String,

    /// Command line, split on whitespace into argv; no shell interpretation
    #[serde(rename = "Cmd", default)]
    pub cmd: String,

    /// HTTP mount point; must start with '/'
    #[serde(rename = "URL", default)]
    pub url: String,

    /// Poll interval such as "1s" or "500ms"; empty means on-demand only
    #[serde(rename = "PollInterval", default)]
    pub poll_interval: String,

    /// Numeric properties extracted from the command output
    #[serde(rename = "Properties", default)]
    pub properties: Vec<PropertyConfig>,

    /// Chart definitions grouping property names
    #[serde(rename = "Charts", default)]
    pub charts: Vec<ChartConfig>,
}

/// A named property with the regex extracting it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    #[serde(rename = "Name")]
    pub name: String,

    /// Regular expression with exactly one capture group
    #[serde(rename = "Regex")]
    pub regex: String,
}

/// One chart over a group of properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    #[serde(rename = "Name")]
    pub name: String,

    /// Names of the properties drawn as series on this chart
    #[serde(rename = "Properties", default)]
    pub properties: Vec<String>,
}

impl Config {
    /// Load and validate configuration from a JSON file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed { path: path.to_path_buf(), source: e })?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen_urls = Vec::new();
        for handler in &self.handlers {
            handler.validate()?;
            if seen_urls.contains(&handler.url) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("duplicate handler URL {}", handler.url),
                });
            }
            seen_urls.push(handler.url.clone());
        }
        Ok(())
    }
}

impl HandlerConfig {
    /// Resolve the handler kind from the type string
    pub fn kind(&self) -> ConfigResult<HandlerKind> {
        match self.handler_type.to_lowercase().as_str() {
            "" | "command" => Ok(HandlerKind::Command),
            "cpu" | "cpuload" | "cpu-load" => Ok(HandlerKind::CpuLoad),
            other => Err(ConfigError::UnknownHandlerType { value: other.to_string() }),
        }
    }

    /// Parse the poll interval; `None` means the handler is never scheduled
    pub fn interval(&self) -> ConfigResult<Option<Duration>> {
        if self.poll_interval.is_empty() {
            return Ok(None);
        }
        parse_duration(&self.poll_interval).map(Some)
    }

    /// Validate a single handler entry
    pub fn validate(&self) -> ConfigResult<()> {
        let kind = self.kind()?;

        if !self.url.starts_with('/') {
            return Err(ConfigError::ValidationFailed {
                reason: format!("handler {} URL must start with '/': {:?}", self.name, self.url),
            });
        }
        self.interval()?;

        if kind == HandlerKind::Command && self.cmd.split_whitespace().next().is_none() {
            return Err(ConfigError::ValidationFailed {
                reason: format!("handler {} has an empty command line", self.name),
            });
        }

        for prop in &self.properties {
            let re = Regex::new(&prop.regex).map_err(|e| ConfigError::InvalidRegex {
                property: prop.name.clone(),
                reason: e.to_string(),
            })?;
            // captures_len counts the implicit whole-match group
            if re.captures_len() != 2 {
                return Err(ConfigError::RegexGroupCount { property: prop.name.clone() });
            }
        }

        for chart in &self.charts {
            for prop_name in &chart.properties {
                if !self.properties.iter().any(|p| &p.name == prop_name) {
                    return Err(ConfigError::ValidationFailed {
                        reason: format!(
                            "chart {} references unknown property {}",
                            chart.name, prop_name
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse a duration string such as "500ms", "1s", "2m", "1h" or "1m30s".
///
/// Accepts a sequence of `<number><unit>` segments where the number may be
/// fractional and the unit is one of ms, s, m, h.
pub fn parse_duration(value: &str) -> ConfigResult<Duration> {
    let bad = || ConfigError::InvalidDuration { value: value.to_string() };

    let mut total = Duration::ZERO;
    let mut rest = value.trim();
    if rest.is_empty() {
        return Err(bad());
    }
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(bad)?;
        let (num_str, tail) = rest.split_at(num_end);
        let number: f64 = num_str.parse().map_err(|_| bad())?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let seconds = match unit {
            "ms" => number / 1000.0,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            _ => return Err(bad()),
        };
        total += Duration::from_secs_f64(seconds);
        rest = next;
    }
    Ok(total)
}

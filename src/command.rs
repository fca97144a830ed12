//! Command poller
//!
//! Periodically executes a configured command line, extracts numeric
//! properties from its output with per-property regular expressions, and
//! appends them to one time-series table per property. Also serves the
//! handler's HTML page and its chart SVGs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Response};
use regex::Regex;
use tracing::{debug, warn};

use crate::chart::render_chart;
use crate::config::{ChartConfig, HandlerConfig};
use crate::error::{ConfigError, MadError, Result, StoreError};
use crate::handler::{escape_html, html_response, text_response, Handler, DEFAULT_TABLE_LEVELS};
use crate::paths;
use crate::store::Table;

/// Poller that runs a command line and stores extracted properties
pub struct CommandHandler {
    name: String,
    url: String,
    interval: Option<Duration>,
    /// Unsplit command line, for display
    cmd_line: String,
    /// Command line split on whitespace; no shell interpretation
    argv: Vec<String>,
    /// Property name and the regex with its single capture group
    properties: Vec<(String, Regex)>,
    charts: Vec<ChartConfig>,
    /// One table per property
    tables: HashMap<String, Table>,
}

impl CommandHandler {
    /// Build a command handler from its configuration entry, opening (or
    /// reopening) the property tables under `data_root`.
    pub fn new(conf: &HandlerConfig, data_root: &Path) -> Result<Self> {
        conf.validate().map_err(MadError::Config)?;
        let interval = conf.interval().map_err(MadError::Config)?;

        let mut properties = Vec::new();
        let mut tables = HashMap::new();
        for prop in &conf.properties {
            // Validation already proved the regex compiles
            let re = Regex::new(&prop.regex).map_err(|e| {
                MadError::Config(ConfigError::InvalidRegex {
                    property: prop.name.clone(),
                    reason: e.to_string(),
                })
            })?;
            properties.push((prop.name.clone(), re));

            let dir = paths::table_dir(data_root, &conf.url, &prop.name);
            tables.insert(prop.name.clone(), Table::open(&dir, &DEFAULT_TABLE_LEVELS)?);
        }

        // Without explicit chart groups, every property gets its own chart
        let charts = if conf.charts.is_empty() {
            conf.properties
                .iter()
                .map(|p| ChartConfig { name: p.name.clone(), properties: vec![p.name.clone()] })
                .collect()
        } else {
            conf.charts.clone()
        };

        Ok(Self {
            name: conf.name.clone(),
            url: conf.url.clone(),
            interval,
            cmd_line: conf.cmd.clone(),
            argv: conf.cmd.split_whitespace().map(str::to_string).collect(),
            properties,
            charts,
            tables,
        })
    }

    /// Run the command once and extract the current property values.
    ///
    /// Returns the raw output (or a synthetic error description) together
    /// with the property values captured from it. Each property takes the
    /// first line its regex captures; commands like `vmstat -s` emit one
    /// labeled line per statistic, so matching is line by line.
    async fn stat(&self) -> (String, Vec<(String, String)>) {
        let output = match tokio::process::Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .output()
            .await
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => {
                warn!(cmd = %self.cmd_line, error = %e, "Command execution failed");
                return (
                    format!("Error executing command line \"{}\": {}\n", self.cmd_line, e),
                    Vec::new(),
                );
            }
        };

        let mut values = Vec::new();
        for (name, re) in &self.properties {
            for line in output.lines() {
                if let Some(caps) = re.captures(line) {
                    if let Some(group) = caps.get(1) {
                        values.push((name.clone(), group.as_str().to_string()));
                        break;
                    }
                }
            }
        }
        (output, values)
    }

    /// Serve the handler's base page: fresh command output plus charts
    async fn serve_page(&self) -> Result<Response<Body>> {
        let (output, _) = self.stat().await;

        let mut output_html = String::new();
        for line in output.lines() {
            output_html.push_str(&format!("        <code>{}</code> <br>\n", escape_html(line)));
        }

        let depth = DEFAULT_TABLE_LEVELS.len();
        let mut charts_html = String::new();
        for chart in &self.charts {
            let chart_name = escape_html(&chart.name);
            charts_html.push_str(&format!(
                "    <h2 style=\"text-align:center\">{}</h2>\n",
                chart_name
            ));
            charts_html.push_str(&format!(
                "    <img src=\"{}/{}/{}\" alt=\"{}\" style=\"width:100%\"> <br>\n",
                escape_html(&self.url),
                chart_name,
                depth - 1,
                chart_name
            ));
            let links: Vec<String> = (0..depth)
                .map(|level| {
                    format!(
                        "<a href=\"{}/{}/{}\">level {}</a>",
                        escape_html(&self.url),
                        chart_name,
                        level,
                        level
                    )
                })
                .collect();
            charts_html.push_str(&format!("    <p>{}</p>\n", links.join(" | ")));
        }

        let title = escape_html(&self.cmd_line);
        let body = format!(
            r#"<!DOCTYPE html>
<html>
  <head>
    <title>{title}</title>
  </head>
  <body>
    <h1 style="text-align:center">{title}</h1>
    <table border="line" style="width:100%">
      <caption>{title} Output</caption>
      <tr>
        <td>
{output_html}        </td>
      </tr>
    </table>
{charts_html}  </body>
</html>
"#
        );
        Ok(html_response(body))
    }

    /// Serve a chart spec of the form `<chart name>/<level index>`
    async fn serve_chart(&self, sub: &str) -> Result<Response<Body>> {
        let Some((chart_name, level_str)) = sub.rsplit_once('/') else {
            return Ok(text_response(404, &format!("unknown chart spec: {}", sub)));
        };
        let Ok(level) = level_str.parse::<usize>() else {
            return Ok(text_response(404, &format!("bad level index: {}", level_str)));
        };
        let Some(chart) = self.charts.iter().find(|c| c.name == chart_name) else {
            return Ok(text_response(404, &format!("unknown chart: {}", chart_name)));
        };

        let mut series = Vec::new();
        for prop_name in &chart.properties {
            let Some(table) = self.tables.get(prop_name) else {
                continue;
            };
            match table.read_level(level) {
                Ok(data) => series.push((prop_name.clone(), data)),
                Err(StoreError::NoSuchLevel { .. }) => {
                    return Ok(text_response(404, &format!("no such level: {}", level)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let svg = render_chart(&chart.name, &series)?;
        Ok(Response::builder()
            .status(200)
            .header("Content-Type", "image/svg+xml")
            .body(Body::from(svg))
            .unwrap())
    }
}

#[async_trait]
impl Handler for CommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.url
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Run the command and store every extracted property value
    async fn execute(&self) -> Result<usize> {
        let (_, values) = self.stat().await;
        let mut written = 0;
        for (name, raw) in values {
            let value = parse_float_prefix(&raw);
            if let Some(table) = self.tables.get(&name) {
                table.add(value)?;
                written += 1;
            } else {
                debug!(property = %name, "No table for extracted property");
            }
        }
        Ok(written)
    }

    async fn serve(&self, sub: &str) -> Result<Response<Body>> {
        if sub.is_empty() {
            self.serve_page().await
        } else {
            self.serve_chart(sub).await
        }
    }
}

/// Parse the longest numeric prefix of a captured value.
///
/// Extraction regexes often capture more than a clean float (a version
/// string like "5.1.0", a value with a unit suffix). The longest finite
/// leading float wins; a value with no numeric prefix stores 0.
pub(crate) fn parse_float_prefix(s: &str) -> f64 {
    let s = s.trim();
    for end in (1..=s.len()).rev() {
        if !s.is_char_boundary(end) {
            continue;
        }
        if let Ok(value) = s[..end].parse::<f64>() {
            if value.is_finite() {
                return value;
            }
        }
    }
    0.0
}

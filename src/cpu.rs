//! CPU load poller
//!
//! Reads the aggregate `cpu` line of `/proc/stat`, computes per-counter
//! deltas against the previous snapshot, and stores the user, system and
//! idle fractions of the elapsed time into three time-series tables.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Response};
use tracing::warn;

use crate::chart::render_chart;
use crate::config::HandlerConfig;
use crate::error::{MadError, Result, StoreError};
use crate::handler::{escape_html, html_response, text_response, Handler, DEFAULT_TABLE_LEVELS};
use crate::paths;
use crate::store::Table;

/// Default kernel counter source
const PROC_STAT: &str = "/proc/stat";

/// Cumulative CPU time counters from the first line of /proc/stat, in
/// jiffies. Parsed as 64-bit: the counters are cumulative and overflow
/// 32 bits on long-lived hosts; only the deltas matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCounters {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

/// Fractions of elapsed time spent in each mode, each in [0, 1]
#[derive(Debug, Clone, Copy)]
pub struct CpuFractions {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

impl CpuCounters {
    /// Parse the aggregate `cpu` line out of /proc/stat content
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let mut fields = line.split_whitespace().skip(1).map(|f| f.parse::<u64>());

        let mut next = || fields.next()?.ok();
        Some(Self {
            user: next()?,
            nice: next()?,
            system: next()?,
            idle: next()?,
            iowait: next()?,
            irq: next()?,
            softirq: next()?,
        })
    }

    /// Fractions of time spent per mode since `prev`.
    ///
    /// Returns `None` when no time elapsed between the snapshots.
    pub fn fractions_since(&self, prev: &CpuCounters) -> Option<CpuFractions> {
        let user = self.user.saturating_sub(prev.user);
        let nice = self.nice.saturating_sub(prev.nice);
        let system = self.system.saturating_sub(prev.system);
        let idle = self.idle.saturating_sub(prev.idle);
        let iowait = self.iowait.saturating_sub(prev.iowait);
        let irq = self.irq.saturating_sub(prev.irq);
        let softirq = self.softirq.saturating_sub(prev.softirq);

        let total = user + nice + system + idle + iowait + irq + softirq;
        if total == 0 {
            return None;
        }
        let total = total as f64;
        Some(CpuFractions {
            user: user as f64 / total,
            system: system as f64 / total,
            idle: idle as f64 / total,
        })
    }
}

struct CpuState {
    /// Previous counter snapshot; the first tick only establishes this
    prev: Option<CpuCounters>,
    /// Most recently computed fractions, for the HTML page
    last: Option<CpuFractions>,
}

/// Poller sampling kernel CPU counters into user/system/idle tables
pub struct CpuHandler {
    name: String,
    url: String,
    interval: Option<Duration>,
    stat_path: PathBuf,
    user: Table,
    system: Table,
    idle: Table,
    state: Mutex<CpuState>,
}

impl CpuHandler {
    /// Build a CPU handler from its configuration entry, opening (or
    /// reopening) the three fraction tables under `data_root`.
    pub fn new(conf: &HandlerConfig, data_root: &Path) -> Result<Self> {
        conf.validate().map_err(MadError::Config)?;
        let interval = conf.interval().map_err(MadError::Config)?;

        let open = |prop: &str| -> Result<Table> {
            let dir = paths::table_dir(data_root, &conf.url, prop);
            Ok(Table::open(&dir, &DEFAULT_TABLE_LEVELS)?)
        };

        Ok(Self {
            name: conf.name.clone(),
            url: conf.url.clone(),
            interval,
            stat_path: PathBuf::from(PROC_STAT),
            user: open("user")?,
            system: open("system")?,
            idle: open("idle")?,
            state: Mutex::new(CpuState { prev: None, last: None }),
        })
    }

    /// Override the kernel counter source (a file with /proc/stat syntax)
    pub fn with_stat_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stat_path = path.into();
        self
    }

    async fn serve_page(&self) -> Result<Response<Body>> {
        let last = self.state.lock().unwrap().last;
        let current = match last {
            Some(f) => format!(
                "user {:.1}%, system {:.1}%, idle {:.1}%",
                f.user * 100.0,
                f.system * 100.0,
                f.idle * 100.0
            ),
            None => "no samples yet".to_string(),
        };

        let depth = DEFAULT_TABLE_LEVELS.len();
        let mut charts_html = String::new();
        charts_html.push_str(&format!(
            "    <img src=\"{}/{}\" alt=\"cpu\" style=\"width:100%\"> <br>\n",
            escape_html(&self.url),
            depth - 1
        ));
        let links: Vec<String> = (0..depth)
            .map(|level| {
                format!("<a href=\"{}/{}\">level {}</a>", escape_html(&self.url), level, level)
            })
            .collect();
        charts_html.push_str(&format!("    <p>{}</p>\n", links.join(" | ")));

        let title = escape_html(&self.name);
        let body = format!(
            r#"<!DOCTYPE html>
<html>
  <head>
    <title>{title}</title>
  </head>
  <body>
    <h1 style="text-align:center">{title}</h1>
    <p style="text-align:center"><code>{current}</code></p>
{charts_html}  </body>
</html>
"#
        );
        Ok(html_response(body))
    }

    /// Serve a chart spec of the form `<level index>`
    async fn serve_chart(&self, sub: &str) -> Result<Response<Body>> {
        let Ok(level) = sub.parse::<usize>() else {
            return Ok(text_response(404, &format!("bad level index: {}", sub)));
        };

        let mut series = Vec::new();
        for (name, table) in
            [("user", &self.user), ("system", &self.system), ("idle", &self.idle)]
        {
            match table.read_level(level) {
                Ok(data) => series.push((name.to_string(), data)),
                Err(StoreError::NoSuchLevel { .. }) => {
                    return Ok(text_response(404, &format!("no such level: {}", level)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let svg = render_chart(&self.name, &series)?;
        Ok(Response::builder()
            .status(200)
            .header("Content-Type", "image/svg+xml")
            .body(Body::from(svg))
            .unwrap())
    }
}

#[async_trait]
impl Handler for CpuHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.url
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Snapshot the counters and store the fractions since the previous
    /// snapshot. The first tick establishes the baseline and stores
    /// nothing.
    async fn execute(&self) -> Result<usize> {
        // An unreadable counter source degrades like a failed command:
        // no samples this tick, daemon stays up
        let stat = tokio::fs::read_to_string(&self.stat_path).await.map_err(|e| {
            MadError::CommandFailed { cmd: self.stat_path.display().to_string(), source: e }
        })?;
        let Some(current) = CpuCounters::parse(&stat) else {
            warn!(path = %self.stat_path.display(), "Failed to parse CPU counters");
            return Ok(0);
        };

        let fractions = {
            let mut state = self.state.lock().unwrap();
            let fractions = state.prev.and_then(|prev| current.fractions_since(&prev));
            state.prev = Some(current);
            if fractions.is_some() {
                state.last = fractions;
            }
            fractions
        };

        match fractions {
            Some(f) => {
                self.user.add(f.user)?;
                self.system.add(f.system)?;
                self.idle.add(f.idle)?;
                Ok(3)
            }
            None => Ok(0),
        }
    }

    async fn serve(&self, sub: &str) -> Result<Response<Body>> {
        if sub.is_empty() {
            self.serve_page().await
        } else {
            self.serve_chart(sub).await
        }
    }
}

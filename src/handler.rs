//! HTTP handler contract and registry
//!
//! Every page the daemon serves is backed by a handler: the command and
//! CPU pollers, the configuration dump, and the root index. The scheduler
//! and the HTTP server depend only on the [`Handler`] trait.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Response};

use crate::error::Result;
use crate::store::LevelProps;

/// Default resolution stack for poller tables, finest first.
///
/// At one-second polling the three levels cover roughly five minutes,
/// five hours, and ten days.
pub const DEFAULT_TABLE_LEVELS: [LevelProps; 3] = [
    LevelProps { roll_up: 60, cap: 300 },
    LevelProps { roll_up: 60, cap: 300 },
    LevelProps { roll_up: 60, cap: 240 },
];

/// A registered page that may also produce samples when polled
#[async_trait]
pub trait Handler: Send + Sync {
    /// Human readable label used in the HTML index
    fn name(&self) -> &str;

    /// HTTP mount point, starting with '/'
    fn path(&self) -> &str;

    /// Poll interval; `None` means the handler is served on demand only
    fn poll_interval(&self) -> Option<Duration>;

    /// Run one poll tick and return the number of samples written
    async fn execute(&self) -> Result<usize>;

    /// Serve a request. `sub` is the path remainder below the mount
    /// point: empty for the base page, or a chart spec such as
    /// `memory/2`.
    async fn serve(&self, sub: &str) -> Result<Response<Body>>;
}

/// Immutable path-to-handler map.
///
/// Built once at startup before the scheduler and server run, so lookups
/// need no lock.
#[derive(Default)]
pub struct Registry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { handlers: BTreeMap::new() }
    }

    /// Register a handler under its mount point
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.path().to_string(), handler);
    }

    /// Resolve a request path to a handler plus the sub-path below its
    /// mount point.
    ///
    /// Exact matches win; otherwise the longest mount point that prefixes
    /// the path (at a segment boundary) takes it; otherwise the root
    /// handler catches everything.
    pub fn route(&self, path: &str) -> Option<(Arc<dyn Handler>, String)> {
        if let Some(handler) = self.handlers.get(path) {
            return Some((handler.clone(), String::new()));
        }

        let mut best: Option<(&String, &Arc<dyn Handler>)> = None;
        for (mount, handler) in &self.handlers {
            if mount != "/" && path.starts_with(&format!("{}/", mount)) {
                match best {
                    Some((prev, _)) if prev.len() >= mount.len() => {}
                    _ => best = Some((mount, handler)),
                }
            }
        }
        if let Some((mount, handler)) = best {
            let sub = path[mount.len() + 1..].to_string();
            return Some((handler.clone(), sub));
        }

        self.handlers.get("/").map(|h| (h.clone(), String::new()))
    }

    /// All registered handlers in path order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.values()
    }

    /// (path, name) pairs for the index page, in path order
    pub fn entries(&self) -> Vec<(String, String)> {
        self.handlers
            .iter()
            .map(|(path, handler)| (path.clone(), handler.name().to_string()))
            .collect()
    }
}

/// Escape text for interpolation into HTML
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Build an HTML response
pub fn html_response(body: String) -> Response<Body> {
    Response::builder()
        .status(200)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

/// Build a plain-text response with the given status
pub fn text_response(status: u16, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Index page listing every registered handler
pub struct RootHandler {
    entries: Vec<(String, String)>,
}

impl RootHandler {
    /// Create the root handler from a registry snapshot
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl Handler for RootHandler {
    fn name(&self) -> &str {
        "Root"
    }

    fn path(&self) -> &str {
        "/"
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self) -> Result<usize> {
        Ok(0)
    }

    async fn serve(&self, _sub: &str) -> Result<Response<Body>> {
        let mut links = String::new();
        for (path, name) in &self.entries {
            links.push_str(&format!(
                "      <a href=\"{}\">{}</a> <br>\n",
                escape_html(path),
                escape_html(name)
            ));
        }
        let body = format!(
            r#"<!DOCTYPE html>
<html>
  <head>
    <title>Registered Commands</title>
  </head>
  <body>
    <h1>Registered Commands</h1>
    <div>
{links}    </div>
  </body>
</html>
"#
        );
        Ok(html_response(body))
    }
}

/// Serves the raw configuration file
pub struct ConfigHandler {
    config_path: PathBuf,
}

impl ConfigHandler {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

#[async_trait]
impl Handler for ConfigHandler {
    fn name(&self) -> &str {
        "Config"
    }

    fn path(&self) -> &str {
        "/config"
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self) -> Result<usize> {
        Ok(0)
    }

    async fn serve(&self, _sub: &str) -> Result<Response<Body>> {
        match tokio::fs::read(&self.config_path).await {
            Ok(bytes) => Ok(Response::builder()
                .status(200)
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))
                .unwrap()),
            Err(e) => Ok(text_response(
                500,
                &format!("Couldn't open {}: {}", self.config_path.display(), e),
            )),
        }
    }
}

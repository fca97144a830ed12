//! Basic usage example for the mad monitoring daemon
//!
//! This example demonstrates the poll/extract/store pipeline: a command
//! handler polling `uptime`, the multi-resolution table it writes, and a
//! rendered SVG chart.

use mad::config::{HandlerConfig, PropertyConfig};
use mad::handler::Handler;
use mad::{CommandHandler, Table};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("mad monitoring daemon - basic usage example");
    println!("===========================================");

    let temp_dir = tempfile::TempDir::new()?;

    // A handler polling the load average out of `uptime`
    let conf = HandlerConfig {
        handler_type: String::new(),
        name: "Uptime".to_string(),
        cmd: "uptime".to_string(),
        url: "/uptime".to_string(),
        poll_interval: "1s".to_string(),
        properties: vec![PropertyConfig {
            name: "load1".to_string(),
            regex: r"load average[s]?:\s+([0-9.]+)".to_string(),
        }],
        charts: Vec::new(),
    };

    println!("Data root: {}", temp_dir.path().display());
    let handler = CommandHandler::new(&conf, temp_dir.path())?;

    println!("\nPolling {} times...", 5);
    for tick in 1..=5 {
        let written = handler.execute().await?;
        println!("  tick {}: {} sample(s) written", tick, written);
    }

    // Read the stored samples back through the table
    let table = Table::open(
        &temp_dir.path().join("uptime/load1"),
        &mad::DEFAULT_TABLE_LEVELS,
    )?;
    let finest = table.read_level(table.depth() - 1)?;
    println!("\nFinest level holds {} sample(s):", finest.len());
    for point in &finest {
        println!("  {} = {}", point.datetime().format("%H:%M:%S"), point.value);
    }

    // Render the same data as the HTTP surface would
    let response = handler.serve("load1/2").await?;
    println!("\nChart response: {} ({:?})", response.status(), response.headers()["Content-Type"]);

    Ok(())
}

//! socket-engine daemon.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!   MPX clients   │  PortSet(mpx) ─▶ MpxSession ─▶ app (echo/sink)│
//!   ─────────────▶│        │                                      │
//!                 │        ▼                                      │
//!                 │  HandlerPool(accepted) ◀─▶ BufferPool         │
//!   TCP clients   │        ▲                                      │
//!   ─────────────▶│  PortSet(proxy) ─▶ ProxyPair ─▶ upstream ─────┼──▶
//!                 │                    HandlerPool(outgoing)      │
//!                 │                                               │
//!                 │  config watcher · signals · admin · metrics   │
//!                 └──────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use socket_engine::config::{load_config, ConfigWatcher, SocketEngineConfig};
use socket_engine::lifecycle::signals;
use socket_engine::observability::logging;
use socket_engine::Engine;

#[derive(Parser)]
#[command(name = "socket-engine")]
#[command(about = "Pooled socket engine: MPX multiplexer and TCP proxy", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => SocketEngineConfig::default(),
    };
    logging::init(&config.observability);

    tracing::info!(
        target: "program_flow",
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "socket-engine starting"
    );

    let engine = Engine::build(config)?;

    // The watcher must outlive the run loop.
    let (_watcher, updates, reloader) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let reloader = watcher.reloader();
            match watcher.run() {
                Ok(w) => (Some(w), Some(updates), Some(reloader)),
                Err(e) => {
                    tracing::error!(target: "exceptions", error = %e, "Config watcher failed to start");
                    (None, Some(updates), Some(reloader))
                }
            }
        }
        None => (None, None, None),
    };

    let signal_task = signals::spawn(engine.shutdown(), reloader);
    engine.run(updates).await?;
    signal_task.abort();

    Ok(())
}

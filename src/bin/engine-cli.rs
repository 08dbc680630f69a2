use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;

use socket_engine::buffer::BufferPool;
use socket_engine::config::SocketEngineConfig;
use socket_engine::handler::HandlerPool;
use socket_engine::mpx::{self, CodecRegistry, EndpointSettings, MpxEndpoint, MpxEvent};
use socket_engine::net::ConnectionRegistry;
use socket_engine::Shutdown;

#[derive(Parser)]
#[command(name = "engine-cli")]
#[command(about = "Operator CLI for socket-engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Engine status and uptime
    Status,
    /// Buffer and handler pool statistics
    Pools,
    /// Live MPX sessions
    Sessions,
    /// Open an MPX session, send one message and wait for confirmation
    Probe {
        addr: SocketAddr,
        #[arg(long, default_value = "")]
        token: String,
        #[arg(long, default_value = "probe")]
        channel: String,
        #[arg(long, default_value = "ping")]
        message: String,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let path = match &cli.command {
        Commands::Status => "status",
        Commands::Pools => "pools",
        Commands::Sessions => "sessions",
        Commands::Probe {
            addr,
            token,
            channel,
            message,
            timeout_secs,
        } => {
            let wait = Duration::from_secs(*timeout_secs);
            return tokio::time::timeout(wait, probe(*addr, token, channel, message))
                .await
                .map_err(|_| "probe timed out")?;
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let res = reqwest::Client::new()
        .get(format!("{}/admin/{}", cli.url, path))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn probe(
    addr: SocketAddr,
    token: &str,
    channel: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SocketEngineConfig::default();
    let buffers = BufferPool::new(config.pool.buffer_settings());
    let pool = HandlerPool::cache("probe", buffers, config.handler_settings());
    let endpoint = MpxEndpoint::new(
        pool,
        ConnectionRegistry::new(),
        Shutdown::new(),
        EndpointSettings {
            session: config.mpx.session_settings(std::sync::Arc::new(CodecRegistry::new())),
            socket: config.socket_options(),
            connect_timeout: config.connect_timeout(),
        },
    );

    let mut conn = mpx::connect(&endpoint, addr, token.as_bytes()).await?;
    let version = conn.wait_multiplexed().await?;
    println!("Multiplexed, protocol {}", version);

    conn.handle.request_channel(channel)?;
    let mut sent = false;
    while let Some(event) = conn.next_event().await {
        match event {
            MpxEvent::ChannelAdded { channel: name, .. } if name == channel && !sent => {
                conn.handle.send(channel, message.as_bytes().to_vec())?;
                sent = true;
            }
            MpxEvent::ChannelRefused { reason, .. } => {
                return Err(format!("channel refused: {}", reason).into());
            }
            MpxEvent::TransferCompleted { bytes, .. } => {
                println!("Delivered {} bytes on '{}'", bytes, channel);
            }
            MpxEvent::Received { data, .. } => {
                println!("Received: {}", String::from_utf8_lossy(&data));
                break;
            }
            MpxEvent::Closed { reason } => {
                return Err(format!("session closed: {}", reason).into());
            }
            _ => {}
        }
    }

    conn.handle.close();
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if status.is_success() {
        let body: Value = res.json().await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("Error: {} - {}", status, res.text().await?);
    }
    Ok(())
}

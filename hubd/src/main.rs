//! The hub daemon: binds the configured listeners, sniffs the wire protocol
//! of each incoming connection and hands it to the hub core.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hub_server::{Hub, HubError, MemUserDatabase};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
use config::DaemonConfig;

#[derive(Debug,Parser)]
#[command(about = "Multi-protocol Direct Connect hub")]
struct Opts
{
    /// Config file location; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// How long a client may stay silent before we give up picking a protocol.
const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>>
{
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::parse();
    let conf = match &opts.config {
        Some(path) => DaemonConfig::load_file(path)?,
        None => DaemonConfig::default(),
    };

    let hub = Hub::new(conf.hub, Some(Arc::new(MemUserDatabase::new())));

    let mut listeners = Vec::new();
    for listener in &conf.listeners {
        let addr: SocketAddr = listener.address.parse()?;
        let hub = hub.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = accept_loop(hub, addr).await {
                error!("listener {} failed: {}", addr, e);
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for listener in listeners {
        listener.abort();
    }
    Ok(())
}

async fn accept_loop(hub: Arc<Hub>, addr: SocketAddr) -> std::io::Result<()>
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            match serve_any(hub, stream, remote_addr).await {
                Ok(()) => info!("{}: connection closed", remote_addr),
                Err(e) => warn!("{}: connection failed: {}", remote_addr, e),
            }
        });
    }
}

/// Peeks at the first bytes of a fresh connection to decide which protocol
/// it speaks: ADC clients open with `HSUP`, NMDC commands start with `$`,
/// everything else is treated as IRC.
async fn serve_any(hub: Arc<Hub>, stream: TcpStream, remote_addr: SocketAddr)
    -> Result<(), HubError>
{
    let local_addr = stream.local_addr()?;
    let head = tokio::time::timeout(DETECT_TIMEOUT, peek_head(&stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no protocol greeting"))??;

    if head.starts_with(b"HSUP") {
        hub.serve_adc(stream, remote_addr, local_addr).await
    } else if head.first() == Some(&b'$') {
        hub.serve_nmdc(stream, remote_addr, local_addr).await
    } else {
        hub.serve_irc(stream, remote_addr, local_addr).await
    }
}

async fn peek_head(stream: &TcpStream) -> std::io::Result<Vec<u8>>
{
    let mut buf = [0u8; 4];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Vec::new());
        }
        // a one-byte peek is enough for NMDC; the others need the full word
        if n >= buf.len() || buf[0] == b'$' {
            return Ok(buf[..n].to_vec());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

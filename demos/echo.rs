//! Echo server.
//!
//! ```text
//! RUST_LOG=greenhub=debug cargo run --example echo -- 127.0.0.1:6000
//! ```
//!
//! Ctrl-C stops it.
use std::net::SocketAddr;

use greenhub::{DEFAULT_CONCURRENCY, TcpStream, net::DEFAULT_BACKLOG};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn echo(stream: TcpStream, peer: SocketAddr) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(%peer, %err, "read failed");
                break;
            }
        };
        if let Err(err) = stream.write_all(&buf[..n]).await {
            warn!(%peer, %err, "write failed");
            break;
        }
    }
    info!(%peer, "connection closed");
}

#[greenhub::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:6000".to_owned());
    let listener = greenhub::listen(addr.as_str(), DEFAULT_BACKLOG)?;
    info!(addr = %listener.local_addr()?, "echo server listening");

    greenhub::serve(listener, echo, DEFAULT_CONCURRENCY)
        .await
        .map_err(std::io::Error::other)
}

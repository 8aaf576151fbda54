//! Echo demo over TCP.
//!
//! Server: accepts one encrypted connection and echoes every stream back.
//! Client: opens a few streams and checks the echoes.
//!
//! ```text
//! cargo run --example echo -- server 127.0.0.1:4433
//! cargo run --example echo -- client 127.0.0.1:4433
//! ```

use mux_stream::{MuxConfig, MuxConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,mux_stream=debug")
        .init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_default();
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4433".to_string());

    match mode.as_str() {
        "server" => server(&addr).await,
        "client" => client(&addr).await,
        _ => {
            eprintln!("usage: echo <server|client> [addr]");
            std::process::exit(2);
        }
    }
}

async fn server(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("connection from {}", peer);

        tokio::spawn(async move {
            let conn = match MuxConnection::responder(socket, MuxConfig::default()).await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("handshake with {} failed: {}", peer, e);
                    return;
                }
            };

            while let Ok(stream) = conn.accept_stream().await {
                info!("accepted stream {}", stream.id());
                tokio::spawn(async move {
                    if let Err(e) = echo_stream(stream).await {
                        error!("stream error: {}", e);
                    }
                });
            }
            info!("connection from {} closed", peer);
        });
    }
}

async fn echo_stream(mut stream: mux_stream::MuxStream) -> std::io::Result<()> {
    let mut buf = vec![0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            info!("stream {} closed by peer", stream.id());
            return stream.shutdown().await;
        }
        stream.write_all(&buf[..n]).await?;
    }
}

async fn client(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let socket = TcpStream::connect(addr).await?;
    let conn = MuxConnection::initiator(socket, MuxConfig::default()).await?;
    info!("connected to {}", addr);

    for i in 0..3 {
        let mut stream = conn.open().await?;
        let message = format!("hello from stream number {}", i);
        stream.write_all(message.as_bytes()).await?;

        // Read the echo back before closing: closing a stream ends it in
        // both directions as far as the multiplexer is concerned
        let mut reply = vec![0u8; message.len()];
        stream.read_exact(&mut reply).await?;
        assert_eq!(reply, message.as_bytes());
        info!("stream {}: echoed {} bytes", stream.id(), reply.len());
        stream.shutdown().await?;
    }

    conn.close().await;
    Ok(())
}

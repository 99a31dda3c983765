use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info};

use crate::control::{ControlInterface, Dispatch};

/*
    @@@
    @run_server();
    . Serves line-oriented control sessions on the listener, one task per accepted connection.
    . Every line goes through the shared dispatch path; replies are plain text, one trailing newline, no framing beyond that.
    . A quit on any session stops everything (inside dispatch) and then wakes the shutdown notify so the daemon can exit.
*/
pub async fn run_server(listener: TcpListener, ctl: Arc<ControlInterface>, shutdown: Arc<Notify>) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "control socket listening"),
        Err(_) => info!("control socket listening"),
    }
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept error");
                continue;
            }
        };
        let ctl = ctl.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!(peer = %peer, "control session opened");
            if let Err(e) = serve_session(stream, peer, ctl, shutdown).await {
                error!(peer = %peer, error = %e, "control session error");
            }
            info!(peer = %peer, "control session closed");
        });
    }
}

async fn serve_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctl: Arc<ControlInterface>,
    shutdown: Arc<Notify>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        match ctl.handle_line(&line).await {
            Dispatch::Reply(text) => {
                if !text.is_empty() {
                    write_reply(&mut writer, &text).await?;
                }
            }
            Dispatch::Shutdown(text) => {
                write_reply(&mut writer, &text).await?;
                info!(peer = %peer, "shutdown requested over the socket");
                shutdown.notify_one();
                break;
            }
        }
    }
    Ok(())
}

async fn write_reply(writer: &mut OwnedWriteHalf, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    if !text.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}

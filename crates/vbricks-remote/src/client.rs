//! Connection to a peer engine hosting some of our bricks.
//!
//! After the handshake the peer is brought in sync: it is reset, told about
//! the disk images it holds, and every brick homed on it is re-created with
//! its configuration and links. Only then is the link handed to the factory,
//! which from that point forwards commands on its own.

use crate::error::{RemoteError, Result};
use crate::handshake;
use crate::protocol::{Incoming, Push};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use vbricks_core::{Engine, RemoteLink};

/// Timeout for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a command may wait for its `OK`/`FAIL`.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between two uploaded bricks.
const UPLOAD_PACING: Duration = Duration::from_millis(100);

/// Connect to the registered host `addr` and synchronise it.
///
/// Returns once the peer answered every setup command. The connection then
/// lives on in background tasks until either side hangs up, at which point
/// the bricks hosted there are marked stopped.
///
/// # Errors
///
/// Unknown host, connection failure, rejected password, or a peer that
/// stops answering during setup.
pub async fn connect(engine: &Engine, addr: &str) -> Result<()> {
    let host = addr.to_string();
    let (port, password) = engine
        .run(move |f| {
            f.remote_hosts
                .get(&host)
                .map(|h| (h.port, h.password.clone()))
        })
        .await?
        .ok_or_else(|| RemoteError::UnknownHost(addr.to_string()))?;

    tracing::debug!(host = %addr, port, "Connecting to remote host");
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((addr, port)))
        .await
        .map_err(|_| RemoteError::Timeout(format!("connection to {addr}:{port}")))??;
    let mut stream = BufReader::new(stream);
    handshake::login(&mut stream, &password, addr).await?;

    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let (ack_tx, mut acks) = mpsc::unbounded_channel::<bool>();

    tokio::spawn(write_loop(addr.to_string(), writer, rx));
    tokio::spawn(read_loop(engine.clone(), addr.to_string(), reader, ack_tx));

    let link = RemoteLink::new(tx);
    if let Err(e) = synchronise(engine, addr, &link, &mut acks).await {
        tracing::warn!(host = %addr, error = %e, "Remote host setup failed");
        // Dropping the link closes the writer, which hangs up.
        drop(link);
        return Err(e);
    }

    let host = addr.to_string();
    engine.run(move |f| f.set_remote_link(&host, link)).await?;
    tracing::info!(host = %addr, port, "Remote host connected");
    Ok(())
}

/// Drop the link to `addr`. Bricks hosted there are marked stopped.
pub async fn disconnect(engine: &Engine, addr: &str) -> Result<()> {
    let host = addr.to_string();
    engine.run(move |f| f.remote_disconnected(&host)).await?;
    Ok(())
}

/// Send `line` and wait for its reply.
async fn expect_ok(
    link: &RemoteLink,
    acks: &mut mpsc::UnboundedReceiver<bool>,
    line: &str,
) -> Result<bool> {
    if !link.send(line) {
        return Err(RemoteError::Protocol("connection closed".into()));
    }
    match timeout(ACK_TIMEOUT, acks.recv()).await {
        Ok(Some(ok)) => {
            if !ok {
                tracing::warn!(command = %line, "Remote host rejected command");
            }
            Ok(ok)
        }
        Ok(None) => Err(RemoteError::Protocol("connection closed".into())),
        Err(_) => Err(RemoteError::Timeout(format!("reply to {line:?}"))),
    }
}

/// Commands bringing a freshly connected peer in line with our view of it.
async fn setup_commands(engine: &Engine, addr: &str) -> Result<Vec<Vec<String>>> {
    let host = addr.to_string();
    let batches = engine
        .run(move |f| {
            let basepath = f
                .remote_hosts
                .get(&host)
                .map(|h| h.basepath.clone())
                .unwrap_or_default();

            let mut images = vec!["reset all".to_string()];
            for image in f.images.values().filter(|i| i.host.as_deref() == Some(host.as_str())) {
                images.push(format!(
                    "images add {} {}",
                    image.name,
                    remote_image_path(&basepath, &image.path).display()
                ));
            }

            // Every brick exists before any link is made to one of its socks.
            let mut batches = vec![images];
            let mut links = Vec::new();
            for name in f.hosted_bricks(&host) {
                let (create, connect): (Vec<_>, Vec<_>) = f
                    .upload_commands(&name)
                    .into_iter()
                    .partition(|line| line.split_whitespace().nth(1) != Some("connect"));
                batches.push(create);
                links.extend(connect);
            }
            batches.push(links);
            batches
        })
        .await?;
    Ok(batches)
}

/// Send the setup batches.
///
/// Each line waits for its own `OK`/`FAIL` (bounded by [`ACK_TIMEOUT`])
/// rather than relying on a fixed gap between lines and a single check at
/// the end. [`UPLOAD_PACING`] only separates batches. A `FAIL` is logged and
/// setup continues; a missing reply aborts it.
async fn synchronise(
    engine: &Engine,
    addr: &str,
    link: &RemoteLink,
    acks: &mut mpsc::UnboundedReceiver<bool>,
) -> Result<()> {
    for batch in setup_commands(engine, addr).await? {
        if batch.is_empty() {
            continue;
        }
        for line in &batch {
            expect_ok(link, acks, line).await?;
        }
        tokio::time::sleep(UPLOAD_PACING).await;
    }
    Ok(())
}

/// Image path on the peer: its file name under the host's base path.
fn remote_image_path(basepath: &str, path: &Path) -> std::path::PathBuf {
    match path.file_name() {
        Some(file) if !basepath.is_empty() => Path::new(basepath).join(file),
        _ => path.to_path_buf(),
    }
}

async fn write_loop<W>(host: String, mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        tracing::trace!(host = %host, line = %line, "Sending to remote host");
        let sent = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(e) = sent.await {
            tracing::warn!(host = %host, error = %e, "Write to remote host failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(engine: Engine, host: String, reader: R, acks: mpsc::UnboundedSender<bool>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Read from remote host failed");
                break;
            }
        };
        match Incoming::parse(&line) {
            // Replies to commands forwarded after setup have no waiter.
            Incoming::Reply(ok) => {
                if acks.send(ok).is_err() && !ok {
                    tracing::warn!(host = %host, "Remote host rejected a forwarded command");
                }
            }
            Incoming::Push(push) => {
                let addr = host.clone();
                let applied = engine
                    .run(move |f| match push {
                        Push::BrickStarted(name) => f.remote_brick_started(&name),
                        Push::BrickStopped(name) => f.remote_brick_stopped(&name),
                        Push::UdpPort { brick, port } => f.remote_udp_port(&addr, &brick, port),
                    })
                    .await;
                if let Err(e) = applied {
                    tracing::error!(host = %host, error = %e, "Failed to apply remote state");
                }
            }
            Incoming::Unknown(other) => {
                tracing::debug!(host = %host, line = %other, "Ignoring line from remote host");
            }
        }
    }

    let addr = host.clone();
    if let Err(e) = engine.run(move |f| f.remote_disconnected(&addr)).await {
        tracing::error!(host = %host, error = %e, "Failed to mark remote host offline");
    }
}

//! TCP server letting a peer engine drive this one.

use crate::error::Result;
use crate::handshake;
use crate::protocol::{Push, FAIL, OK};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use vbricks_core::{console, Engine, Outcome};

/// Remote-control server.
///
/// Serves one authenticated connection at a time; further clients wait in
/// the accept backlog until the current one hangs up.
pub struct RemoteServer {
    engine: Engine,
    password: String,
}

impl RemoteServer {
    pub fn new(engine: Engine, password: impl Into<String>) -> Self {
        Self {
            engine,
            password: password.into(),
        }
    }

    /// Bind `addr` and serve until the task is dropped.
    pub async fn listen(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`.
    ///
    /// Puts the engine in server mode: link checks are left to the
    /// controlling peer.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.engine.run(|f| f.server_mode = true).await?;
        tracing::info!(addr = ?listener.local_addr().ok(), "Remote-control server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            tracing::debug!(%peer, "Accepted connection");
            if let Err(e) = self.handle(stream, peer).await {
                tracing::warn!(%peer, error = %e, "Connection closed with error");
            } else {
                tracing::info!(%peer, "Remote client disconnected");
            }
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut stream = BufReader::new(stream);
        handshake::accept(&mut stream, &self.password, &peer.to_string()).await?;

        // Subscribe before the first command so no push is missed.
        let mut events = self.engine.subscribe();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let (outcome, output) = self.execute(line.clone()).await?;
                    if !output.is_empty() {
                        tracing::debug!(%peer, command = %line, output = %output.trim_end(), "Command output");
                    }
                    let reply = if outcome.is_ok() { OK } else { FAIL };
                    writer.write_all(format!("{reply}\n").as_bytes()).await?;
                    writer.flush().await?;
                    if outcome == Outcome::Quit {
                        return Ok(());
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(push) = Push::from_event(&event) {
                            writer.write_all(format!("{}\n", push.to_line()).as_bytes()).await?;
                            writer.flush().await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%peer, skipped, "Dropped state notifications");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Run one line through the console interpreter.
    async fn execute(&self, line: String) -> Result<(Outcome, String)> {
        let (outcome, output) = self
            .engine
            .run(move |f| {
                let mut output = Vec::new();
                let outcome = console::parse(f, &line, &mut output);
                (outcome, output)
            })
            .await?;
        Ok((outcome, String::from_utf8_lossy(&output).into_owned()))
    }
}

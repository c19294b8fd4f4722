//! Peer engines hosting bricks.
//!
//! The factory only needs to queue command lines for a peer; the TCP side
//! (handshake, reader, writer) lives in the `vbricks-remote` crate, which
//! installs a [`RemoteLink`] once a connection is authenticated.

use crate::config::{split_assignment, LineCursor};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tokio::sync::mpsc;

/// Fixed TCP port of the remote-control protocol.
pub const REMOTE_PORT: u16 = 1050;

/// Outgoing half of an authenticated connection.
#[derive(Debug, Clone)]
pub struct RemoteLink {
    tx: mpsc::UnboundedSender<String>,
    connected_at: DateTime<Utc>,
}

impl RemoteLink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx,
            connected_at: Utc::now(),
        }
    }

    /// Queue one command line. Returns `false` once the writer is gone.
    pub fn send(&self, line: &str) -> bool {
        self.tx.send(line.to_string()).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

/// A peer engine instance.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub addr: String,
    pub port: u16,
    pub password: String,
    /// Directory holding disk images on the peer.
    pub basepath: String,
    pub autoconnect: bool,
    pub link: Option<RemoteLink>,
    /// UDP ports reported by wires running on the peer.
    pub udp_ports: BTreeMap<String, u16>,
}

impl RemoteHost {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            port: REMOTE_PORT,
            password: String::new(),
            basepath: String::new(),
            autoconnect: false,
            link: None,
            udp_ports: BTreeMap::new(),
        }
    }

    pub fn connected(&self) -> bool {
        self.link.as_ref().is_some_and(RemoteLink::is_open)
    }

    /// Queue a command for the peer. Dropped with a warning when offline.
    pub fn send(&self, line: &str) -> bool {
        match &self.link {
            Some(link) if link.send(line) => {
                tracing::debug!(host = %self.addr, line, "Forwarded to remote host");
                true
            }
            _ => {
                tracing::warn!(host = %self.addr, line, "Remote host not connected, command dropped");
                false
            }
        }
    }

    /// Append a `[RemoteHost:<addr>]` section.
    pub fn save_to(&self, out: &mut String) {
        let _ = writeln!(out, "[RemoteHost:{}]", self.addr);
        let _ = writeln!(out, "port={}", self.port);
        let _ = writeln!(out, "password={}", self.password);
        let _ = writeln!(out, "basepath={}", self.basepath);
        let _ = writeln!(
            out,
            "autoconnect={}",
            if self.autoconnect { "True" } else { "False" }
        );
        out.push('\n');
    }

    /// Read the body of a `[RemoteHost:<addr>]` section.
    pub fn load_from(addr: &str, cursor: &mut LineCursor) -> Result<Self> {
        let mut host = RemoteHost::new(addr);
        while let Some(line) = cursor.peek() {
            if line.trim().is_empty() {
                cursor.next_line();
                break;
            }
            let Some((key, value)) = split_assignment(line) else {
                break;
            };
            match key {
                "port" => host.port = value.trim().parse().unwrap_or(REMOTE_PORT),
                "password" => host.password = value.to_string(),
                "basepath" => host.basepath = value.trim().to_string(),
                "autoconnect" => host.autoconnect = value.trim().eq_ignore_ascii_case("true"),
                other => tracing::warn!(host = %addr, key = other, "Ignoring unknown remote host key"),
            }
            cursor.next_line();
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_round_trip() {
        let mut host = RemoteHost::new("10.0.0.2");
        host.password = "s3cret".into();
        host.basepath = "/srv/images".into();
        host.autoconnect = true;
        let mut out = String::new();
        host.save_to(&mut out);

        let mut cursor = LineCursor::new(&out);
        cursor.next_line();
        let loaded = RemoteHost::load_from("10.0.0.2", &mut cursor).unwrap();
        assert_eq!(loaded.port, REMOTE_PORT);
        assert_eq!(loaded.password, "s3cret");
        assert_eq!(loaded.basepath, "/srv/images");
        assert!(loaded.autoconnect);
    }

    #[tokio::test]
    async fn test_send_through_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = RemoteHost::new("10.0.0.2");
        assert!(!host.send("sw1 on"));

        host.link = Some(RemoteLink::new(tx));
        assert!(host.connected());
        assert!(host.send("sw1 on"));
        assert_eq!(rx.recv().await.as_deref(), Some("sw1 on"));

        drop(rx);
        assert!(!host.connected());
    }
}

//! Line protocol spoken after the handshake.
//!
//! Commands use the console grammar and are answered with `OK` or `FAIL`.
//! The server interleaves unsolicited push lines whenever one of its bricks
//! changes state, so a reader must accept them between any two replies.

use vbricks_core::FactoryEvent;

/// Reply to a command.
pub const OK: &str = "OK";
/// Reply to a command that failed to parse or run.
pub const FAIL: &str = "FAIL";

/// Unsolicited state change sent by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    BrickStarted(String),
    BrickStopped(String),
    /// A wire listens for UDP on `port`.
    UdpPort { brick: String, port: u16 },
}

impl Push {
    /// Push line mirroring a local notification, if it has one.
    pub fn from_event(event: &FactoryEvent) -> Option<Self> {
        match event {
            FactoryEvent::BrickStarted(name) => Some(Push::BrickStarted(name.clone())),
            FactoryEvent::BrickStopped(name) => Some(Push::BrickStopped(name.clone())),
            FactoryEvent::UdpPort { brick, port } => Some(Push::UdpPort {
                brick: brick.clone(),
                port: *port,
            }),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Push::BrickStarted(name) => format!("brick-started {name}"),
            Push::BrickStopped(name) => format!("brick-stopped {name}"),
            Push::UdpPort { brick, port } => format!("udp {brick} remoteport {port}"),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["brick-started", name] => Some(Push::BrickStarted(name.to_string())),
            ["brick-stopped", name] => Some(Push::BrickStopped(name.to_string())),
            ["udp", brick, "remoteport", port] => port.parse().ok().map(|port| Push::UdpPort {
                brick: brick.to_string(),
                port,
            }),
            _ => None,
        }
    }
}

/// A line received by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// `OK` (true) or `FAIL` (false).
    Reply(bool),
    Push(Push),
    Unknown(String),
}

impl Incoming {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            OK => Incoming::Reply(true),
            FAIL => Incoming::Reply(false),
            other => match Push::parse(other) {
                Some(push) => Incoming::Push(push),
                None => Incoming::Unknown(other.to_string()),
            },
        }
    }
}

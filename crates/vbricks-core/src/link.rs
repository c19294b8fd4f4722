//! Sock/plug link model.
//!
//! Socks and plugs live in an arena owned by the factory and refer to each
//! other by id. A plug names at most one sock; a sock keeps the ids of the
//! plugs attached to it. Both sides are updated together.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        /// Opaque arena key. Ids grow monotonically, so ordering follows
        /// creation order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(BrickId, "brick#");
arena_id!(SockId, "sock#");
arena_id!(PlugId, "plug#");

/// Per-interface settings of a VM NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nic {
    pub model: String,
    pub mac: String,
    pub vlan: u32,
}

impl Nic {
    pub fn new(model: impl Into<String>, mac: impl Into<String>, vlan: u32) -> Self {
        Self {
            model: model.into(),
            mac: mac.into(),
            vlan,
        }
    }
}

/// How a plug reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugMode {
    /// Attached to a VDE sock.
    Vde,
    /// QEMU user-mode networking, no sock.
    User,
    /// QEMU user-mode networking with `restrict=on`, no sock.
    HostOnly,
}

/// Named attachment point owned by a brick.
#[derive(Debug, Clone)]
pub struct Sock {
    pub brick: BrickId,
    pub nickname: String,
    /// VDE control socket path.
    pub path: PathBuf,
    pub plugs: Vec<PlugId>,
    /// Set for VM-owned socks.
    pub nic: Option<Nic>,
}

/// Brick-owned reference to at most one sock.
#[derive(Debug, Clone)]
pub struct Plug {
    pub brick: BrickId,
    pub sock: Option<SockId>,
    pub mode: PlugMode,
    /// Set for VM-owned plugs.
    pub nic: Option<Nic>,
    /// Re-entrancy flag for the recursive connectivity check.
    pub antiloop: bool,
}

impl Plug {
    /// A plug is configured once it has a sock, or needs none.
    pub fn configured(&self) -> bool {
        self.sock.is_some() || self.mode != PlugMode::Vde
    }
}

/// Arena of socks and plugs.
#[derive(Debug, Default)]
pub struct LinkGraph {
    socks: BTreeMap<SockId, Sock>,
    plugs: BTreeMap<PlugId, Plug>,
    next: u64,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    /// Register a sock in the factory-wide registry.
    pub fn add_sock(&mut self, brick: BrickId, nickname: &str, path: PathBuf) -> SockId {
        let id = SockId(self.next_id());
        self.socks.insert(
            id,
            Sock {
                brick,
                nickname: nickname.to_string(),
                path,
                plugs: Vec::new(),
                nic: None,
            },
        );
        id
    }

    /// Create a VDE plug with no sock.
    pub fn add_plug(&mut self, brick: BrickId) -> PlugId {
        let id = PlugId(self.next_id());
        self.plugs.insert(
            id,
            Plug {
                brick,
                sock: None,
                mode: PlugMode::Vde,
                nic: None,
                antiloop: false,
            },
        );
        id
    }

    pub fn sock(&self, id: SockId) -> Option<&Sock> {
        self.socks.get(&id)
    }

    pub fn sock_mut(&mut self, id: SockId) -> Option<&mut Sock> {
        self.socks.get_mut(&id)
    }

    pub fn plug(&self, id: PlugId) -> Option<&Plug> {
        self.plugs.get(&id)
    }

    pub fn plug_mut(&mut self, id: PlugId) -> Option<&mut Plug> {
        self.plugs.get_mut(&id)
    }

    /// All socks in creation order.
    pub fn socks(&self) -> impl Iterator<Item = (SockId, &Sock)> {
        self.socks.iter().map(|(id, s)| (*id, s))
    }

    /// All plugs in creation order.
    pub fn plugs(&self) -> impl Iterator<Item = (PlugId, &Plug)> {
        self.plugs.iter().map(|(id, p)| (*id, p))
    }

    pub fn find_sock(&self, nickname: &str) -> Option<SockId> {
        self.socks
            .iter()
            .find(|(_, s)| s.nickname == nickname)
            .map(|(id, _)| *id)
    }

    /// Attach `plug` to `sock`, detaching it from any previous sock first.
    ///
    /// Returns `false` when `sock` is `None` or either id is unknown.
    pub fn connect(&mut self, plug: PlugId, sock: Option<SockId>) -> bool {
        let Some(sock) = sock else {
            return false;
        };
        if !self.socks.contains_key(&sock) || !self.plugs.contains_key(&plug) {
            return false;
        }
        self.disconnect(plug);
        if let Some(s) = self.socks.get_mut(&sock) {
            s.plugs.push(plug);
        }
        if let Some(p) = self.plugs.get_mut(&plug) {
            p.sock = Some(sock);
            p.mode = PlugMode::Vde;
        }
        true
    }

    /// Detach `plug` from its sock, clearing both sides.
    pub fn disconnect(&mut self, plug: PlugId) -> Option<SockId> {
        let sock = self.plugs.get_mut(&plug)?.sock.take()?;
        if let Some(s) = self.socks.get_mut(&sock) {
            s.plugs.retain(|p| *p != plug);
        }
        Some(sock)
    }

    /// Remove a plug, detaching it first.
    pub fn remove_plug(&mut self, plug: PlugId) -> Option<Plug> {
        self.disconnect(plug);
        self.plugs.remove(&plug)
    }

    /// Remove a sock and disconnect every plug attached to it.
    ///
    /// Returns the ids of the plugs that were detached.
    pub fn remove_sock(&mut self, sock: SockId) -> Vec<PlugId> {
        let Some(removed) = self.socks.remove(&sock) else {
            return Vec::new();
        };
        for plug in &removed.plugs {
            if let Some(p) = self.plugs.get_mut(plug) {
                if p.sock == Some(sock) {
                    p.sock = None;
                }
            }
        }
        removed.plugs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_updates_both_sides() {
        let mut graph = LinkGraph::new();
        let sw = BrickId(100);
        let wire = BrickId(101);
        let sock = graph.add_sock(sw, "sw1_port", PathBuf::from("/tmp/sw1.ctl"));
        let plug = graph.add_plug(wire);

        assert!(!graph.connect(plug, None));
        assert!(graph.connect(plug, Some(sock)));
        assert_eq!(graph.plug(plug).unwrap().sock, Some(sock));
        assert_eq!(graph.sock(sock).unwrap().plugs, vec![plug]);

        assert_eq!(graph.disconnect(plug), Some(sock));
        assert!(graph.sock(sock).unwrap().plugs.is_empty());
        assert!(graph.plug(plug).unwrap().sock.is_none());
    }

    #[test]
    fn test_reconnect_moves_plug() {
        let mut graph = LinkGraph::new();
        let a = graph.add_sock(BrickId(1), "a_port", PathBuf::from("/tmp/a.ctl"));
        let b = graph.add_sock(BrickId(2), "b_port", PathBuf::from("/tmp/b.ctl"));
        let plug = graph.add_plug(BrickId(3));

        graph.connect(plug, Some(a));
        graph.connect(plug, Some(b));
        assert!(graph.sock(a).unwrap().plugs.is_empty());
        assert_eq!(graph.sock(b).unwrap().plugs, vec![plug]);
    }

    #[test]
    fn test_remove_sock_detaches_plugs() {
        let mut graph = LinkGraph::new();
        let sock = graph.add_sock(BrickId(1), "sw1_port", PathBuf::from("/tmp/sw1.ctl"));
        let p1 = graph.add_plug(BrickId(2));
        let p2 = graph.add_plug(BrickId(3));
        graph.connect(p1, Some(sock));
        graph.connect(p2, Some(sock));

        let detached = graph.remove_sock(sock);
        assert_eq!(detached, vec![p1, p2]);
        assert!(graph.plug(p1).unwrap().sock.is_none());
        assert!(graph.find_sock("sw1_port").is_none());
    }

    #[test]
    fn test_user_plug_is_configured_without_sock() {
        let mut graph = LinkGraph::new();
        let plug = graph.add_plug(BrickId(1));
        assert!(!graph.plug(plug).unwrap().configured());
        graph.plug_mut(plug).unwrap().mode = PlugMode::User;
        assert!(graph.plug(plug).unwrap().configured());
    }
}

//! In-process VDE wire.
//!
//! Opens a data port on a switch through its control socket (VDE v3
//! request) and forwards datagrams between two endpoints.
//!
//! ```text
//!   switch A ctl ──REQ_NEW_CONTROL──▶ data sock A ◀─┐
//!                                                   ├─ bridge task
//!   switch B ctl ──REQ_NEW_CONTROL──▶ data sock B ◀─┘   (or UDP peer)
//! ```

use std::io;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UdpSocket, UnixDatagram, UnixStream};

const REQ_MAGIC: u32 = 0xfeed_face;
const REQ_VERSION: u32 = 3;
const REQ_NEW_CONTROL: i32 = 0;
const AF_UNIX: u16 = 1;
const SUN_PATH_LEN: usize = 108;
const SOCKADDR_UN_LEN: usize = 2 + SUN_PATH_LEN;
const DESCR_LEN: usize = 128;
/// Size of the v3 connection request.
pub const REQUEST_LEN: usize = 4 + 4 + 4 + SOCKADDR_UN_LEN + DESCR_LEN;
/// Largest Ethernet frame forwarded.
const MAX_FRAME: usize = 9216;

static PORT_SEQ: AtomicU32 = AtomicU32::new(0);

fn encode_sockaddr(buf: &mut Vec<u8>, path: &Path) -> io::Result<()> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= SUN_PATH_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ));
    }
    buf.extend_from_slice(&AF_UNIX.to_ne_bytes());
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + SUN_PATH_LEN - bytes.len(), 0);
    Ok(())
}

/// Build a `REQ_NEW_CONTROL` request announcing `local` as our data socket.
pub fn encode_request(local: &Path, description: &str) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(REQUEST_LEN);
    buf.extend_from_slice(&REQ_MAGIC.to_ne_bytes());
    buf.extend_from_slice(&REQ_VERSION.to_ne_bytes());
    buf.extend_from_slice(&REQ_NEW_CONTROL.to_ne_bytes());
    encode_sockaddr(&mut buf, local)?;
    let descr = description.as_bytes();
    let n = descr.len().min(DESCR_LEN - 1);
    buf.extend_from_slice(&descr[..n]);
    buf.resize(REQUEST_LEN, 0);
    Ok(buf)
}

/// Extract the path of a `sockaddr_un` reply.
pub fn decode_sockaddr(reply: &[u8]) -> io::Result<PathBuf> {
    if reply.len() < SOCKADDR_UN_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short sockaddr reply",
        ));
    }
    let path = &reply[2..SOCKADDR_UN_LEN];
    let end = path.iter().position(|b| *b == 0).unwrap_or(path.len());
    let text = std::str::from_utf8(&path[..end])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(PathBuf::from(text))
}

/// A data port opened on a VDE switch.
#[derive(Debug)]
pub struct VdePort {
    data: UnixDatagram,
    local: PathBuf,
    /// Kept open for the lifetime of the port; the switch frees the port
    /// when it closes.
    _ctl: UnixStream,
}

impl VdePort {
    /// Open a port on the switch whose control directory is `switch`.
    pub async fn open(switch: &Path, local_dir: &Path, description: &str) -> io::Result<Self> {
        let local = local_dir.join(format!(
            "vde.{}-{}",
            std::process::id(),
            PORT_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&local);
        let data = UnixDatagram::bind(&local)?;

        let mut ctl = UnixStream::connect(switch.join("ctl")).await?;
        ctl.write_all(&encode_request(&local, description)?).await?;
        let mut reply = [0u8; SOCKADDR_UN_LEN];
        ctl.read_exact(&mut reply).await?;
        let remote = decode_sockaddr(&reply)?;
        data.connect(&remote)?;

        tracing::debug!(switch = %switch.display(), data = %remote.display(), "VDE port opened");
        Ok(Self {
            data,
            local,
            _ctl: ctl,
        })
    }
}

impl Drop for VdePort {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

/// One side of a bridged wire.
#[derive(Debug)]
pub enum Endpoint {
    Vde(VdePort),
    /// UDP socket; the peer is learned from the first datagram when unknown.
    Udp {
        socket: UdpSocket,
        peer: Option<SocketAddr>,
    },
}

impl Endpoint {
    /// Bind a UDP endpoint on an ephemeral port.
    pub async fn udp(peer: Option<SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Endpoint::Udp { socket, peer })
    }

    /// Local UDP port, for UDP endpoints.
    pub fn udp_port(&self) -> Option<u16> {
        match self {
            Endpoint::Udp { socket, .. } => socket.local_addr().ok().map(|a| a.port()),
            Endpoint::Vde(_) => None,
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Endpoint::Vde(port) => port.data.recv(buf).await,
            Endpoint::Udp { socket, peer } => {
                let (n, from) = socket.recv_from(buf).await?;
                if peer.is_none() {
                    tracing::debug!(%from, "UDP wire peer learned");
                    *peer = Some(from);
                }
                Ok(n)
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        match self {
            Endpoint::Vde(port) => port.data.send(frame).await.map(|_| ()),
            Endpoint::Udp {
                socket,
                peer: Some(peer),
            } => socket.send_to(frame, peer).await.map(|_| ()),
            Endpoint::Udp { peer: None, .. } => Ok(()),
        }
    }
}

/// Forward frames between `a` and `b` until either side fails.
pub async fn bridge(name: String, mut a: Endpoint, mut b: Endpoint) {
    let mut buf_a = vec![0u8; MAX_FRAME];
    let mut buf_b = vec![0u8; MAX_FRAME];
    tracing::info!(wire = %name, "Wire bridge running");
    loop {
        let result = tokio::select! {
            r = a.recv(&mut buf_a) => match r {
                Ok(n) => b.send(&buf_a[..n]).await,
                Err(e) => Err(e),
            },
            r = b.recv(&mut buf_b) => match r {
                Ok(n) => a.send(&buf_b[..n]).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            tracing::warn!(wire = %name, error = %e, "Wire bridge stopped");
            break;
        }
    }
}

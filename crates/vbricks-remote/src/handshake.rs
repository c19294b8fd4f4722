//! Challenge/response authentication.
//!
//! ```text
//! server                               client
//!   │── "HELO" + 256 random bytes ──────▶│
//!   │◀───── SHA-256(password‖challenge) ─│  (32 raw bytes)
//!   │── "OK\n" | "FAIL\n" ──────────────▶│
//! ```
//!
//! Both sides take a buffered stream so bytes read past the handshake stay
//! available to the command loop.

use crate::error::{RemoteError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Greeting sent by the server before the challenge.
pub const HELO: &[u8; 4] = b"HELO";

/// Size of the server nonce.
pub const CHALLENGE_LEN: usize = 256;

/// Size of the client answer.
pub const DIGEST_LEN: usize = 32;

/// Draw a fresh nonce from the OS random source.
pub fn challenge() -> [u8; CHALLENGE_LEN] {
    let mut nonce = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// SHA-256 over the password followed by the challenge.
pub fn digest(password: &str, challenge: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().into()
}

/// Server side: challenge the peer and check its answer.
///
/// On mismatch `FAIL` is sent and [`RemoteError::AuthFailed`] returned; the
/// caller must drop the stream without reading commands.
pub async fn accept<S>(stream: &mut S, password: &str, peer: &str) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let nonce = challenge();
    stream.write_all(HELO).await?;
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let mut answer = [0u8; DIGEST_LEN];
    stream.read_exact(&mut answer).await?;

    if answer == digest(password, &nonce) {
        stream.write_all(b"OK\n").await?;
        stream.flush().await?;
        tracing::info!(peer, "Remote client authenticated");
        Ok(())
    } else {
        stream.write_all(b"FAIL\n").await?;
        stream.flush().await?;
        tracing::warn!(peer, "Remote client failed authentication");
        Err(RemoteError::AuthFailed(peer.to_string()))
    }
}

/// Client side: answer the server's challenge.
pub async fn login<S>(stream: &mut S, password: &str, host: &str) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 4];
    stream.read_exact(&mut greeting).await?;
    if &greeting != HELO {
        return Err(RemoteError::Protocol(format!(
            "expected HELO, got {:?}",
            String::from_utf8_lossy(&greeting)
        )));
    }

    let mut nonce = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut nonce).await?;
    stream.write_all(&digest(password, &nonce)).await?;
    stream.flush().await?;

    let mut reply = String::new();
    stream.read_line(&mut reply).await?;
    match reply.trim_end() {
        "OK" => {
            tracing::debug!(host, "Handshake accepted");
            Ok(())
        }
        "FAIL" | "" => Err(RemoteError::AuthFailed(host.to_string())),
        other => Err(RemoteError::Protocol(format!("unexpected handshake reply {other:?}"))),
    }
}

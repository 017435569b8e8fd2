//! Bidirectional relay
//!
//! Pumps bytes between two live connections until either side closes. Each
//! cycle waits for read-readiness on one of the two sockets, drains it in
//! fixed-size reads until a short read, then forwards the accumulated buffer
//! verbatim to the peer. Nothing is buffered across cycles and there is no
//! idle timeout: during data transfer the proxy is a passive pipe.

use bytes::BytesMut;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::core::hooks::HookRegistry;
use crate::logger::log;

/// Bytes requested per read call while draining a ready socket
pub const READ_CHUNK: usize = 1024;

/// Which socket became readable in a cycle
enum Ready {
    Client,
    Remote,
}

/// Direction of a drained buffer, used for hook dispatch and logging
#[derive(Clone, Copy)]
enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

enum DrainStatus {
    Open,
    Closed,
}

/// Relay bytes between the client connection and the remote connection
/// until either side closes.
///
/// A zero-length read signals peer closure and unwinds the loop; read and
/// write failures are treated the same way. Both streams are owned by the
/// caller, so closing exactly once is guaranteed by drop.
pub async fn relay(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    peer: SocketAddr,
    hooks: &HookRegistry,
) -> std::io::Result<()> {
    loop {
        let ready = tokio::select! {
            ready = client.readable() => {
                ready?;
                Ready::Client
            }
            ready = remote.readable() => {
                ready?;
                Ready::Remote
            }
        };

        let open = match ready {
            Ready::Client => pump(client, remote, peer, hooks, Direction::Outbound).await,
            Ready::Remote => pump(remote, client, peer, hooks, Direction::Inbound).await,
        };
        if !open {
            break;
        }
    }

    log::session(&peer.to_string(), "relay finished");
    Ok(())
}

/// Drain one ready socket and forward what it produced; returns whether the
/// relay should keep going.
async fn pump(
    src: &TcpStream,
    dst: &mut TcpStream,
    peer: SocketAddr,
    hooks: &HookRegistry,
    direction: Direction,
) -> bool {
    let (status, buff) = drain(src);

    if !buff.is_empty() {
        match direction {
            Direction::Outbound => hooks.observe_outbound(peer, &buff),
            Direction::Inbound => hooks.observe_inbound(peer, &buff),
        }
        log::trace!(
            peer = %peer,
            direction = direction.as_str(),
            bytes = buff.len(),
            "Forwarding"
        );
        // All-or-nothing write; a failed peer looks the same as a closed one.
        if dst.write_all(&buff).await.is_err() {
            return false;
        }
    }

    matches!(status, DrainStatus::Open)
}

/// Read whatever the socket has ready, in READ_CHUNK-sized calls, stopping
/// at a short read.
///
/// A zero-length read reports closure and discards anything accumulated in
/// this cycle; the peer never sees bytes that arrived after its
/// counterpart hung up.
fn drain(src: &TcpStream) -> (DrainStatus, BytesMut) {
    let mut buff = BytesMut::with_capacity(READ_CHUNK);
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        match src.try_read(&mut chunk) {
            Ok(0) => return (DrainStatus::Closed, BytesMut::new()),
            Ok(n) => {
                buff.extend_from_slice(&chunk[..n]);
                if n < READ_CHUNK {
                    return (DrainStatus::Open, buff);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return (DrainStatus::Open, buff);
            }
            // Abrupt disconnects are not distinguished from graceful ones.
            Err(_) => return (DrainStatus::Closed, BytesMut::new()),
        }
    }
}

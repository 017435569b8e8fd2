//! Per-connection session lifecycle
//!
//! A session exclusively owns its client connection from accept to close.
//! Socks5 sessions walk Connecting → Negotiated → Relaying → Closed; raw
//! sessions skip straight to Relaying because the destination is
//! preconfigured. Failures are returned to the worker pool, which records
//! them as task traces; they never reach the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{ForwardMode, Options};
use crate::core::relay::relay;
use crate::core::socks5::{self, DestAddr, Socks5Cmd, Socks5Request};
use crate::error::{ForwardError, Result};
use crate::logger::log;

/// Protocol progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Negotiated,
    Relaying,
    Closed,
}

/// One accepted connection and everything needed to serve it
pub struct Session {
    conn: TcpStream,
    peer: SocketAddr,
    mode: ForwardMode,
    options: Arc<Options>,
    state: SessionState,
}

impl Session {
    pub fn new(conn: TcpStream, peer: SocketAddr, mode: ForwardMode, options: Arc<Options>) -> Self {
        Self {
            conn,
            peer,
            mode,
            options,
            state: SessionState::Connecting,
        }
    }

    /// Run the full lifecycle
    ///
    /// Consumes the session; the client connection is closed on every exit
    /// path, success or failure, exactly once.
    pub async fn handle(mut self) -> Result<()> {
        let peer = self.peer;
        let _closed = scopeguard::guard((), move |_| {
            log::connection(&peer.to_string(), "closed");
        });

        match self.mode {
            ForwardMode::Raw => self.handle_raw().await,
            ForwardMode::Socks5 => self.handle_socks5().await,
        }
    }

    fn advance(&mut self, next: SessionState) {
        log::trace!(peer = %self.peer, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    /// Raw passthrough: dial the preconfigured remote and relay
    async fn handle_raw(&mut self) -> Result<()> {
        let (host, port) = self
            .options
            .remote_addr
            .clone()
            .ok_or_else(|| {
                ForwardError::Config("raw forwarding requires a remote address".to_string())
            })?;

        let mut remote = self.dial(&DestAddr::Domain(host), port).await?;
        self.advance(SessionState::Relaying);
        relay(&mut self.conn, &mut remote, self.peer, &self.options.hooks).await?;
        self.advance(SessionState::Closed);
        Ok(())
    }

    /// SOCKS5: negotiate, parse the request, dispatch CONNECT
    async fn handle_socks5(&mut self) -> Result<()> {
        let handshake_timeout = self.options.timeout;

        timeout(handshake_timeout, socks5::negotiate(&mut self.conn))
            .await
            .map_err(|_| ForwardError::Protocol("negotiation timed out".to_string()))??;
        self.advance(SessionState::Negotiated);

        let request = timeout(handshake_timeout, Socks5Request::read_from(&mut self.conn))
            .await
            .map_err(|_| ForwardError::Protocol("request read timed out".to_string()))??;
        log::info!(peer = %self.peer, request = %request, "Accepted socks5 request");

        match request.cmd {
            Socks5Cmd::Connect => self.connect_and_relay(&request).await,
            // No reply bytes for rejected commands; the close is the answer.
            cmd => {
                log::warn!(
                    peer = %self.peer,
                    cmd = %cmd,
                    "Cannot handle request with unsupported command"
                );
                self.advance(SessionState::Closed);
                Ok(())
            }
        }
    }

    /// Dial the requested destination, send the success reply, relay
    async fn connect_and_relay(&mut self, request: &Socks5Request) -> Result<()> {
        let mut remote = self.dial(&request.dest, request.port).await?;

        // The reply carries the outbound socket's locally bound address,
        // not the destination.
        let bound = remote.local_addr()?;
        self.conn
            .write_all(&socks5::success_reply(bound))
            .await?;
        self.advance(SessionState::Relaying);

        relay(&mut self.conn, &mut remote, self.peer, &self.options.hooks).await?;
        self.advance(SessionState::Closed);
        Ok(())
    }

    /// Connect to the destination under the configured timeout
    ///
    /// Domain names are passed through to the connect call unresolved;
    /// failures surface as errors, never as SOCKS error-reply bytes.
    async fn dial(&self, dest: &DestAddr, port: u16) -> Result<TcpStream> {
        let connect = async {
            match dest {
                DestAddr::IPv4(ip) => TcpStream::connect((*ip, port)).await,
                DestAddr::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
            }
        };

        match timeout(self.options.timeout, connect).await {
            Ok(Ok(stream)) => {
                log::debug!(peer = %self.peer, remote = %format!("{}:{}", dest, port), "Connected to remote");
                Ok(stream)
            }
            Ok(Err(e)) => Err(ForwardError::Connection(format!(
                "connect to {}:{} failed: {}",
                dest, port, e
            ))),
            Err(_) => Err(ForwardError::Connection(format!(
                "connect to {}:{} timed out",
                dest, port
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connecting = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (connecting.await.unwrap(), accepted)
    }

    fn options(timeout: Duration, remote_addr: Option<(String, u16)>) -> Arc<Options> {
        Arc::new(Options::new(timeout, remote_addr))
    }

    #[tokio::test]
    async fn test_raw_session_without_remote_is_a_config_error() {
        let (_client, accepted) = tcp_pair().await;
        let peer = accepted.peer_addr().unwrap();
        let session = Session::new(
            accepted,
            peer,
            ForwardMode::Raw,
            options(Duration::from_secs(1), None),
        );
        let err = session.handle().await.unwrap_err();
        assert!(matches!(err, ForwardError::Config(_)));
    }

    #[tokio::test]
    async fn test_socks5_rejects_client_without_no_auth() {
        let (mut client, accepted) = tcp_pair().await;
        let peer = accepted.peer_addr().unwrap();
        let session = Session::new(
            accepted,
            peer,
            ForwardMode::Socks5,
            options(Duration::from_secs(1), None),
        );
        let handle = tokio::spawn(session.handle());

        // Offer GSSAPI and username/password only.
        tokio::io::AsyncWriteExt::write_all(&mut client, &[5, 2, 1, 2])
            .await
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::Protocol(_)));

        // No reply was sent; the connection just closes.
        let mut buf = [0u8; 2];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_socks5_negotiation_timeout() {
        let (_client, accepted) = tcp_pair().await;
        let peer = accepted.peer_addr().unwrap();
        let session = Session::new(
            accepted,
            peer,
            ForwardMode::Socks5,
            options(Duration::from_millis(50), None),
        );

        // The client never sends a byte.
        let err = session.handle().await.unwrap_err();
        assert!(matches!(err, ForwardError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_dial_failure_is_a_connection_error() {
        let (mut client, accepted) = tcp_pair().await;
        let peer = accepted.peer_addr().unwrap();
        let session = Session::new(
            accepted,
            peer,
            ForwardMode::Socks5,
            options(Duration::from_secs(1), None),
        );
        let handle = tokio::spawn(session.handle());

        // Reserve a port with no listener behind it.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = unused.local_addr().unwrap();
        drop(unused);

        tokio::io::AsyncWriteExt::write_all(&mut client, &[5, 1, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let mut req = vec![5, 1, 0, 1, 127, 0, 0, 1];
        req.extend_from_slice(&dead.port().to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &req)
            .await
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::Connection(_)));
    }
}

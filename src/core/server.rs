//! Forwarding server
//!
//! Owns the listening socket and the worker pool. The accept loop converts
//! inbound connections into pool submissions and never runs session logic
//! itself; a failure on one session never reaches the listener.

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{Options, ServerConfig};
use crate::core::session::Session;
use crate::logger::log;
use crate::pool::Pool;

/// The forwarding proxy server
pub struct ForwardServer {
    config: ServerConfig,
    options: Arc<Options>,
    pool: Pool<()>,
    cancel: CancellationToken,
    bound: OnceLock<SocketAddr>,
}

impl ForwardServer {
    pub fn new(config: ServerConfig, options: Options) -> Self {
        let pool = Pool::new(config.size);
        Self {
            config,
            options: Arc::new(options),
            pool,
            cancel: CancellationToken::new(),
            bound: OnceLock::new(),
        }
    }

    /// The listener address once `serve` has bound it
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    /// Ask the accept loop to exit; in-flight sessions finish first
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Scheme → proxy URL map for client configuration
    ///
    /// Both http and https map to the same socks5 endpoint.
    pub fn proxy_urls(&self) -> HashMap<String, String> {
        let url = format!("socks5://{}:{}", self.config.host, self.config.port);
        HashMap::from([
            ("http".to_string(), url.clone()),
            ("https".to_string(), url),
        ])
    }

    /// Non-blocking variant of `serve`: spawns the accept loop and returns
    /// the proxy URL map
    pub fn start(self: &Arc<Self>) -> HashMap<String, String> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                log::error!(error = %e, "Server exited with error");
            }
        });
        self.proxy_urls()
    }

    /// Bind the listening socket with SO_REUSEADDR for fast restarts
    fn bind_listener(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        // Allow immediate rebind after restart (skip TIME_WAIT)
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.size as i32)?;
        Ok(TcpListener::from_std(socket.into())?)
    }

    /// Run the accept loop until `shutdown` is called
    ///
    /// A bind failure is fatal and propagates; accept errors are logged and
    /// the loop continues.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.bind_listener()?;
        let local = listener.local_addr()?;
        let _ = self.bound.set(local);

        self.pool.start()?;
        self.spawn_result_recorder();

        log::info!(
            address = %local,
            mode = %self.config.mode,
            size = self.config.size,
            "Server started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, addr)) => {
                        log::connection(&addr.to_string(), "new");
                        let session =
                            Session::new(conn, addr, self.config.mode, Arc::clone(&self.options));
                        match self.pool.execute(async move {
                            session.handle().await.map_err(anyhow::Error::from)
                        }) {
                            Ok(task_id) => {
                                log::debug!(peer = %addr, task = %task_id, "Session submitted");
                            }
                            Err(e) => {
                                log::error!(peer = %addr, error = %e, "Failed to submit session");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        self.pool.stop().await;
        log::info!(address = %local, "Server stopped");
        Ok(())
    }

    /// Record session task completions as they arrive
    fn spawn_result_recorder(&self) {
        if let Some(mut results) = self.pool.take_results() {
            tokio::spawn(async move {
                while let Some(result) = results.recv().await {
                    match result.trace {
                        Some(trace) => {
                            log::debug!(task = %result.task_id, trace = %trace, "Session task failed")
                        }
                        None => log::debug!(task = %result.task_id, "Session task finished"),
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardMode;

    fn test_config(host: &str, port: u16) -> ServerConfig {
        ServerConfig {
            host: host.to_string(),
            port,
            mode: ForwardMode::Socks5,
            size: 4,
        }
    }

    #[test]
    fn test_proxy_urls_map_both_schemes_to_socks5() {
        let server = ForwardServer::new(test_config("127.0.0.1", 8010), Options::default());
        let urls = server.proxy_urls();
        assert_eq!(urls["http"], "socks5://127.0.0.1:8010");
        assert_eq!(urls["https"], "socks5://127.0.0.1:8010");
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = ForwardServer::new(test_config("127.0.0.1", port), Options::default());
        assert!(server.serve().await.is_err());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_unparseable_host_is_fatal() {
        let server = ForwardServer::new(test_config("not-an-ip", 0), Options::default());
        assert!(server.serve().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = Arc::new(ForwardServer::new(
            test_config("127.0.0.1", 0),
            Options::default(),
        ));
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve().await });

        while server.local_addr().is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        server.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("serve did not observe shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}

//! Proxy server implementation using hyper
//!
//! Accepts client connections and hands each one to the request handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::limiter::Limiter;
use crate::proxy::handler::{extract_client_ip, RequestHandler};

/// Proxy server
pub struct ProxyServer {
    addr: String,
    handler: Arc<RequestHandler>,
}

impl ProxyServer {
    pub fn new(addr: String, handler: Arc<RequestHandler>) -> Self {
        Self { addr, handler }
    }

    /// Accept loop. Stops accepting when the shutdown channel fires;
    /// in-flight connections keep running on their own tasks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "proxy server listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, client_addr, handler).await
                                {
                                    debug!(error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("proxy server stopped accepting");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        handler: Arc<RequestHandler>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let remote = client_addr.to_string();
        let client_ip = extract_client_ip(&remote).to_string();

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let client_ip = client_ip.clone();
            async move { Ok::<_, Infallible>(handler.handle(req, client_ip).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| crate::error::EgretError::Http(e.to_string()))?;

        Ok(())
    }
}

/// Wait for active connections to drain, polling the limiter until the total
/// reaches zero or the timeout expires.
pub async fn wait_for_drain(limiter: &Limiter, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = interval(Duration::from_millis(100));

    loop {
        ticker.tick().await;

        if limiter.total_count() == 0 {
            info!("all connections closed");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(active = limiter.total_count(), "timeout waiting for connections");
            return;
        }
    }
}

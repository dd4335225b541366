//! Outbound transports bound to specific source IPs.
//!
//! The forward path uses pooled HTTP clients (one per outbound IP, keep-alive
//! reuse); CONNECT uses a plain dialer with no pooling.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{EgretError, Result};

/// Pooled HTTP client whose dials bind a fixed local address.
pub type PooledClient = Client<HttpConnector, Incoming>;

const MAX_IDLE_PER_HOST: usize = 10;

/// Per-IP cache of pooled HTTP clients for the forward path.
pub struct TransportPool {
    clients: RwLock<HashMap<String, PooledClient>>,
    connect_timeout: Duration,
    tcp_keepalive: Duration,
    idle_conn_timeout: Duration,
}

impl TransportPool {
    /// Create the pool with clients for every configured IP, so the hot path
    /// only ever takes the read lock.
    pub fn new(
        ips: &[String],
        connect_timeout: Duration,
        tcp_keepalive: Duration,
        idle_conn_timeout: Duration,
    ) -> Self {
        let pool = Self {
            clients: RwLock::new(HashMap::new()),
            connect_timeout,
            tcp_keepalive,
            idle_conn_timeout,
        };

        {
            let mut clients = pool.clients.write();
            for ip in ips {
                if let Ok(addr) = ip.parse::<IpAddr>() {
                    clients.insert(ip.clone(), pool.create_client(addr));
                }
            }
        }

        pool
    }

    /// Client for the given IP. Unknown IPs get a client created on demand
    /// with double-checked locking.
    pub fn get(&self, ip: &str) -> Result<PooledClient> {
        if let Some(client) = self.clients.read().get(ip) {
            return Ok(client.clone());
        }

        let addr: IpAddr = ip
            .parse()
            .map_err(|_| EgretError::InvalidRequest(format!("invalid outbound IP: {}", ip)))?;

        let mut clients = self.clients.write();
        if let Some(client) = clients.get(ip) {
            return Ok(client.clone());
        }

        let client = self.create_client(addr);
        clients.insert(ip.to_string(), client.clone());
        Ok(client)
    }

    /// Drop every pooled client so their idle connections close. Called
    /// during graceful shutdown; clients are recreated on demand if a
    /// straggling request still needs one.
    pub fn close_idle(&self) {
        self.clients.write().clear();
    }

    fn create_client(&self, local_addr: IpAddr) -> PooledClient {
        let mut connector = HttpConnector::new();
        connector.set_local_address(Some(local_addr));
        connector.set_connect_timeout(Some(self.connect_timeout));
        connector.set_keepalive(Some(self.tcp_keepalive));

        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.idle_conn_timeout)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(connector)
    }
}

/// Dials TCP connections bound to a specific source IP. Used for CONNECT
/// tunnels, where pooled transports make no sense.
pub struct Dialer {
    local_ip: IpAddr,
    timeout: Duration,
    keepalive: Duration,
}

impl Dialer {
    pub fn new(local_ip: IpAddr, timeout: Duration, keepalive: Duration) -> Self {
        Self {
            local_ip,
            timeout,
            keepalive,
        }
    }

    /// Dial `host:port` from the bound source IP.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| EgretError::UpstreamConnectFailed(format!("resolve failed: {}", e)))?
            .filter(|addr| addr.is_ipv4() == self.local_ip.is_ipv4())
            .collect();

        let mut last_err = EgretError::UpstreamConnectFailed(format!(
            "no address of matching family for {}:{}",
            host, port
        ));

        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(self.local_ip, 0))?;

            match timeout(self.timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    let keepalive = TcpKeepalive::new().with_time(self.keepalive);
                    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);
                    debug!(local = %self.local_ip, remote = %addr, "dialed upstream");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    last_err = EgretError::UpstreamConnectFailed(format!(
                        "connect to {} failed: {}",
                        addr, e
                    ));
                }
                Err(_) => last_err = EgretError::Timeout,
            }
        }

        Err(last_err)
    }
}

/// Parse host and port from a CONNECT authority. The port defaults to 443.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    // IPv6 literals arrive bracketed: [::1]:443
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, port_str)) = rest.split_once("]:") {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| EgretError::InvalidRequest("invalid port".to_string()))?;
            return Ok((host.to_string(), port));
        }
        let host = rest.strip_suffix(']').unwrap_or(rest);
        return Ok((host.to_string(), 443));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| EgretError::InvalidRequest("invalid port".to_string()))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

/// Parse host and port from a request URI, defaulting the port by scheme.
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| EgretError::InvalidRequest("missing host in URI".to_string()))?
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

//! Health probes bound to a source IP.
//!
//! Each probe binds the local address to the IP under test, so it exercises
//! that IP's actual outbound path rather than the default route.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::{lookup_host, TcpSocket};
use tokio::time::timeout;

use crate::error::{EgretError, Result};

/// A health check executed from a specific source IP.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, source_ip: IpAddr) -> Result<()>;
}

/// Probe that opens a TCP connection to `host:port`.
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: &str, timeout: Duration) -> Self {
        Self {
            target: target.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, source_ip: IpAddr) -> Result<()> {
        let addrs: Vec<SocketAddr> = lookup_host(self.target.as_str())
            .await
            .map_err(|e| EgretError::UpstreamConnectFailed(format!("resolve failed: {}", e)))?
            .filter(|addr| addr.is_ipv4() == source_ip.is_ipv4())
            .collect();

        let mut last_err = EgretError::UpstreamConnectFailed(format!(
            "no address of matching family for {}",
            self.target
        ));

        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(source_ip, 0))?;

            match timeout(self.timeout, socket.connect(addr)).await {
                Ok(Ok(_conn)) => return Ok(()),
                Ok(Err(e)) => {
                    last_err =
                        EgretError::UpstreamConnectFailed(format!("tcp connect failed: {}", e));
                }
                Err(_) => last_err = EgretError::Timeout,
            }
        }

        Err(last_err)
    }
}

/// Probe that performs an HTTP GET; 2xx and 3xx count as success.
pub struct HttpProbe {
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, source_ip: IpAddr) -> Result<()> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| EgretError::InvalidRequest(format!("invalid probe url: {}", e)))?;

        let mut connector = HttpConnector::new();
        connector.set_local_address(Some(source_ip));
        connector.set_connect_timeout(Some(self.timeout));

        // One-off client: probe connections are never kept alive
        let client: Client<HttpConnector, Empty<Bytes>> = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::new())
            .map_err(|e| EgretError::InvalidRequest(format!("invalid probe request: {}", e)))?;

        let response = timeout(self.timeout, client.request(request))
            .await
            .map_err(|_| EgretError::Timeout)?
            .map_err(|e| EgretError::UpstreamConnectFailed(format!("http request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(EgretError::Http(format!(
                "unexpected status code: {}",
                status.as_u16()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_success_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(&addr.to_string(), Duration::from_secs(1));
        let result = probe.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_failure_when_nothing_listens() {
        // Bind then drop to get a port that is very likely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = TcpProbe::new(&addr.to_string(), Duration::from_millis(500));
        let result = probe.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_family_mismatch() {
        let probe = TcpProbe::new("127.0.0.1:80", Duration::from_millis(500));
        let result = probe.check("::1".parse().unwrap()).await;
        assert!(matches!(result, Err(EgretError::UpstreamConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_http_probe_accepts_2xx_and_rejects_5xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            for response in [
                "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n",
                "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n",
            ] {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let probe = HttpProbe::new(&format!("http://{}/health", addr), Duration::from_secs(1));
        assert!(probe.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.is_ok());
        assert!(probe.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.is_err());
    }
}

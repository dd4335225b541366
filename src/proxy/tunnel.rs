//! CONNECT tunnel: full-duplex copy with idle deadlines.
//!
//! Two halves run in parallel. Each half re-arms its deadline after every
//! successful transfer, so the timeout measures idle time rather than total
//! tunnel lifetime. When a half ends it half-closes its output so the peer
//! observes EOF and the other half can drain and exit.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{error, trace};

/// Copy buffer size per direction.
const TUNNEL_BUF_SIZE: usize = 32 * 1024;

/// Run the bidirectional copy between the client stream and the upstream
/// stream. Returns `(bytes_client_to_upstream, bytes_upstream_to_client)`
/// after both halves complete.
pub async fn run<C, U>(client: C, upstream: U, idle_timeout: Duration) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    // The totals are published to metrics from another task, so they must be
    // shared atomics rather than plain locals.
    let bytes_in = Arc::new(AtomicU64::new(0));
    let bytes_out = Arc::new(AtomicU64::new(0));

    tokio::join!(
        copy_half(
            client_read,
            upstream_write,
            idle_timeout,
            bytes_in.clone(),
            "client_to_upstream",
        ),
        copy_half(
            upstream_read,
            client_write,
            idle_timeout,
            bytes_out.clone(),
            "upstream_to_client",
        ),
    );

    let totals = (
        bytes_in.load(Ordering::Relaxed),
        bytes_out.load(Ordering::Relaxed),
    );
    trace!(
        bytes_in = totals.0,
        bytes_out = totals.1,
        "tunnel closed"
    );
    totals
}

/// Copy one direction until EOF, write error, or idle timeout, then signal
/// EOF downstream via write shutdown.
async fn copy_half<R, W>(
    mut src: R,
    mut dst: W,
    idle_timeout: Duration,
    counter: Arc<AtomicU64>,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF_SIZE];

    loop {
        let n = match timeout(idle_timeout, src.read(&mut buf)).await {
            Err(_) => {
                trace!(direction, "tunnel idle timeout");
                break;
            }
            Ok(Err(e)) => {
                if !is_expected_error(&e) {
                    error!(direction, error = %e, "tunnel read error");
                }
                break;
            }
            Ok(Ok(0)) => break, // clean close
            Ok(Ok(n)) => n,
        };

        match timeout(idle_timeout, dst.write_all(&buf[..n])).await {
            Err(_) => {
                trace!(direction, "tunnel write idle timeout");
                break;
            }
            Ok(Err(e)) => {
                if !is_expected_error(&e) {
                    error!(direction, error = %e, "tunnel write error");
                }
                break;
            }
            Ok(Ok(())) => {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
    }

    let _ = dst.shutdown().await;
    trace!(
        direction,
        bytes = counter.load(Ordering::Relaxed),
        "tunnel half complete"
    );
}

/// Closed-connection errors are expected terminations, not failures.
fn is_expected_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

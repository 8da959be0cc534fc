//! Relay Engine

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::session::{ConnectionStats, RelaySession};
use crate::config::{BackendAddr, Config};
use crate::Result;

/// Which way bytes flow through a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend
    Upstream,
    /// Backend to client
    Downstream,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Upstream => "client->backend",
            Direction::Downstream => "backend->client",
        }
    }
}

/// Dials the backend and moves bytes between client and backend
#[derive(Debug, Clone)]
pub struct RelayEngine {
    connect_timeout: Duration,
    idle_timeout: Duration,
    half_close_timeout: Duration,
    buffer_size: usize,
}

impl RelayEngine {
    /// Create a new relay engine
    pub fn new(
        connect_timeout: Duration,
        idle_timeout: Duration,
        half_close_timeout: Duration,
        buffer_size: usize,
    ) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
            half_close_timeout,
            buffer_size,
        }
    }

    /// Create a new relay engine from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.backend.connect_timeout,
            config.server.idle_timeout,
            config.server.half_close_timeout,
            config.server.buffer_size,
        )
    }

    /// Establish connection to the backend, trying each resolved address in turn
    pub async fn connect_to_backend(&self, backend: &BackendAddr) -> Result<(TcpStream, SocketAddr)> {
        debug!("Attempting to connect to backend: {}", backend);

        let socket_addrs = self
            .resolve_backend(backend)
            .await
            .context("Failed to resolve backend address")?;

        let mut last_error = None;
        for addr in socket_addrs {
            match self.try_connect_to_address(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY on backend connection {}: {}", addr, e);
                    }
                    debug!("Connected to backend address: {}", addr);
                    return Ok((stream, addr));
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let error_msg = format!("Failed to connect to backend {}", backend);
        match last_error {
            Some(e) => Err(anyhow!("{}: {}", error_msg, e)),
            None => Err(anyhow!("{}: No addresses resolved", error_msg)),
        }
    }

    /// Resolve the backend host; done on every dial so DNS changes are picked up
    async fn resolve_backend(&self, backend: &BackendAddr) -> Result<Vec<SocketAddr>> {
        debug!("Resolving backend: {}", backend);

        match timeout(
            self.connect_timeout,
            lookup_host((backend.host.as_str(), backend.port)),
        )
        .await
        {
            Ok(Ok(addrs)) => {
                let resolved: Vec<SocketAddr> = addrs.collect();
                if resolved.is_empty() {
                    return Err(anyhow!(
                        "DNS resolution returned no addresses for {}",
                        backend.host
                    ));
                }
                debug!("Resolved {} to {} addresses", backend.host, resolved.len());
                Ok(resolved)
            }
            Ok(Err(e)) => Err(anyhow!("DNS resolution failed for {}: {}", backend.host, e)),
            Err(_) => Err(anyhow!("DNS resolution timed out for {}", backend.host)),
        }
    }

    /// Try to connect to a specific socket address
    async fn try_connect_to_address(&self, addr: SocketAddr) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(anyhow!("Connection failed: {}", e)),
            Err(_) => Err(anyhow!("Connection timed out after {:?}", self.connect_timeout)),
        }
    }

    /// Relay data bidirectionally between client and backend.
    ///
    /// Each direction half-closes its destination when its source reaches
    /// end-of-stream. The opposite direction then gets `half_close_timeout`
    /// to finish before the relay ends regardless, so a peer that never
    /// closes its side cannot hold the relay open. An I/O error or idle
    /// timeout in either direction ends the relay at once. Both sockets are
    /// closed when this returns.
    pub async fn relay_data(
        &self,
        session: &Arc<RelaySession>,
        client: TcpStream,
        backend: TcpStream,
    ) -> Result<ConnectionStats> {
        debug!(
            "Starting bidirectional data relay for session {}",
            session.session_id
        );

        let (mut client_read, mut client_write) = client.into_split();
        let (mut backend_read, mut backend_write) = backend.into_split();
        session.touch();

        let upstream = copy_half(
            &mut client_read,
            &mut backend_write,
            session,
            Direction::Upstream,
            self.buffer_size,
            self.idle_timeout,
        );
        let downstream = copy_half(
            &mut backend_read,
            &mut client_write,
            session,
            Direction::Downstream,
            self.buffer_size,
            self.idle_timeout,
        );
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        let (finished, first) = tokio::select! {
            res = &mut upstream => (Direction::Upstream, res),
            res = &mut downstream => (Direction::Downstream, res),
        };

        let result = match first {
            Ok(_) => match finished {
                Direction::Upstream => {
                    self.linger(downstream, Direction::Downstream, session).await
                }
                Direction::Downstream => self.linger(upstream, Direction::Upstream, session).await,
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                session.log_stats();
                Ok(session.to_stats())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(
                    "Relay session {} idle for {:?}, closing after {} bytes up, {} bytes down",
                    session.session_id,
                    self.idle_timeout,
                    session.bytes_up(),
                    session.bytes_down()
                );
                Err(anyhow!("Relay idle timeout after {:?}", self.idle_timeout))
            }
            Err(e) => {
                error!(
                    "Relay session {} failed after {:?} ({} bytes up, {} bytes down): {}",
                    session.session_id,
                    session.duration(),
                    session.bytes_up(),
                    session.bytes_down(),
                    e
                );
                Err(anyhow!("Data relay failed: {}", e))
            }
        }
    }

    /// Give the still-open direction a bounded time to reach its own end-of-stream
    async fn linger<F>(
        &self,
        remaining: F,
        direction: Direction,
        session: &RelaySession,
    ) -> io::Result<()>
    where
        F: Future<Output = io::Result<u64>>,
    {
        match timeout(self.half_close_timeout, remaining).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                debug!(
                    "Session {}: {} still open {:?} after the other side closed, ending relay",
                    session.session_id,
                    direction.label(),
                    self.half_close_timeout
                );
                Ok(())
            }
        }
    }
}

/// Copy one direction until end-of-stream, then half-close the destination.
///
/// Idleness is judged on the session as a whole, so a quiet direction stays
/// open while the other one is still moving bytes.
pub async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    session: &RelaySession,
    direction: Direction,
    buffer_size: usize,
    idle_timeout: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    let mut total = 0u64;

    loop {
        let remaining = idle_timeout.saturating_sub(session.idle_for());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} idle", direction.label()),
            ));
        }

        buf.clear();
        let n = match timeout(remaining, reader.read_buf(&mut buf)).await {
            Ok(result) => result?,
            // the other direction may have been active meanwhile
            Err(_) => continue,
        };

        if n == 0 {
            debug!("{} reached end of stream after {} bytes", direction.label(), total);
            if let Err(e) = writer.shutdown().await {
                debug!("{} half-close failed: {}", direction.label(), e);
            }
            return Ok(total);
        }

        match timeout(idle_timeout, writer.write_all(&buf[..n])).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} write stalled", direction.label()),
                ))
            }
        }

        total += n as u64;
        match direction {
            Direction::Upstream => session.add_bytes_up(n as u64),
            Direction::Downstream => session.add_bytes_down(n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn session() -> RelaySession {
        RelaySession::new(
            "engine_test".to_string(),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_copy_half_preserves_order_and_counts() {
        let session = session();
        let mut reader = Builder::new().read(b"PING").read(b" again").build();
        let mut writer = Builder::new().write(b"PING").write(b" again").build();

        let copied = copy_half(
            &mut reader,
            &mut writer,
            &session,
            Direction::Upstream,
            1024,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(copied, 10);
        assert_eq!(session.bytes_up(), 10);
        assert_eq!(session.bytes_down(), 0);
    }

    #[tokio::test]
    async fn test_copy_half_propagates_read_error() {
        let session = session();
        let mut reader = Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut writer = Builder::new().write(b"abc").build();

        let err = copy_half(
            &mut reader,
            &mut writer,
            &session,
            Direction::Downstream,
            1024,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(session.bytes_down(), 3);
    }

    #[tokio::test]
    async fn test_copy_half_half_closes_destination_on_eof() {
        let session = session();
        let (mut src_peer, mut src) = duplex(64);
        let (mut dst, mut dst_peer) = duplex(64);

        src_peer.write_all(b"bye").await.unwrap();
        drop(src_peer);

        copy_half(
            &mut src,
            &mut dst,
            &session,
            Direction::Upstream,
            64,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let mut received = Vec::new();
        dst_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn test_copy_half_times_out_when_idle() {
        let session = session();
        let (_src_peer, mut src) = duplex(64);
        let (mut dst, _dst_peer) = duplex(64);

        let err = copy_half(
            &mut src,
            &mut dst,
            &session,
            Direction::Upstream,
            64,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_ends_when_backend_lingers_after_client_eof() {
        // client peer -> relay client side, relay backend side -> backend peer
        let (client_peer, client) = tcp_pair().await;
        let (backend, mut backend_peer) = tcp_pair().await;
        drop(client_peer);

        let engine = RelayEngine::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
            Duration::from_millis(100),
            1024,
        );
        let session = Arc::new(session());

        let stats = timeout(
            Duration::from_secs(5),
            engine.relay_data(&session, client, backend),
        )
        .await
        .expect("relay should end once the linger elapses")
        .unwrap();
        assert_eq!(stats.total_bytes, 0);

        // backend saw the half-close and then the full close, without ever closing itself
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(1), backend_peer.read_to_end(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_relay_waits_for_backend_reply_after_client_eof() {
        let (mut client_peer, client) = tcp_pair().await;
        let (backend, mut backend_peer) = tcp_pair().await;

        let engine = RelayEngine::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
            Duration::from_secs(5),
            1024,
        );
        let session = Arc::new(session());
        let relay = tokio::spawn(async move { engine.relay_data(&session, client, backend).await });

        client_peer.write_all(b"PING").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut request = Vec::new();
        backend_peer.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"PING");
        backend_peer.write_all(b"PONG").await.unwrap();
        drop(backend_peer);

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"PONG");

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.bytes_up, 4);
        assert_eq!(stats.bytes_down, 4);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_backend_fails() {
        // bind then drop to get a port with no listener
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = RelayEngine::new(
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_secs(1),
            1024,
        );
        let result = engine
            .connect_to_backend(&BackendAddr::new("127.0.0.1", port))
            .await;
        assert!(result.is_err());
    }
}

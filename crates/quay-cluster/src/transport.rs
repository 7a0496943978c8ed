//! TCP transport for config propagation
//!
//! Carries the two-phase apply and catch-up requests between controllers.
//! Each request opens or reuses a pooled connection to the peer's
//! advertised uri, writes one frame and reads one frame back.

use crate::applier::ConfigPeer;
use crate::config::TransportConfig;
use crate::error::{ClusterError, Result};
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, frame_length, frame_message,
    ClusterRequest, ClusterResponse, RequestHeader, MAX_MESSAGE_SIZE,
};
use crate::topology::ClusterConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

/// Request handler callback type
pub type RequestHandler = Arc<dyn Fn(ClusterRequest) -> ClusterResponse + Send + Sync>;

/// Network transport manager
pub struct Transport {
    /// Our advertised uri, stamped into request headers
    local_uri: String,

    /// Configuration
    config: TransportConfig,

    /// Connection pool per peer uri
    connections: DashMap<String, Arc<ConnectionPool>>,

    /// Correlation ID generator
    correlation_id: AtomicU64,
}

impl Transport {
    /// Create new transport
    pub fn new(local_uri: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            local_uri: local_uri.into(),
            config,
            connections: DashMap::new(),
            correlation_id: AtomicU64::new(1),
        }
    }

    /// Accept connections on `listener` until `shutdown` fires
    pub fn serve(
        &self,
        listener: TcpListener,
        handler: RequestHandler,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let config = self.config.clone();
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Transport listening");
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!(peer = %addr, "Accepted connection");

                                let handler = handler.clone();
                                let config = config.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, handler, config).await {
                                        debug!(peer = %addr, error = %e, "Connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Accept error");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Transport shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Handle an incoming connection
    async fn handle_connection(
        mut stream: TcpStream,
        handler: RequestHandler,
        config: TransportConfig,
    ) -> Result<()> {
        if config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        let mut length_buf = [0u8; 4];

        loop {
            // Idle pooled connections are closed by the peer eventually
            match timeout(config.read_timeout, stream.read_exact(&mut length_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Ok(Err(e)) => return Err(ClusterError::Io(e)),
                Err(_) => return Err(ClusterError::Timeout),
            }

            let length = frame_length(&length_buf);
            if length > MAX_MESSAGE_SIZE {
                return Err(ClusterError::MessageTooLarge {
                    size: length,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            let mut body = vec![0u8; length];
            timeout(config.read_timeout, stream.read_exact(&mut body))
                .await
                .map_err(|_| ClusterError::Timeout)?
                .map_err(ClusterError::Io)?;

            let request = decode_request(&body)?;
            trace!(
                request = request.name(),
                source = %request.header().source,
                "Handling cluster request"
            );
            let response = match request.header().validate_version() {
                Ok(()) => handler(request),
                Err(header) => ClusterResponse::Error { header },
            };

            let framed = frame_message(&encode_response(&response)?);
            timeout(config.write_timeout, stream.write_all(&framed))
                .await
                .map_err(|_| ClusterError::Timeout)?
                .map_err(ClusterError::Io)?;
        }
    }

    /// Build a request header for the next request
    pub fn header(&self) -> RequestHeader {
        RequestHeader::new(self.next_correlation_id(), self.local_uri.clone())
    }

    /// Send a request to `uri` and wait for its response.
    ///
    /// A pooled connection the peer already closed is replaced by a fresh one
    /// once; the request is only resent if no part of a response arrived.
    pub async fn send(&self, uri: &str, request: ClusterRequest) -> Result<ClusterResponse> {
        let framed = frame_message(&encode_request(&request)?);

        let body = match self.pooled_connection(uri).await {
            Some(stream) => match self.exchange(stream, &framed).await {
                Ok((stream, body)) => {
                    self.return_connection(uri, stream).await;
                    body
                }
                Err(Exchange::Stale(e)) => {
                    debug!(uri = %uri, error = %e, "Pooled connection closed by peer, reconnecting");
                    self.exchange_fresh(uri, &framed).await?
                }
                Err(Exchange::Failed(e)) => return Err(e),
            },
            None => self.exchange_fresh(uri, &framed).await?,
        };

        decode_response(&body)?.into_result()
    }

    async fn exchange_fresh(&self, uri: &str, framed: &[u8]) -> Result<Vec<u8>> {
        let stream = self.connect(uri).await?;
        let (stream, body) = self.exchange(stream, framed).await.map_err(Exchange::into_error)?;
        self.return_connection(uri, stream).await;
        Ok(body)
    }

    /// Write one frame and read one frame back
    async fn exchange(
        &self,
        mut stream: TcpStream,
        framed: &[u8],
    ) -> std::result::Result<(TcpStream, Vec<u8>), Exchange> {
        timeout(self.config.write_timeout, stream.write_all(framed))
            .await
            .map_err(|_| Exchange::Failed(ClusterError::Timeout))?
            .map_err(Exchange::Stale)?;

        let mut length_buf = [0u8; 4];
        timeout(self.config.read_timeout, stream.read_exact(&mut length_buf))
            .await
            .map_err(|_| Exchange::Failed(ClusterError::Timeout))?
            .map_err(Exchange::Stale)?;

        let length = frame_length(&length_buf);
        if length > MAX_MESSAGE_SIZE {
            return Err(Exchange::Failed(ClusterError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            }));
        }
        let mut body = vec![0u8; length];
        timeout(self.config.read_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| Exchange::Failed(ClusterError::Timeout))?
            .map_err(|e| Exchange::Failed(ClusterError::Io(e)))?;

        // Only a fully read connection goes back to the pool
        Ok((stream, body))
    }

    async fn pooled_connection(&self, uri: &str) -> Option<TcpStream> {
        let pool = self.connections.get(uri).map(|p| p.value().clone())?;
        pool.get().await
    }

    /// Open a new connection to `uri`
    async fn connect(&self, uri: &str) -> Result<TcpStream> {
        // `localhost` may resolve to both ::1 and 127.0.0.1
        let mut last_err = ClusterError::ConnectionFailed(format!("{}: no address", uri));
        for addr in resolve(uri).await? {
            match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if self.config.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = ClusterError::ConnectionFailed(format!("{}: {}", uri, e)),
                Err(_) => last_err = ClusterError::Timeout,
            }
        }
        Err(last_err)
    }

    /// Return connection to pool
    async fn return_connection(&self, uri: &str, stream: TcpStream) {
        let pool = self
            .connections
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(self.config.max_connections_per_peer)))
            .value()
            .clone();
        pool.put(stream).await;
    }

    /// Get next correlation ID
    fn next_correlation_id(&self) -> u64 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Drop pooled connections
    pub fn shutdown(&self) {
        self.connections.clear();
    }
}

#[async_trait]
impl ConfigPeer for Transport {
    async fn prepare(&self, uri: &str, config: &ClusterConfig, limit: Duration) -> Result<()> {
        let request = ClusterRequest::Prepare {
            header: self.header(),
            config: config.clone(),
        };
        match timeout(limit, self.send(uri, request)).await?? {
            ClusterResponse::Prepared { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn commit(&self, uri: &str, version: u64, limit: Duration) -> Result<()> {
        let request = ClusterRequest::Commit {
            header: self.header(),
            version,
        };
        match timeout(limit, self.send(uri, request)).await?? {
            ClusterResponse::Committed { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn abort(&self, uri: &str, version: u64, limit: Duration) -> Result<()> {
        let request = ClusterRequest::Abort {
            header: self.header(),
            version,
        };
        match timeout(limit, self.send(uri, request)).await?? {
            ClusterResponse::Aborted { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_config(&self, uri: &str, limit: Duration) -> Result<ClusterConfig> {
        let request = ClusterRequest::FetchConfig {
            header: self.header(),
        };
        match timeout(limit, self.send(uri, request)).await?? {
            ClusterResponse::Config { config, .. } => Ok(config),
            other => Err(unexpected(&other)),
        }
    }
}

/// How a request/response exchange on one connection went wrong
enum Exchange {
    /// Nothing of a response arrived; the connection was already dead
    Stale(std::io::Error),
    Failed(ClusterError),
}

impl Exchange {
    fn into_error(self) -> ClusterError {
        match self {
            Exchange::Stale(e) => ClusterError::Io(e),
            Exchange::Failed(e) => e,
        }
    }
}

fn unexpected(response: &ClusterResponse) -> ClusterError {
    ClusterError::Protocol(format!("unexpected response {:?}", response))
}

/// Resolve an advertised `host:port` to its socket addresses
pub async fn resolve(uri: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(uri)
        .await
        .map_err(|e| ClusterError::ConnectionFailed(format!("{}: {}", uri, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(ClusterError::ConnectionFailed(format!("{}: no address", uri)));
    }
    Ok(addrs)
}

/// Simple connection pool
struct ConnectionPool {
    connections: Mutex<Vec<TcpStream>>,
    max_size: usize,
}

impl ConnectionPool {
    fn new(max_size: usize) -> Self {
        Self {
            connections: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
        }
    }

    async fn get(&self) -> Option<TcpStream> {
        self.connections.lock().await.pop()
    }

    async fn put(&self, stream: TcpStream) {
        let mut conns = self.connections.lock().await;
        if conns.len() < self.max_size {
            conns.push(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseHeader;

    fn echo_handler() -> RequestHandler {
        Arc::new(|request: ClusterRequest| {
            let correlation_id = request.header().correlation_id;
            match request {
                ClusterRequest::Prepare { config, .. } => ClusterResponse::Prepared {
                    header: ResponseHeader::success(correlation_id),
                    version: config.version,
                },
                ClusterRequest::Commit { version, .. } => ClusterResponse::rejected(
                    correlation_id,
                    &ClusterError::NothingPrepared(version),
                ),
                ClusterRequest::Abort { version, .. } => ClusterResponse::Aborted {
                    header: ResponseHeader::success(correlation_id),
                    version,
                },
                ClusterRequest::FetchConfig { .. } => ClusterResponse::Config {
                    header: ResponseHeader::success(correlation_id),
                    config: ClusterConfig::new(),
                },
            }
        })
    }

    async fn start_server() -> (Transport, String, broadcast::Sender<()>) {
        start_server_with(TransportConfig::default()).await
    }

    async fn start_server_with(config: TransportConfig) -> (Transport, String, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = listener.local_addr().unwrap().to_string();
        let server = Transport::new(uri.clone(), config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        server.serve(listener, echo_handler(), shutdown_rx);
        (server, uri, shutdown_tx)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (_server, uri, _shutdown) = start_server().await;
        let client = Transport::new("127.0.0.1:1", TransportConfig::default());
        let limit = Duration::from_secs(1);

        client.prepare(&uri, &ClusterConfig::new(), limit).await.unwrap();
        client.abort(&uri, 3, limit).await.unwrap();
        let config = client.fetch_config(&uri, limit).await.unwrap();
        assert_eq!(config.version, 0);
    }

    #[tokio::test]
    async fn test_rejection_carries_peer_message() {
        let (_server, uri, _shutdown) = start_server().await;
        let client = Transport::new("127.0.0.1:1", TransportConfig::default());

        let err = client
            .commit(&uri, 9, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No prepared config with version 9");
    }

    #[tokio::test]
    async fn test_reconnects_after_idle_close() {
        let (_server, uri, _shutdown) = start_server_with(TransportConfig {
            read_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .await;
        let client = Transport::new("127.0.0.1:1", TransportConfig::default());
        let limit = Duration::from_secs(1);

        client.prepare(&uri, &ClusterConfig::new(), limit).await.unwrap();
        // The server drops the pooled connection while it sits idle
        tokio::time::sleep(Duration::from_millis(400)).await;
        client.prepare(&uri, &ClusterConfig::new(), limit).await.unwrap();
        client.abort(&uri, 1, limit).await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = Transport::new("127.0.0.1:1", TransportConfig::default());
        let err = client
            .fetch_config(&uri, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ConnectionFailed(_)));
    }
}

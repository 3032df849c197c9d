//! Tunnel Builder seam
//!
//! The orchestrator hands a [`TunnelRequest`] to a [`TunnelBuilder`] and
//! gets back a [`Session`]. Packet forwarding and the local proxy front end
//! live behind this trait.
//!
//! [`HandshakeTunnelBuilder`] is the bundled builder: it completes the
//! WireGuard handshake with the chosen endpoint and hands over the
//! connected socket together with the session indices. It has no data
//! plane, so wrapped modes (psiphon, warp-in-warp) are refused up front.

use crate::context::RunContext;
use crate::endpoint::Endpoint;
use crate::identity::Identity;
use crate::noise;
use crate::options::CountryCode;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Default bound on a single handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the WireGuard session is carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapParams {
    /// Plain WireGuard to the endpoint
    None,
    /// A second WireGuard session to `exit`, carried inside the first
    DoubleHop { exit: Endpoint },
    /// WireGuard over the Psiphon transport
    Circumvention { country: CountryCode },
}

/// Everything a builder needs to bring a tunnel up
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub endpoint: Endpoint,
    pub identity: Arc<Identity>,
    pub wrap: WrapParams,
    /// Resolver the tunnel should hand to its clients
    pub dns: IpAddr,
    /// Local proxy address
    pub bind: SocketAddr,
}

/// An established tunnel session
#[derive(Debug, Clone)]
pub struct Session {
    pub endpoint: Endpoint,
    pub exit: Option<Endpoint>,
    pub bind: SocketAddr,
    /// Connected UDP socket, when the builder owns one
    pub socket: Option<Arc<UdpSocket>>,
    /// Our index for this session
    pub sender_index: u32,
    /// The peer's index for this session
    pub receiver_index: u32,
    pub handshake_rtt: Duration,
    pub established_at: Instant,
}

impl Session {
    /// Session with no socket attached
    pub fn new(endpoint: Endpoint, bind: SocketAddr) -> Self {
        Self {
            endpoint,
            exit: None,
            bind,
            socket: None,
            sender_index: 0,
            receiver_index: 0,
            handshake_rtt: Duration::ZERO,
            established_at: Instant::now(),
        }
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Time since the handshake completed
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Socket error: {0}")]
    SocketError(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("{0} transport is not available in this build")]
    TransportUnavailable(&'static str),

    #[error("Tunnel setup failed: {0}")]
    Setup(String),
}

/// Brings up a tunnel for a request
#[async_trait]
pub trait TunnelBuilder: Send + Sync {
    async fn build(&self, request: TunnelRequest, ctx: &RunContext)
        -> Result<Session, TunnelError>;
}

/// Builder that performs the WireGuard handshake itself
#[derive(Debug, Clone)]
pub struct HandshakeTunnelBuilder {
    handshake_timeout: Duration,
}

impl Default for HandshakeTunnelBuilder {
    fn default() -> Self {
        Self::new(HANDSHAKE_TIMEOUT)
    }
}

impl HandshakeTunnelBuilder {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    async fn handshake(
        &self,
        endpoint: Endpoint,
        identity: &Identity,
        ctx: &RunContext,
    ) -> Result<(UdpSocket, noise::HandshakeResponse, Duration), TunnelError> {
        let socket = noise::connect_udp(endpoint.to_socket_addr())
            .await
            .map_err(|e| TunnelError::SocketError(e.to_string()))?;

        if let Ok(local) = socket.local_addr() {
            debug!("Bound to local port {}", local.port());
        }

        let limit = ctx
            .remaining()
            .map_or(self.handshake_timeout, |left| left.min(self.handshake_timeout));

        let exchange = noise::exchange(
            &socket,
            &identity.keys,
            &identity.account.peer_public_key,
            identity.account.reserved,
        );

        let (response, rtt) = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)?
            .map_err(|e| TunnelError::HandshakeFailed(e.to_string()))?;

        Ok((socket, response, rtt))
    }
}

#[async_trait]
impl TunnelBuilder for HandshakeTunnelBuilder {
    async fn build(
        &self,
        request: TunnelRequest,
        ctx: &RunContext,
    ) -> Result<Session, TunnelError> {
        match &request.wrap {
            WrapParams::Circumvention { country } => {
                warn!("Psiphon transport requested (country {})", country);
                return Err(TunnelError::TransportUnavailable("psiphon"));
            }
            WrapParams::DoubleHop { exit } => {
                // the inner handshake needs the outer session's data plane
                warn!("Warp-in-warp requested (exit {})", exit);
                return Err(TunnelError::TransportUnavailable("warp-in-warp"));
            }
            WrapParams::None => {}
        }

        info!("Starting WireGuard tunnel to {}", request.endpoint);

        let (socket, response, rtt) = self
            .handshake(request.endpoint, &request.identity, ctx)
            .await?;

        info!("WireGuard handshake with {} completed ({:?})", request.endpoint, rtt);

        Ok(Session {
            endpoint: request.endpoint,
            exit: None,
            bind: request.bind,
            socket: Some(Arc::new(socket)),
            sender_index: response.receiver_index,
            receiver_index: response.sender_index,
            handshake_rtt: rtt,
            established_at: Instant::now(),
        })
    }
}

//! warp-plus Network Layer
//!
//! The two pieces of network plumbing the orchestrator needs before a
//! tunnel exists:
//! 1. Device registration against the WARP API (HTTPS, rustls)
//! 2. Name resolution for `host:port` endpoints through a chosen resolver

mod api;
mod dns;

pub use api::{
    Account, Addresses, ApiClient, ApiClientConfig, ApiError, Device, DeviceConfig, Interface,
    Peer, PeerEndpoint, RegisterRequest, API_BASE,
};
pub use dns::{DnsConfig, DnsError, DnsResolver};

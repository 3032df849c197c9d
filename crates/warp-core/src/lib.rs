//! warp-plus Core - WARP tunnel orchestration
//!
//! Turns a set of user options into an established WireGuard session
//! against the Cloudflare WARP edge.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌─────────────────┐
//! │  RawOptions  │──▶│   validate()   │──▶│  Configuration  │
//! └──────────────┘   └────────────────┘   └────────┬────────┘
//!                                                  │
//!                      ┌───────────────────────────▼──────────────────────────┐
//!                      │                    Orchestrator                       │
//!                      │                                                       │
//!                      │  IdentityCache ──▶ Mode dispatch ──▶ EndpointScanner  │
//!                      │  (Registrar)                         (Prober)         │
//!                      └───────────────────────────┬──────────────────────────┘
//!                                                  │ TunnelRequest
//!                                                  ▼
//!                                         ┌─────────────────┐
//!                                         │  TunnelBuilder  │──▶ Session
//!                                         └─────────────────┘
//! ```
//!
//! # Modes
//!
//! - **Direct**: one WireGuard session to the chosen endpoint
//! - **DoubleHop** (warp-in-warp): a second session to an exit endpoint,
//!   carried inside the first
//! - **CircumventionWrapped** (psiphon): WireGuard over the Psiphon
//!   transport, exiting in a chosen country
//! - **Obfuscated** (AmneziaWG): validated, not implemented
//!
//! Every stage takes a [`RunContext`]; cancelling its token or passing its
//! deadline ends the run with [`WarpError::Cancelled`].

mod context;
mod endpoint;
mod error;
mod identity;
mod keys;
mod noise;
mod options;
mod orchestrator;
mod registrar;
mod scanner;
mod tunnel;
mod wgconf;

pub use context::{CancelReason, RunContext};
pub use endpoint::{CandidatePool, Endpoint, EndpointParseError, EndpointSpec};
pub use error::{ErrorKind, Result, WarpError, AMNEZIA_NOT_IMPLEMENTED};
pub use identity::{AccountBinding, CacheError, Identity, IdentityCache, Registrar, RegistrationError};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use noise::{HandshakeError, HandshakeResponse};
pub use options::{
    validate, Configuration, CountryCode, Mode, OptionsFileError, RawOptions, RawScanOptions,
    ScanPolicy, ValidationError, DEFAULT_SCAN_CONCURRENCY, DEFAULT_SCAN_RTT,
    DEFAULT_SCAN_TIMEOUT, PSIPHON_COUNTRIES,
};
pub use orchestrator::{Orchestrator, RunState, DEFAULT_POOL_PER_FAMILY};
pub use registrar::binding_from_device;
pub use scanner::{
    EndpointScanner, HandshakeProber, ProbeError, Prober, ScanEntry, ScanError, ScanResult,
};
pub use tunnel::{
    HandshakeTunnelBuilder, Session, TunnelBuilder, TunnelError, TunnelRequest, WrapParams,
    HANDSHAKE_TIMEOUT,
};
pub use wgconf::WgQuickConfig;

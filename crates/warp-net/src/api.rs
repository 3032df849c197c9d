//! Registration API Client
//!
//! Talks to the WARP device registration API.
//! Features:
//! - hyper HTTP/1.1 over tokio with rustls (memory-safe TLS)
//! - One connection per request, no pooling (registration is rare)
//! - Typed request/response bodies via serde

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST, RETRY_AFTER, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Production API base (versioned path included)
pub const API_BASE: &str = "https://api.cloudflareclient.com/v0a4005";

const CF_CLIENT_VERSION: &str = "a-6.30-3596";
const TOS_TIMESTAMP: &str = "2021-01-01T00:00:00.000Z";

/// Registration API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API request failed with status: {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    /// The API answered with a 5xx status
    pub fn is_server_error(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if status.is_server_error())
    }

    /// Worth retrying the whole registration later
    pub fn is_recoverable(&self) -> bool {
        self.is_server_error()
            || matches!(
                self,
                ApiError::RateLimited(_) | ApiError::ConnectionFailed(_) | ApiError::Timeout
            )
    }
}

/// API client configuration
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL, including the API version segment
    pub base_url: String,
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: API_BASE.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "okhttp/3.12.1".to_string(),
        }
    }
}

/// Device registration request body
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub install_id: String,
    pub fcm_token: String,
    pub tos: String,
    pub key: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub model: String,
    pub locale: String,
}

impl RegisterRequest {
    /// Build a request for the given base64 WireGuard public key
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            install_id: String::new(),
            fcm_token: String::new(),
            tos: TOS_TIMESTAMP.to_string(),
            key: public_key.into(),
            device_type: "Android".to_string(),
            model: "PC".to_string(),
            locale: "en_US".to_string(),
        }
    }
}

/// Registered device, as returned by `POST /reg`
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub id: String,
    pub token: String,
    pub account: Account,
    pub config: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_type: String,
    pub license: String,
    #[serde(default)]
    pub warp_plus: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Base64; the first three bytes are the reserved header bytes
    pub client_id: String,
    pub interface: Interface,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interface {
    pub addresses: Addresses,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Addresses {
    pub v4: String,
    pub v6: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Peer {
    pub public_key: String,
    pub endpoint: PeerEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub v4: Option<String>,
    #[serde(default)]
    pub v6: Option<String>,
}

#[derive(Debug, Serialize)]
struct LicenseUpdate<'a> {
    license: &'a str,
}

/// Raw HTTP response
#[derive(Debug)]
struct Response {
    status: StatusCode,
    retry_after: Option<u64>,
    body: Vec<u8>,
}

/// Registration API client
#[derive(Debug, Clone)]
pub struct ApiClient {
    config: ApiClientConfig,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: ApiClientConfig) -> Self {
        debug!(
            "API client initialized (base: {}, timeout: {:?})",
            config.base_url, config.timeout
        );
        Self { config }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ApiClientConfig::default())
    }

    pub fn config(&self) -> &ApiClientConfig {
        &self.config
    }

    /// Register a new device for the given public key
    pub async fn register(&self, public_key: &str) -> Result<Device, ApiError> {
        info!("Registering new device");

        let body = serde_json::to_vec(&RegisterRequest::new(public_key))?;
        let url = format!("{}/reg", self.config.base_url);
        let response = self.send(Method::POST, &url, None, Some(body)).await?;

        let device: Device = serde_json::from_slice(&response.body)?;
        if device.config.peers.is_empty() {
            return Err(ApiError::InvalidResponse("No peers in config".to_string()));
        }

        debug!("Device registered, id: {}", device.id);
        Ok(device)
    }

    /// Bind a license key to a registered device
    pub async fn update_license(
        &self,
        device_id: &str,
        token: &str,
        license: &str,
    ) -> Result<Account, ApiError> {
        info!("Applying license to device {}", device_id);

        let body = serde_json::to_vec(&LicenseUpdate { license })?;
        let url = format!("{}/reg/{}/account", self.config.base_url, device_id);
        let response = self.send(Method::PUT, &url, Some(token), Some(body)).await?;

        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Perform one request, bounded by the configured timeout
    async fn send(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, ApiError> {
        let start = Instant::now();
        let response = tokio::time::timeout(self.config.timeout, self.exchange(method.clone(), url, token, body))
            .await
            .map_err(|_| ApiError::Timeout)??;

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?})",
            method, url, response.status, response.body.len(), start.elapsed()
        );

        if response.status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited(response.retry_after.unwrap_or(60)));
        }
        if !response.status.is_success() {
            return Err(ApiError::Status {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        Ok(response)
    }

    async fn exchange(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, ApiError> {
        // 1. Parse URL
        let uri: Uri = url.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ApiError::InvalidUrl(e.to_string()))?;

        let host = uri.host()
            .ok_or_else(|| ApiError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let authority = uri.authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| host.clone());

        // 2. Build request
        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(HOST, authority)
            .header(USER_AGENT, &self.config.user_agent)
            .header("CF-Client-Version", CF_CLIENT_VERSION)
            .header(CONTENT_TYPE, "application/json; charset=UTF-8");

        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ApiError::Http(e.to_string()))?;

        // 3. Connect
        let addr = format!("{}:{}", host.trim_start_matches('[').trim_end_matches(']'), port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ApiError::Timeout)?
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;

        // 4. Send over TLS or plain HTTP
        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ApiError::Tls("Invalid server name".to_string()))?;

            let tls_stream = connector.connect(server_name, stream).await
                .map_err(|e| ApiError::Tls(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await
                .map_err(|e| ApiError::Http(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Connection error: {}", e);
                }
            });

            sender.send_request(request).await
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await
                .map_err(|e| ApiError::Http(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Connection error: {}", e);
                }
            });

            sender.send_request(request).await
        };

        let response = response.map_err(|e| ApiError::Http(e.to_string()))?;

        // 5. Read response
        let status = response.status();
        let retry_after = response.headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let collected = response.into_body().collect().await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        Ok(Response {
            status,
            retry_after,
            body: collected.to_bytes().to_vec(),
        })
    }
}

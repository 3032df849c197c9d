//! Run options and their validation
//!
//! [`RawOptions`] is whatever the caller collected (CLI flags, a TOML
//! file, a test). [`validate`] is the only way to obtain a
//! [`Configuration`]: its fields are private and the tunnel strategy is a
//! single [`Mode`] value, so conflicting strategies cannot be expressed
//! once validation has passed.

use crate::endpoint::EndpointSpec;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default worker count for endpoint scans
pub const DEFAULT_SCAN_CONCURRENCY: usize = 8;

/// Default upper bound on a single probe's round trip
pub const DEFAULT_SCAN_RTT: Duration = Duration::from_millis(1000);

/// Default time budget for a whole scan
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Countries the circumvention transport can exit from
pub const PSIPHON_COUNTRIES: &[&str] = &[
    "AT", "AU", "BE", "BG", "CA", "CH", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "HR",
    "HU", "IE", "IN", "IT", "JP", "LV", "NL", "NO", "PL", "PT", "RO", "RS", "SE", "SG", "SK",
    "UA", "US",
];

/// Options as collected, before any rule is checked
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawOptions {
    /// AmneziaWG obfuscated transport
    pub amnezia: bool,
    /// Warp-in-warp double hop
    pub gool: bool,
    /// Psiphon circumvention wrapping
    pub cfon: bool,
    /// Psiphon exit country (two-letter code)
    pub country: Option<String>,
    /// Fixed endpoint, `ip:port` or `host:port`
    pub endpoint: Option<String>,
    /// Account license key; empty registers anonymously
    pub license: String,
    /// Identity cache directory
    pub cache_dir: PathBuf,
    /// Resolver used for endpoint lookups and inside the tunnel
    pub dns: Option<IpAddr>,
    /// Endpoint scan settings; `None` disables scanning
    pub scan: Option<RawScanOptions>,
    /// Pre-supplied wg-quick style tunnel config
    pub wgconf: Option<PathBuf>,
    /// Local proxy listen address
    pub bind: Option<SocketAddr>,
}

/// Scan options as collected
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawScanOptions {
    pub ipv4: bool,
    pub ipv6: bool,
    /// Maximum acceptable round trip, in milliseconds
    pub rtt_ms: u64,
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub keep_partial_on_cancel: bool,
}

impl Default for RawScanOptions {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
            rtt_ms: DEFAULT_SCAN_RTT.as_millis() as u64,
            concurrency: None,
            timeout_secs: None,
            keep_partial_on_cancel: false,
        }
    }
}

impl RawOptions {
    /// Load options from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, OptionsFileError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OptionsFileError::Io(path.to_path_buf(), e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load options from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, OptionsFileError> {
        toml::from_str(content).map_err(|e| OptionsFileError::Parse(e.to_string()))
    }
}

/// Errors reading an options file
#[derive(Debug, Clone, thiserror::Error)]
pub enum OptionsFileError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, String),

    #[error("failed to parse options: {0}")]
    Parse(String),
}

/// Upper-case two-letter country code from [`PSIPHON_COUNTRIES`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tunnel strategy, chosen once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Direct,
    /// Warp-in-warp
    DoubleHop,
    /// Handshake wrapped in the Psiphon transport
    CircumventionWrapped { country: CountryCode },
    /// AmneziaWG
    Obfuscated,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::DoubleHop => "warp-in-warp",
            Mode::CircumventionWrapped { .. } => "psiphon",
            Mode::Obfuscated => "amnezia",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated scan settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPolicy {
    pub ipv4: bool,
    pub ipv6: bool,
    pub max_rtt: Duration,
    pub concurrency: usize,
    pub timeout: Duration,
    pub keep_partial_on_cancel: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
            max_rtt: DEFAULT_SCAN_RTT,
            concurrency: DEFAULT_SCAN_CONCURRENCY,
            timeout: DEFAULT_SCAN_TIMEOUT,
            keep_partial_on_cancel: false,
        }
    }
}

/// Validated, immutable run configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    mode: Mode,
    endpoint: Option<EndpointSpec>,
    license: String,
    cache_dir: PathBuf,
    dns: IpAddr,
    scan: Option<ScanPolicy>,
    raw_tunnel_config: Option<PathBuf>,
    bind: SocketAddr,
}

impl Configuration {
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn endpoint(&self) -> Option<&EndpointSpec> {
        self.endpoint.as_ref()
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn dns(&self) -> IpAddr {
        self.dns
    }

    pub fn scan(&self) -> Option<&ScanPolicy> {
        self.scan.as_ref()
    }

    pub fn raw_tunnel_config(&self) -> Option<&Path> {
        self.raw_tunnel_config.as_deref()
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }
}

impl TryFrom<RawOptions> for Configuration {
    type Error = ValidationError;

    fn try_from(raw: RawOptions) -> Result<Self, Self::Error> {
        validate(raw)
    }
}

/// Conflicting or incomplete options
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("must provide --endpoint for AmneziaWG server")]
    AmneziaWithoutEndpoint,

    #[error("can't use amnezia and cfon (psiphon) at the same time")]
    AmneziaWithPsiphon,

    #[error("can't use amnezia and gool (warp-in-warp) at the same time")]
    AmneziaWithGool,

    #[error("can't use amnezia and wgconf (direct wireguard config) at the same time")]
    AmneziaWithWgConf,

    #[error("can't use amnezia and scan mode at the same time")]
    AmneziaWithScan,

    #[error("can't use cfon and gool at the same time")]
    PsiphonWithGool,

    #[error("invalid psiphon country code: {0}")]
    InvalidCountry(String),

    #[error("must enable at least one of IPv4 or IPv6 for scanning")]
    NoAddressFamily,

    #[error("scan rtt must be greater than zero")]
    ZeroScanRtt,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("cache directory must not be empty")]
    EmptyCacheDir,
}

/// Check `raw` against every option rule and normalize it
///
/// Rules are checked in a fixed order and the first violation is
/// returned. Pure: no I/O, same input gives the same outcome.
pub fn validate(raw: RawOptions) -> Result<Configuration, ValidationError> {
    let has_endpoint = raw.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty());

    if raw.amnezia {
        if !has_endpoint {
            return Err(ValidationError::AmneziaWithoutEndpoint);
        }
        if raw.cfon {
            return Err(ValidationError::AmneziaWithPsiphon);
        }
        if raw.gool {
            return Err(ValidationError::AmneziaWithGool);
        }
        if raw.wgconf.is_some() {
            return Err(ValidationError::AmneziaWithWgConf);
        }
        if raw.scan.is_some() {
            return Err(ValidationError::AmneziaWithScan);
        }
    }

    if raw.cfon && raw.gool {
        return Err(ValidationError::PsiphonWithGool);
    }

    let mode = if raw.amnezia {
        Mode::Obfuscated
    } else if raw.cfon {
        Mode::CircumventionWrapped {
            country: parse_country(raw.country.as_deref())?,
        }
    } else if raw.gool {
        Mode::DoubleHop
    } else {
        Mode::Direct
    };

    let scan = raw.scan.map(scan_policy).transpose()?;

    let endpoint = match raw.endpoint.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Some(
            text.parse::<EndpointSpec>()
                .map_err(|_| ValidationError::InvalidEndpoint(text.to_string()))?,
        ),
        _ => None,
    };

    if raw.cache_dir.as_os_str().is_empty() {
        return Err(ValidationError::EmptyCacheDir);
    }

    Ok(Configuration {
        mode,
        endpoint,
        license: raw.license.trim().to_string(),
        cache_dir: raw.cache_dir,
        dns: raw.dns.unwrap_or(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
        scan,
        raw_tunnel_config: raw.wgconf,
        bind: raw.bind.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8086))),
    })
}

fn parse_country(country: Option<&str>) -> Result<CountryCode, ValidationError> {
    let code = match country.map(str::trim) {
        None | Some("") => "AT".to_string(),
        Some(code) => code.to_ascii_uppercase(),
    };

    if PSIPHON_COUNTRIES.contains(&code.as_str()) {
        Ok(CountryCode(code))
    } else {
        Err(ValidationError::InvalidCountry(code))
    }
}

fn scan_policy(raw: RawScanOptions) -> Result<ScanPolicy, ValidationError> {
    if !raw.ipv4 && !raw.ipv6 {
        return Err(ValidationError::NoAddressFamily);
    }
    if raw.rtt_ms == 0 {
        return Err(ValidationError::ZeroScanRtt);
    }

    Ok(ScanPolicy {
        ipv4: raw.ipv4,
        ipv6: raw.ipv6,
        max_rtt: Duration::from_millis(raw.rtt_ms),
        concurrency: raw.concurrency.unwrap_or(DEFAULT_SCAN_CONCURRENCY).max(1),
        timeout: raw.timeout_secs.map(Duration::from_secs).unwrap_or(DEFAULT_SCAN_TIMEOUT),
        keep_partial_on_cancel: raw.keep_partial_on_cancel,
    })
}

//! warp-plus: WARP tunnel launcher
//!
//! Parses flags (optionally on top of a TOML options file), sets up logging
//! and runs the orchestrator until the WireGuard handshake completes. No
//! local proxy front end is linked into this build, so nothing listens on
//! `--bind`; the binary reports the session and exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warp_core::{
    HandshakeTunnelBuilder, Orchestrator, RawOptions, RawScanOptions, RunContext, Session,
};
use warp_net::ApiClient;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "warp-plus", version, about = "Cloudflare WARP tunnel with psiphon and warp-in-warp modes")]
struct Args {
    /// Local proxy listen address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Fixed WARP endpoint (ip:port or host:port)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// WARP+ license key
    #[arg(short = 'k', long = "key")]
    license: Option<String>,

    /// DNS server for endpoint lookups and inside the tunnel
    #[arg(long)]
    dns: Option<IpAddr>,

    /// Warp-in-warp (double hop)
    #[arg(long)]
    gool: bool,

    /// Wrap the tunnel in psiphon
    #[arg(long)]
    cfon: bool,

    /// Psiphon exit country
    #[arg(long)]
    country: Option<String>,

    /// Scan for the fastest endpoint
    #[arg(long)]
    scan: bool,

    /// Maximum scan round trip, in milliseconds
    #[arg(long)]
    rtt: Option<u64>,

    /// Scan IPv4 endpoints only
    #[arg(short = '4')]
    ipv4_only: bool,

    /// Scan IPv6 endpoints only
    #[arg(short = '6')]
    ipv6_only: bool,

    /// Identity cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Use an existing wg-quick config instead of registering
    #[arg(long)]
    wgconf: Option<PathBuf>,

    /// AmneziaWG obfuscation (requires --endpoint)
    #[arg(short, long)]
    amnezia: bool,

    /// TOML options file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give up if the tunnel is not up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Options file (if any) overlaid with the flags
    fn to_options(&self) -> Result<RawOptions> {
        let mut raw = match &self.config {
            Some(path) => RawOptions::from_toml_file(path)
                .with_context(|| format!("loading options from {}", path.display()))?,
            None => RawOptions::default(),
        };

        raw.amnezia |= self.amnezia;
        raw.gool |= self.gool;
        raw.cfon |= self.cfon;

        if self.country.is_some() {
            raw.country = self.country.clone();
        }
        if self.endpoint.is_some() {
            raw.endpoint = self.endpoint.clone();
        }
        if let Some(license) = &self.license {
            raw.license = license.clone();
        }
        if let Some(dns) = self.dns {
            raw.dns = Some(dns);
        }
        if let Some(bind) = self.bind {
            raw.bind = Some(bind);
        }
        if self.wgconf.is_some() {
            raw.wgconf = self.wgconf.clone();
        }

        if self.scan {
            let scan = raw.scan.get_or_insert_with(RawScanOptions::default);
            if let Some(rtt) = self.rtt {
                scan.rtt_ms = rtt;
            }
            if self.ipv4_only {
                scan.ipv6 = false;
            }
            if self.ipv6_only {
                scan.ipv4 = false;
            }
        }

        if let Some(dir) = &self.cache_dir {
            raw.cache_dir = dir.clone();
        } else if raw.cache_dir.as_os_str().is_empty() {
            raw.cache_dir = default_cache_dir();
        }

        Ok(raw)
    }

    fn run_context(&self, token: CancellationToken) -> RunContext {
        match self.timeout {
            Some(secs) => RunContext::with_timeout(Duration::from_secs(secs)),
            None => RunContext::new(),
        }
        .with_token(token)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warp-plus")
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("warp-plus starting...");
    let raw = args.to_options()?;

    let token = CancellationToken::new();
    let ctx = args.run_context(token.clone());

    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down");
                token.cancel();
            }
        }
    });

    let orchestrator = Orchestrator::new(
        Arc::new(ApiClient::with_defaults()),
        Arc::new(HandshakeTunnelBuilder::default()),
    );

    let session = orchestrator.run(raw, &ctx).await?;
    info!("{}", session_summary(&session));
    warn!("No proxy front end in this build, {} is not being served", session.bind);

    Ok(())
}

fn session_summary(session: &Session) -> String {
    match session.exit {
        Some(exit) => format!(
            "WireGuard handshake with {} completed in {:?} (exit {})",
            session.endpoint, session.handshake_rtt, exit
        ),
        None => format!(
            "WireGuard handshake with {} completed in {:?}",
            session.endpoint, session.handshake_rtt
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_core::validate;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("warp-plus").chain(args.iter().copied())).unwrap()
    }

    fn validation_error(args: &[&str]) -> String {
        let raw = parse(args).to_options().unwrap();
        validate(raw).unwrap_err().to_string()
    }

    #[test]
    fn test_amnezia_flags() {
        assert!(parse(&["--amnezia", "--endpoint", "server:1234"]).amnezia);
        assert!(parse(&["-a", "--endpoint", "server:1234"]).amnezia);
        assert!(!parse(&["--endpoint", "server:1234"]).amnezia);

        let raw = parse(&["-a", "-e", "server:1234"]).to_options().unwrap();
        assert!(validate(raw).is_ok());
    }

    #[test]
    fn test_amnezia_conflict_messages() {
        let cases = [
            (vec!["--amnezia"], "must provide --endpoint for AmneziaWG server"),
            (
                vec!["--amnezia", "--cfon", "--country", "US", "--endpoint", "server:1234"],
                "can't use amnezia and cfon (psiphon) at the same time",
            ),
            (
                vec!["--amnezia", "--gool", "--endpoint", "server:1234"],
                "can't use amnezia and gool (warp-in-warp) at the same time",
            ),
            (
                vec!["--amnezia", "--wgconf", "config.conf", "--endpoint", "server:1234"],
                "can't use amnezia and wgconf (direct wireguard config) at the same time",
            ),
            (
                vec!["--amnezia", "--scan", "--endpoint", "server:1234"],
                "can't use amnezia and scan mode at the same time",
            ),
        ];

        for (args, expected) in cases {
            let message = validation_error(&args);
            assert!(message.contains(expected), "{args:?}: {message}");
        }
    }

    #[test]
    fn test_scan_flags() {
        let raw = parse(&["--scan", "--rtt", "250", "-4"]).to_options().unwrap();
        let scan = raw.scan.unwrap();
        assert_eq!(scan.rtt_ms, 250);
        assert!(scan.ipv4);
        assert!(!scan.ipv6);

        assert!(parse(&["--rtt", "250"]).to_options().unwrap().scan.is_none());
        assert!(validation_error(&["--scan", "-4", "-6"]).contains("at least one of IPv4 or IPv6"));
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warp.toml");
        std::fs::write(
            &path,
            "license = \"from-file\"\ngool = true\ncache_dir = \"/var/cache/warp\"\n\n[scan]\nrtt_ms = 800\n",
        )
        .unwrap();
        let path = path.to_str().unwrap();

        let raw = parse(&["-c", path, "-k", "from-flag"]).to_options().unwrap();
        assert_eq!(raw.license, "from-flag");
        assert!(raw.gool);
        assert_eq!(raw.cache_dir, PathBuf::from("/var/cache/warp"));
        assert_eq!(raw.scan.unwrap().rtt_ms, 800);
    }

    #[test]
    fn test_missing_config_file() {
        assert!(parse(&["-c", "/nonexistent/warp.toml"]).to_options().is_err());
    }

    #[test]
    fn test_session_summary_reports_handshake_only() {
        let endpoint = "162.159.192.1:2408".parse().unwrap();
        let bind: SocketAddr = "127.0.0.1:8086".parse().unwrap();
        let mut session = Session::new(endpoint, bind);
        session.handshake_rtt = Duration::from_millis(42);

        let summary = session_summary(&session);
        assert!(summary.contains("162.159.192.1:2408"));
        assert!(summary.contains("42ms"));
        assert!(!summary.contains("8086"));
        assert!(!summary.to_lowercase().contains("serving"));
    }

    #[test]
    fn test_default_cache_dir() {
        let raw = parse(&[]).to_options().unwrap();
        assert!(raw.cache_dir.ends_with("warp-plus"));
    }
}

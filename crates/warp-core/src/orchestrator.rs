//! Mode Dispatcher
//!
//! Drives one run through its stages:
//!
//! ```text
//! Start -> Validating -> LoadingIdentity -> Dispatching -> [Scanning] -> Building -> Done
//!                                                                       (any stage) -> Failed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(Arc::new(ApiClient::with_defaults()), builder);
//! let ctx = RunContext::with_timeout(Duration::from_secs(60));
//! let session = orchestrator.run(raw_options, &ctx).await?;
//! ```

use crate::context::RunContext;
use crate::endpoint::{CandidatePool, Endpoint, EndpointSpec};
use crate::error::{AMNEZIA_NOT_IMPLEMENTED, Result, WarpError};
use crate::identity::{Identity, IdentityCache, Registrar};
use crate::options::{validate, Configuration, Mode, RawOptions};
use crate::scanner::{EndpointScanner, HandshakeProber, Prober, ScanError};
use crate::tunnel::{Session, TunnelBuilder, TunnelError, TunnelRequest, WrapParams};
use std::sync::Arc;
use std::net::IpAddr;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use warp_net::{DnsConfig, DnsResolver};

/// Addresses sampled per family when scanning the default pool
pub const DEFAULT_POOL_PER_FAMILY: usize = 16;

/// Run stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Validating,
    LoadingIdentity,
    Scanning,
    Dispatching,
    Building,
    Done,
    Failed,
}

impl RunState {
    /// Done or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Endpoints chosen for a run
struct Route {
    entry: Endpoint,
    /// Second-ranked scan result, if any
    runner_up: Option<Endpoint>,
}

/// Runs validation, identity, scan and tunnel setup in order
pub struct Orchestrator {
    identities: IdentityCache,
    builder: Arc<dyn TunnelBuilder>,
    prober: Option<Arc<dyn Prober>>,
    pool: Option<CandidatePool>,
    /// Kept across runs so its lookup cache survives; rebuilt when `dns` changes
    resolver: Mutex<Option<Arc<DnsResolver>>>,
    state: Arc<RwLock<RunState>>,
}

impl Orchestrator {
    pub fn new(registrar: Arc<dyn Registrar>, builder: Arc<dyn TunnelBuilder>) -> Self {
        Self {
            identities: IdentityCache::new(registrar),
            builder,
            prober: None,
            pool: None,
            resolver: Mutex::new(None),
            state: Arc::new(RwLock::new(RunState::Start)),
        }
    }

    /// Probe with `prober` instead of a handshake from the run's identity
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Scan `pool` instead of a fresh sample of the WARP edge
    pub fn with_pool(mut self, pool: CandidatePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Current stage
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    /// Validate `raw` and run
    pub async fn run(&self, raw: RawOptions, ctx: &RunContext) -> Result<Session> {
        self.set_state(RunState::Start).await;
        let result = async {
            self.enter(RunState::Validating, ctx).await?;
            let config = validate(raw)?;
            self.execute(&config, ctx).await
        }
        .await;

        self.finish(result).await
    }

    /// Run with an already validated configuration
    pub async fn run_validated(&self, config: Configuration, ctx: &RunContext) -> Result<Session> {
        self.set_state(RunState::Start).await;
        let result = self.execute(&config, ctx).await;
        self.finish(result).await
    }

    async fn execute(&self, config: &Configuration, ctx: &RunContext) -> Result<Session> {
        self.enter(RunState::LoadingIdentity, ctx).await?;
        let (identity, conf_endpoint) = self.load_identity(config, ctx).await?;

        self.enter(RunState::Dispatching, ctx).await?;
        info!("Dispatching {} mode", config.mode());

        let fixed = config.endpoint().cloned().or(conf_endpoint);

        let (entry, wrap) = match config.mode() {
            Mode::CircumventionWrapped { country } => {
                let route = self.route(config, fixed.as_ref(), &identity, ctx).await?;
                (route.entry, WrapParams::Circumvention { country: country.clone() })
            }
            Mode::DoubleHop => {
                let route = self.route(config, fixed.as_ref(), &identity, ctx).await?;
                let exit = route.runner_up.unwrap_or(route.entry);
                (route.entry, WrapParams::DoubleHop { exit })
            }
            Mode::Direct => {
                let route = self.route(config, fixed.as_ref(), &identity, ctx).await?;
                (route.entry, WrapParams::None)
            }
            Mode::Obfuscated => {
                warn!("AmneziaWG requested for {:?}", config.endpoint());
                return Err(WarpError::NotImplemented(AMNEZIA_NOT_IMPLEMENTED));
            }
        };

        self.enter(RunState::Building, ctx).await?;
        let request = TunnelRequest {
            endpoint: entry,
            identity,
            wrap,
            dns: config.dns(),
            bind: config.bind(),
        };

        let session = ctx.run(self.builder.build(request, ctx)).await??;
        info!("Tunnel up via {} (proxy on {})", session.endpoint, session.bind);
        Ok(session)
    }

    /// Identity from the wg-quick config if one was given, else from the cache
    async fn load_identity(
        &self,
        config: &Configuration,
        ctx: &RunContext,
    ) -> Result<(Arc<Identity>, Option<EndpointSpec>)> {
        if let Some(path) = config.raw_tunnel_config() {
            info!("Using WireGuard config {}", path.display());
            let (identity, endpoint) = Identity::from_wg_conf(path)?;
            return Ok((Arc::new(identity), endpoint));
        }

        let identity = self
            .identities
            .load_or_create(config.cache_dir(), config.license(), ctx)
            .await?;
        Ok((Arc::new(identity), None))
    }

    async fn route(
        &self,
        config: &Configuration,
        fixed: Option<&EndpointSpec>,
        identity: &Identity,
        ctx: &RunContext,
    ) -> Result<Route> {
        let (ipv4, ipv6) = config.scan().map_or((true, true), |p| (p.ipv4, p.ipv6));

        if let Some(spec) = fixed {
            let entry = self.resolve(spec, config, ipv4, ipv6, ctx).await?;
            debug!("Using fixed endpoint {}", entry);
            return Ok(Route { entry, runner_up: None });
        }

        if let Some(policy) = config.scan() {
            self.enter(RunState::Scanning, ctx).await?;

            let prober = self
                .prober
                .clone()
                .unwrap_or_else(|| Arc::new(HandshakeProber::new(identity)));
            let pool = self
                .pool
                .clone()
                .unwrap_or_else(|| CandidatePool::warp_default(DEFAULT_POOL_PER_FAMILY));

            let result = EndpointScanner::new(prober).scan(&pool, policy, ctx).await?;
            let mut ranked = result.entries().iter().map(|e| e.endpoint);
            let entry = ranked.next().ok_or(ScanError::NoEndpoints)?;

            return Ok(Route { entry, runner_up: ranked.next() });
        }

        let entry = CandidatePool::random_endpoint(ipv4, ipv6).ok_or(ScanError::NoEndpoints)?;
        debug!("Using random endpoint {}", entry);
        Ok(Route { entry, runner_up: None })
    }

    async fn resolve(
        &self,
        spec: &EndpointSpec,
        config: &Configuration,
        ipv4: bool,
        ipv6: bool,
        ctx: &RunContext,
    ) -> Result<Endpoint> {
        match spec {
            EndpointSpec::Addr(endpoint) => Ok(*endpoint),
            EndpointSpec::Named { host, port } => {
                let resolver = self.resolver_for(config.dns()).await;
                let addr = ctx
                    .run(resolver.resolve_one(host, ipv4, ipv6))
                    .await?
                    .map_err(|e| TunnelError::Setup(format!("resolve {}: {}", host, e)))?;
                debug!("Resolved {} to {}", host, addr);
                Ok(Endpoint::new(addr, *port))
            }
        }
    }

    /// Shared resolver querying `nameserver`
    async fn resolver_for(&self, nameserver: IpAddr) -> Arc<DnsResolver> {
        let mut slot = self.resolver.lock().await;
        match slot.as_ref() {
            Some(resolver) if resolver.config().nameserver == nameserver => resolver.clone(),
            _ => {
                let resolver = Arc::new(DnsResolver::new(DnsConfig::with_nameserver(nameserver)));
                *slot = Some(resolver.clone());
                resolver
            }
        }
    }

    /// Check the context, then move to `state`
    async fn enter(&self, state: RunState, ctx: &RunContext) -> Result<()> {
        if let Some(reason) = ctx.check() {
            return Err(reason.into());
        }
        debug!("Run state: {:?}", state);
        self.set_state(state).await;
        Ok(())
    }

    async fn finish(&self, result: Result<Session>) -> Result<Session> {
        match &result {
            Ok(_) => self.set_state(RunState::Done).await,
            Err(e) => {
                error!("Run failed: {}", e);
                self.set_state(RunState::Failed).await;
            }
        }
        result
    }

    async fn set_state(&self, state: RunState) {
        *self.state.write().await = state;
    }
}

//! Endpoint Scanner
//!
//! Probes a [`CandidatePool`] with a bounded worker pool and ranks the
//! endpoints that answered by round-trip time.
//!
//! Workers pull `(pool index, endpoint)` jobs from a queue that is filled
//! up front and push successful probes back over a channel. Collection
//! stops when every worker is done, when the scan budget elapses (partial
//! results are kept) or when the run is cancelled.

use crate::context::{CancelReason, RunContext};
use crate::endpoint::{CandidatePool, Endpoint};
use crate::identity::Identity;
use crate::keys::{KeyPair, PublicKey};
use crate::noise;
use crate::options::ScanPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Single probe failure; never fatal for the scan
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("socket error: {0}")]
    Io(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Measures the round trip to one endpoint
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: Endpoint) -> Result<Duration, ProbeError>;
}

/// Probes with a real WireGuard handshake initiation
pub struct HandshakeProber {
    keys: KeyPair,
    peer: PublicKey,
    reserved: [u8; 3],
}

impl HandshakeProber {
    pub fn new(identity: &Identity) -> Self {
        Self {
            keys: identity.keys.clone(),
            peer: identity.account.peer_public_key,
            reserved: identity.account.reserved,
        }
    }
}

#[async_trait]
impl Prober for HandshakeProber {
    async fn probe(&self, endpoint: Endpoint) -> Result<Duration, ProbeError> {
        let socket = noise::connect_udp(endpoint.to_socket_addr())
            .await
            .map_err(|e| ProbeError::Io(e.to_string()))?;

        let (_, rtt) = noise::exchange(&socket, &self.keys, &self.peer, self.reserved)
            .await
            .map_err(|e| ProbeError::Handshake(e.to_string()))?;

        Ok(rtt)
    }
}

/// One endpoint that answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanEntry {
    pub endpoint: Endpoint,
    pub rtt: Duration,
}

/// Reachable endpoints, fastest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    entries: Vec<ScanEntry>,
    complete: bool,
}

impl ScanResult {
    pub fn best(&self) -> Option<&ScanEntry> {
        self.entries.first()
    }

    pub fn entries(&self) -> &[ScanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// False when the budget or a cancellation cut the scan short
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("no endpoints found")]
    NoEndpoints,

    #[error("scan interrupted: {0}")]
    Cancelled(CancelReason),
}

/// How collection ended
enum Stop {
    Drained,
    Budget,
    Cancelled,
}

pub struct EndpointScanner {
    prober: Arc<dyn Prober>,
}

impl EndpointScanner {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Probe the enabled families of `pool` and rank what answered
    pub async fn scan(
        &self,
        pool: &CandidatePool,
        policy: &ScanPolicy,
        ctx: &RunContext,
    ) -> Result<ScanResult, ScanError> {
        if let Some(reason) = ctx.check() {
            return Err(ScanError::Cancelled(reason));
        }

        let candidates = pool.filtered(policy.ipv4, policy.ipv6);
        if candidates.is_empty() {
            return Err(ScanError::NoEndpoints);
        }

        let workers = policy.concurrency.clamp(1, candidates.len());
        let budget = ctx
            .remaining()
            .map_or(policy.timeout, |left| left.min(policy.timeout));

        info!(
            "Scanning {} endpoints ({} workers, max rtt {:?}, budget {:?})",
            candidates.len(),
            workers,
            policy.max_rtt,
            budget
        );

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for job in candidates {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (result_tx, mut result_rx) = mpsc::channel::<(usize, ScanEntry)>(workers * 2);
        let mut tasks = JoinSet::new();

        for _ in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let prober = self.prober.clone();
            let max_rtt = policy.max_rtt;

            tasks.spawn(async move {
                while let Ok((index, endpoint)) = jobs.try_recv() {
                    let rtt = match tokio::time::timeout(max_rtt, prober.probe(endpoint)).await {
                        Ok(Ok(rtt)) if rtt <= max_rtt => rtt,
                        Ok(Ok(rtt)) => {
                            trace!("{} too slow ({:?})", endpoint, rtt);
                            continue;
                        }
                        Ok(Err(e)) => {
                            trace!("{} failed: {}", endpoint, e);
                            continue;
                        }
                        Err(_) => {
                            trace!("{} timed out", endpoint);
                            continue;
                        }
                    };

                    if results.send((index, ScanEntry { endpoint, rtt })).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut found = Vec::new();
        let sleep = tokio::time::sleep(budget);
        tokio::pin!(sleep);

        let stop = loop {
            tokio::select! {
                biased;
                _ = ctx.token().cancelled() => break Stop::Cancelled,
                _ = &mut sleep => break Stop::Budget,
                msg = result_rx.recv() => match msg {
                    Some(item) => found.push(item),
                    None => break Stop::Drained,
                },
            }
        };

        tasks.abort_all();

        found.sort_by_key(|(index, entry)| (entry.rtt, *index));
        let entries: Vec<ScanEntry> = found.into_iter().map(|(_, entry)| entry).collect();

        let complete = match stop {
            Stop::Drained => true,
            Stop::Budget => {
                debug!("Scan budget elapsed with {} endpoints found", entries.len());
                false
            }
            Stop::Cancelled => {
                if policy.keep_partial_on_cancel && !entries.is_empty() {
                    warn!("Scan cancelled, keeping {} partial results", entries.len());
                    false
                } else {
                    return Err(ScanError::Cancelled(CancelReason::Cancelled));
                }
            }
        };

        match entries.first() {
            Some(best) => {
                info!(
                    "Scan found {} endpoints, best {} ({:?})",
                    entries.len(),
                    best.endpoint,
                    best.rtt
                );
                Ok(ScanResult { entries, complete })
            }
            None => Err(ScanError::NoEndpoints),
        }
    }
}

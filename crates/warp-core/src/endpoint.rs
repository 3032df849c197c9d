//! Endpoints and the candidate pool
//!
//! An [`Endpoint`] is a concrete IP + UDP port. A user-supplied endpoint
//! may also name a host ([`EndpointSpec::Named`]); it is resolved when the
//! tunnel is dispatched, not when options are validated.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// IPv4 /24 prefixes announced for the WARP edge
const WARP_V4_PREFIXES: &[[u8; 3]] = &[
    [162, 159, 192],
    [162, 159, 195],
    [188, 114, 96],
    [188, 114, 97],
    [188, 114, 98],
    [188, 114, 99],
];

/// IPv6 /64 prefixes announced for the WARP edge
const WARP_V6_PREFIXES: &[[u16; 4]] = &[
    [0x2606, 0x4700, 0x00d0, 0x0000],
    [0x2606, 0x4700, 0x00d1, 0x0000],
];

/// UDP ports the WARP edge answers WireGuard handshakes on
const WARP_PORTS: &[u16] = &[
    500, 854, 859, 864, 878, 880, 890, 891, 894, 903, 908, 928, 934, 939, 942, 943, 945, 946,
    955, 968, 987, 988, 1002, 1010, 1014, 1018, 1070, 1074, 1180, 1387, 1701, 1843, 2371, 2408,
    2506, 3138, 3476, 3581, 3854, 4177, 4198, 4233, 4500, 5279, 5956, 7103, 7152, 7156, 7281,
    7559, 8319, 8742, 8854, 8886,
];

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|_| EndpointParseError(s.to_string()))
    }
}

/// A fixed endpoint as the user wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSpec {
    /// `ip:port` or `[ipv6]:port`
    Addr(Endpoint),
    /// `host:port`, resolved at dispatch time
    Named { host: String, port: u16 },
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSpec::Addr(endpoint) => write!(f, "{}", endpoint),
            EndpointSpec::Named { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for EndpointSpec {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(endpoint) = s.parse::<Endpoint>() {
            return Ok(EndpointSpec::Addr(endpoint));
        }

        let invalid = || EndpointParseError(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let valid_host = !host.is_empty()
            && host.len() <= 253
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid_host {
            return Err(invalid());
        }

        Ok(EndpointSpec::Named {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint: {0}")]
pub struct EndpointParseError(pub String);

/// Ordered pool of endpoints the scanner may probe
///
/// Order matters: it is the tie-break when two candidates measure the
/// same round-trip time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePool {
    candidates: Vec<Endpoint>,
}

impl CandidatePool {
    pub fn new(candidates: Vec<Endpoint>) -> Self {
        Self { candidates }
    }

    /// Random sample of the WARP edge, `per_family` addresses per family
    pub fn warp_default(per_family: usize) -> Self {
        Self::sample(&mut rand::thread_rng(), per_family)
    }

    /// Sample the WARP edge with the given RNG
    pub fn sample<R: Rng + ?Sized>(rng: &mut R, per_family: usize) -> Self {
        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(per_family * 2);

        for family in [random_v4 as fn(&mut R) -> Endpoint, random_v6] {
            let mut added = 0;
            // Bounded so a tiny address space cannot spin forever
            for _ in 0..per_family * 8 {
                if added == per_family {
                    break;
                }
                let endpoint = family(rng);
                if seen.insert(endpoint) {
                    candidates.push(endpoint);
                    added += 1;
                }
            }
        }

        Self { candidates }
    }

    /// One random WARP endpoint from the enabled families
    pub fn random_endpoint(ipv4: bool, ipv6: bool) -> Option<Endpoint> {
        let mut rng = rand::thread_rng();
        match (ipv4, ipv6) {
            (true, true) if rng.gen_bool(0.5) => Some(random_v6(&mut rng)),
            (true, _) => Some(random_v4(&mut rng)),
            (false, true) => Some(random_v6(&mut rng)),
            (false, false) => None,
        }
    }

    pub fn candidates(&self) -> &[Endpoint] {
        &self.candidates
    }

    /// Candidates of the enabled families, tagged with their pool index
    pub fn filtered(&self, ipv4: bool, ipv6: bool) -> Vec<(usize, Endpoint)> {
        self.candidates
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, ep)| (ep.is_ipv4() && ipv4) || (ep.is_ipv6() && ipv6))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl FromIterator<Endpoint> for CandidatePool {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

fn random_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    *WARP_PORTS.choose(rng).unwrap_or(&2408)
}

fn random_v4<R: Rng + ?Sized>(rng: &mut R) -> Endpoint {
    let [a, b, c] = WARP_V4_PREFIXES[rng.gen_range(0..WARP_V4_PREFIXES.len())];
    let host = rng.gen_range(1..=254);
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(a, b, c, host)), random_port(rng))
}

fn random_v6<R: Rng + ?Sized>(rng: &mut R) -> Endpoint {
    let [a, b, c, d] = WARP_V6_PREFIXES[rng.gen_range(0..WARP_V6_PREFIXES.len())];
    let iid = rng.next_u64();
    let addr = Ipv6Addr::new(
        a,
        b,
        c,
        d,
        (iid >> 48) as u16,
        (iid >> 32) as u16,
        (iid >> 16) as u16,
        iid as u16,
    );
    Endpoint::new(IpAddr::V6(addr), random_port(rng))
}

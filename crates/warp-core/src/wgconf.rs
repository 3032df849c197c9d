//! wg-quick style configuration files
//!
//! Used instead of the identity cache when the run is given an existing
//! WireGuard config. Only the keys the tunnel needs are read; anything else
//! (`AllowedIPs`, `MTU`, `PersistentKeepalive`, ...) is skipped.

use crate::endpoint::EndpointSpec;
use crate::identity::{AccountBinding, CacheError, Identity};
use crate::keys::{KeyPair, PrivateKey, PublicKey};
use std::net::IpAddr;
use std::path::Path;

/// Parsed `[Interface]` + first `[Peer]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgQuickConfig {
    pub private_key: PrivateKey,
    pub addresses: Vec<String>,
    pub dns: Vec<IpAddr>,
    pub peer_public_key: PublicKey,
    pub endpoint: Option<EndpointSpec>,
    pub reserved: [u8; 3],
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
    Other,
}

impl WgQuickConfig {
    pub fn from_file(path: &Path) -> Result<Self, CacheError> {
        let content = std::fs::read_to_string(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CacheError> {
        let mut section = Section::None;
        let mut peers_seen = 0usize;

        let mut private_key = None;
        let mut addresses = Vec::new();
        let mut dns = Vec::new();
        let mut peer_public_key = None;
        let mut endpoint = None;
        let mut reserved = [0u8; 3];

        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = match line[1..line.len() - 1].trim().to_ascii_lowercase().as_str() {
                    "interface" => Section::Interface,
                    "peer" => {
                        peers_seen += 1;
                        Section::Peer
                    }
                    _ => Section::Other,
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(invalid(lineno, "expected key = value"));
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match (section, key.as_str()) {
                (Section::Interface, "privatekey") => {
                    private_key = Some(
                        PrivateKey::from_base64(value).map_err(|e| invalid(lineno, &e.to_string()))?,
                    );
                }
                (Section::Interface, "address") => {
                    addresses.extend(list(value).map(str::to_string));
                }
                (Section::Interface, "dns") => {
                    for item in list(value) {
                        // search domains are allowed alongside resolvers
                        if let Ok(ip) = item.parse() {
                            dns.push(ip);
                        }
                    }
                }
                // only the first peer is used
                (Section::Peer, _) if peers_seen > 1 => {}
                (Section::Peer, "publickey") => {
                    peer_public_key = Some(
                        PublicKey::from_base64(value).map_err(|e| invalid(lineno, &e.to_string()))?,
                    );
                }
                (Section::Peer, "endpoint") => {
                    endpoint = Some(
                        value
                            .parse::<EndpointSpec>()
                            .map_err(|e| invalid(lineno, &e.to_string()))?,
                    );
                }
                (Section::Peer, "reserved") => {
                    reserved = parse_reserved(value).ok_or_else(|| {
                        invalid(lineno, "reserved must be three comma separated bytes")
                    })?;
                }
                (Section::None, _) => return Err(invalid(lineno, "key outside of a section")),
                _ => {}
            }
        }

        let private_key =
            private_key.ok_or_else(|| CacheError::WgConf("missing Interface.PrivateKey".into()))?;
        let peer_public_key =
            peer_public_key.ok_or_else(|| CacheError::WgConf("missing Peer.PublicKey".into()))?;

        Ok(Self {
            private_key,
            addresses,
            dns,
            peer_public_key,
            endpoint,
            reserved,
        })
    }

    /// Identity for a config that was never registered through the API
    pub fn to_identity(&self) -> Identity {
        let (v4, v6): (Vec<&String>, Vec<&String>) =
            self.addresses.iter().partition(|a| !a.contains(':'));

        Identity {
            keys: KeyPair::from_private(self.private_key.clone()),
            account: AccountBinding {
                account_id: String::new(),
                token: String::new(),
                license: String::new(),
                account_license: String::new(),
                account_type: String::new(),
                peer_public_key: self.peer_public_key,
                reserved: self.reserved,
                interface_v4: v4.first().map(|s| strip_prefix_len(s)).unwrap_or_default(),
                interface_v6: v6.first().map(|s| strip_prefix_len(s)).unwrap_or_default(),
            },
            registered_at: 0,
        }
    }
}

impl Identity {
    /// Identity and peer endpoint from a wg-quick config file
    pub fn from_wg_conf(path: &Path) -> Result<(Identity, Option<EndpointSpec>), CacheError> {
        let conf = WgQuickConfig::from_file(path)?;
        Ok((conf.to_identity(), conf.endpoint))
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_reserved(value: &str) -> Option<[u8; 3]> {
    let bytes = list(value)
        .map(|b| b.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    bytes.try_into().ok()
}

fn strip_prefix_len(address: &str) -> String {
    address.split('/').next().unwrap_or(address).to_string()
}

fn invalid(lineno: usize, message: &str) -> CacheError {
    CacheError::WgConf(format!("line {}: {}", lineno + 1, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(private: &str, public: &str) -> String {
        format!(
            "# exported profile\n\
             [Interface]\n\
             PrivateKey = {private}\n\
             Address = 172.16.0.2/32, 2606:4700:110:8a36::2/128\n\
             DNS = 1.1.1.1, 1.0.0.1, example.internal\n\
             MTU = 1280\n\
             \n\
             [Peer]\n\
             PublicKey = {public}\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             Endpoint = engage.cloudflareclient.com:2408\n\
             Reserved = 12, 34, 56\n"
        )
    }

    #[test]
    fn test_parse_full_config() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let text = sample(&local.private.to_base64(), &peer.public.to_base64());

        let config = WgQuickConfig::parse(&text).unwrap();
        assert_eq!(config.private_key, local.private);
        assert_eq!(config.peer_public_key, peer.public);
        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.dns.len(), 2);
        assert_eq!(config.reserved, [12, 34, 56]);
        assert_eq!(
            config.endpoint,
            Some("engage.cloudflareclient.com:2408".parse().unwrap())
        );

        let identity = config.to_identity();
        assert_eq!(identity.keys, local);
        assert_eq!(identity.account.interface_v4, "172.16.0.2");
        assert_eq!(identity.account.interface_v6, "2606:4700:110:8a36::2");
        assert_eq!(identity.account.reserved, [12, 34, 56]);
    }

    #[test]
    fn test_from_wg_conf_file() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, sample(&local.private.to_base64(), &peer.public.to_base64())).unwrap();

        let (identity, endpoint) = Identity::from_wg_conf(&path).unwrap();
        assert_eq!(identity.account.peer_public_key, peer.public);
        assert_eq!(identity.registered_at, 0);
        assert!(endpoint.is_some());

        assert!(Identity::from_wg_conf(&dir.path().join("missing.conf")).is_err());
    }

    #[test]
    fn test_missing_peer_key() {
        let local = KeyPair::generate();
        let text = format!("[Interface]\nPrivateKey = {}\n", local.private.to_base64());

        let err = WgQuickConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("Peer.PublicKey"));
    }

    #[test]
    fn test_bad_reserved() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let text = sample(&local.private.to_base64(), &peer.public.to_base64())
            .replace("12, 34, 56", "1, 2");

        assert!(WgQuickConfig::parse(&text).is_err());
    }

    #[test]
    fn test_key_outside_section() {
        assert!(WgQuickConfig::parse("PrivateKey = abc\n").is_err());
    }
}

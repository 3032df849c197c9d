//! [`Registrar`] backed by the WARP registration API

use crate::identity::{AccountBinding, Registrar, RegistrationError};
use crate::keys::PublicKey;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};
use warp_net::{ApiClient, Device};

#[async_trait]
impl Registrar for ApiClient {
    async fn register(
        &self,
        public_key: &PublicKey,
        license: &str,
    ) -> Result<AccountBinding, RegistrationError> {
        let device = ApiClient::register(self, &public_key.to_base64()).await?;
        let mut binding = binding_from_device(&device, license)?;

        if !license.is_empty() && license != device.account.license {
            let account = self.update_license(&device.id, &device.token, license).await?;
            info!("License applied, account type: {}", account.account_type);
            binding.account_license = license.to_string();
            binding.account_type = account.account_type;
        }

        Ok(binding)
    }
}

/// Extract what the tunnel needs from a registration response
///
/// `license` is the license the caller registered for. The API assigns
/// every account a key of its own, anonymous ones included; that key is
/// kept in `account_license`.
pub fn binding_from_device(device: &Device, license: &str) -> Result<AccountBinding, RegistrationError> {
    let peer = device
        .config
        .peers
        .first()
        .ok_or_else(|| RegistrationError::InvalidResponse("no peers in config".into()))?;

    let peer_public_key = PublicKey::from_base64(&peer.public_key)
        .map_err(|e| RegistrationError::InvalidResponse(format!("peer key: {}", e)))?;

    let reserved = reserved_from_client_id(&device.config.client_id)?;
    debug!("Client reserved bytes: {:?}", reserved);

    Ok(AccountBinding {
        account_id: device.account.id.clone(),
        token: device.token.clone(),
        license: license.to_string(),
        account_license: device.account.license.clone(),
        account_type: device.account.account_type.clone(),
        peer_public_key,
        reserved,
        interface_v4: device.config.interface.addresses.v4.clone(),
        interface_v6: device.config.interface.addresses.v6.clone(),
    })
}

/// First three bytes of the base64 client id
fn reserved_from_client_id(client_id: &str) -> Result<[u8; 3], RegistrationError> {
    let decoded = STANDARD
        .decode(client_id)
        .map_err(|e| RegistrationError::InvalidResponse(format!("client id: {}", e)))?;

    decoded
        .get(..3)
        .and_then(|b| <[u8; 3]>::try_from(b).ok())
        .ok_or_else(|| RegistrationError::InvalidResponse("client id too short".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::identity::{Identity, IdentityCache};
    use crate::keys::KeyPair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use warp_net::ApiClientConfig;

    fn device_json(client_id: &str, peer_key: &str) -> String {
        format!(
            r#"{{
                "id": "dev-1",
                "token": "tok",
                "account": {{"id": "acc-1", "account_type": "free", "license": "SRV-GENERATED-KEY", "warp_plus": false}},
                "config": {{
                    "client_id": "{client_id}",
                    "interface": {{"addresses": {{"v4": "172.16.0.2", "v6": "2606:4700:110:8a36::2"}}}},
                    "peers": [{{"public_key": "{peer_key}", "endpoint": {{"host": "engage.cloudflareclient.com:2408"}}}}]
                }}
            }}"#
        )
    }

    fn anonymous_device() -> Device {
        let peer = KeyPair::generate().public;
        serde_json::from_str(&device_json(&STANDARD.encode([7u8, 8, 9, 10]), &peer.to_base64()))
            .unwrap()
    }

    /// Serves `replies` in order, one connection each, recording request heads
    async fn serve(replies: Vec<String>) -> (ApiClient, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn({
            let seen = seen.clone();
            async move {
                for body in replies {
                    let (mut socket, _) = listener.accept().await.unwrap();
                    let mut buf = [0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    seen.lock().unwrap().push(String::from_utf8_lossy(&buf[..n]).into_owned());

                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            }
        });

        let client = ApiClient::new(ApiClientConfig {
            base_url: format!("http://{}", addr),
            timeout: Duration::from_secs(5),
            ..Default::default()
        });
        (client, seen)
    }

    /// Registrar that answers every call with the same anonymous reply
    struct ReplyRegistrar {
        device: Device,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Registrar for ReplyRegistrar {
        async fn register(
            &self,
            _public_key: &PublicKey,
            license: &str,
        ) -> Result<AccountBinding, RegistrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            binding_from_device(&self.device, license)
        }
    }

    #[test]
    fn test_binding_from_device() {
        let device = anonymous_device();

        let binding = binding_from_device(&device, "").unwrap();
        assert_eq!(binding.reserved, [7, 8, 9]);
        assert_eq!(binding.account_id, "acc-1");
        assert_eq!(binding.license, "");
        assert_eq!(binding.account_license, "SRV-GENERATED-KEY");
        assert_eq!(binding.interface_v4, "172.16.0.2");
    }

    #[tokio::test]
    async fn test_anonymous_identity_registered_once() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Arc::new(ReplyRegistrar {
            device: anonymous_device(),
            calls: AtomicUsize::new(0),
        });
        let cache = IdentityCache::new(registrar.clone());
        let ctx = RunContext::new();

        let first = cache.load_or_create(dir.path(), "", &ctx).await.unwrap();
        let second = cache.load_or_create(dir.path(), "", &ctx).await.unwrap();

        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(second.account.account_license, "SRV-GENERATED-KEY");
    }

    #[tokio::test]
    async fn test_api_register_anonymous() {
        let peer = KeyPair::generate().public;
        let (client, seen) =
            serve(vec![device_json(&STANDARD.encode([1u8, 2, 3]), &peer.to_base64())]).await;
        let keys = KeyPair::generate();

        let binding = Registrar::register(&client, &keys.public, "").await.unwrap();

        assert_eq!(binding.license, "");
        assert_eq!(binding.account_license, "SRV-GENERATED-KEY");
        assert_eq!(binding.peer_public_key, peer);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("POST "));
        assert!(seen[0].contains("/reg "));
    }

    #[tokio::test]
    async fn test_api_register_applies_license() {
        let peer = KeyPair::generate().public;
        let (client, seen) = serve(vec![
            device_json(&STANDARD.encode([1u8, 2, 3]), &peer.to_base64()),
            r#"{"id": "acc-1", "account_type": "limited", "license": "USER-KEY"}"#.to_string(),
        ])
        .await;
        let keys = KeyPair::generate();

        let binding = Registrar::register(&client, &keys.public, "USER-KEY").await.unwrap();

        assert_eq!(binding.license, "USER-KEY");
        assert_eq!(binding.account_license, "USER-KEY");
        assert_eq!(binding.account_type, "limited");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].starts_with("PUT "));
        assert!(seen[1].contains("/reg/dev-1/account "));
        assert!(seen[1].to_ascii_lowercase().contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn test_licensed_identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity {
            keys: KeyPair::generate(),
            account: binding_from_device(&anonymous_device(), "USER-KEY").unwrap(),
            registered_at: 1,
        };
        IdentityCache::store(dir.path(), &identity).unwrap();

        assert_eq!(IdentityCache::load(dir.path(), "USER-KEY").unwrap(), Some(identity));
        assert_eq!(IdentityCache::load(dir.path(), "").unwrap(), None);
    }

    #[test]
    fn test_short_client_id() {
        let peer = KeyPair::generate().public;
        let device: Device =
            serde_json::from_str(&device_json(&STANDARD.encode([7u8]), &peer.to_base64())).unwrap();

        assert!(matches!(
            binding_from_device(&device, ""),
            Err(RegistrationError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_bad_peer_key() {
        let device: Device =
            serde_json::from_str(&device_json(&STANDARD.encode([1u8, 2, 3]), "not-a-key")).unwrap();
        assert!(binding_from_device(&device, "").is_err());
    }
}

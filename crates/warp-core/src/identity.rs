//! Device Identity and its on-disk cache
//!
//! An [`Identity`] is the WireGuard key pair plus the account data the
//! registration API handed back for it. It is registered once, persisted
//! under the cache directory and reused on later runs with the same
//! license.
//!
//! # Cache file
//!
//! `<cache_dir>/identity.json`, replaced atomically (write `.tmp`, then
//! rename) so a reader never sees a half-written file. A file that does
//! not parse, or that belongs to another license, counts as absent.

use crate::context::RunContext;
use crate::error::WarpError;
use crate::keys::{KeyError, KeyPair, PrivateKey, PublicKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const IDENTITY_FILE: &str = "identity.json";
const IDENTITY_VERSION: u32 = 1;

/// Account data bound to a registered key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBinding {
    pub account_id: String,
    /// Bearer token for account updates
    pub token: String,
    /// License the identity was registered for; empty for anonymous
    /// registrations. The cache is keyed on this.
    pub license: String,
    /// License key the API assigned to the account
    pub account_license: String,
    pub account_type: String,
    /// Server key to handshake with
    pub peer_public_key: PublicKey,
    /// Client id bytes carried in every handshake header
    pub reserved: [u8; 3],
    pub interface_v4: String,
    pub interface_v6: String,
}

/// Client identity, immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub keys: KeyPair,
    pub account: AccountBinding,
    /// Unix seconds; 0 when the identity came from a wg-quick config
    pub registered_at: u64,
}

impl Identity {
    pub fn license(&self) -> &str {
        &self.account.license
    }
}

/// On-disk form of [`Identity`]
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    private_key: String,
    account_id: String,
    token: String,
    license: String,
    #[serde(default)]
    account_license: String,
    account_type: String,
    peer_public_key: String,
    reserved: [u8; 3],
    interface_v4: String,
    interface_v6: String,
    registered_at: u64,
}

impl From<&Identity> for IdentityFile {
    fn from(identity: &Identity) -> Self {
        let account = &identity.account;
        Self {
            version: IDENTITY_VERSION,
            private_key: identity.keys.private.to_base64(),
            account_id: account.account_id.clone(),
            token: account.token.clone(),
            license: account.license.clone(),
            account_license: account.account_license.clone(),
            account_type: account.account_type.clone(),
            peer_public_key: account.peer_public_key.to_base64(),
            reserved: account.reserved,
            interface_v4: account.interface_v4.clone(),
            interface_v6: account.interface_v6.clone(),
            registered_at: identity.registered_at,
        }
    }
}

impl TryFrom<IdentityFile> for Identity {
    type Error = KeyError;

    fn try_from(file: IdentityFile) -> Result<Self, Self::Error> {
        Ok(Self {
            keys: KeyPair::from_private(PrivateKey::from_base64(&file.private_key)?),
            account: AccountBinding {
                account_id: file.account_id,
                token: file.token,
                license: file.license,
                account_license: file.account_license,
                account_type: file.account_type,
                peer_public_key: PublicKey::from_base64(&file.peer_public_key)?,
                reserved: file.reserved,
                interface_v4: file.interface_v4,
                interface_v6: file.interface_v6,
            },
            registered_at: file.registered_at,
        })
    }
}

/// Identity cache errors (fatal for the run)
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("{path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("invalid wireguard config: {0}")]
    WgConf(String),
}

impl CacheError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Remote registration failures (the caller may retry)
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Api(#[from] warp_net::ApiError),

    #[error("invalid registration response: {0}")]
    InvalidResponse(String),
}

impl RegistrationError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            RegistrationError::Api(e) => e.is_recoverable(),
            RegistrationError::InvalidResponse(_) => false,
        }
    }
}

/// Remote registration API
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register `public_key`, bound to `license` (empty = anonymous)
    ///
    /// The returned binding's `license` must be `license` as given, whatever
    /// key the server assigned.
    async fn register(
        &self,
        public_key: &PublicKey,
        license: &str,
    ) -> Result<AccountBinding, RegistrationError>;
}

/// Loads the cached identity or registers a new one
#[derive(Clone)]
pub struct IdentityCache {
    registrar: Arc<dyn Registrar>,
}

impl IdentityCache {
    pub fn new(registrar: Arc<dyn Registrar>) -> Self {
        Self { registrar }
    }

    /// Location of the identity file inside `cache_dir`
    pub fn path_for(cache_dir: &Path) -> PathBuf {
        cache_dir.join(IDENTITY_FILE)
    }

    /// Cached identity for `license`, registering one if needed
    pub async fn load_or_create(
        &self,
        cache_dir: &Path,
        license: &str,
        ctx: &RunContext,
    ) -> Result<Identity, WarpError> {
        if let Some(reason) = ctx.check() {
            return Err(reason.into());
        }

        prepare_dir(cache_dir)?;

        if let Some(identity) = Self::load(cache_dir, license)? {
            info!("Using cached identity ({})", identity.keys.public);
            return Ok(identity);
        }

        info!(
            "Registering new identity ({})",
            if license.is_empty() { "anonymous" } else { "licensed" }
        );

        let keys = KeyPair::generate();
        let account = ctx.run(self.registrar.register(&keys.public, license)).await??;

        let identity = Identity {
            keys,
            account,
            registered_at: unix_now(),
        };

        Self::store(cache_dir, &identity)?;
        info!("Identity registered and cached");

        Ok(identity)
    }

    /// Read the cached identity, if there is a usable one for `license`
    pub fn load(cache_dir: &Path, license: &str) -> Result<Option<Identity>, CacheError> {
        let path = Self::path_for(cache_dir);

        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                debug!("No cached identity at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let identity = serde_json::from_slice::<IdentityFile>(&content)
            .map_err(|e| e.to_string())
            .and_then(|file| Identity::try_from(file).map_err(|e| e.to_string()));

        match identity {
            Ok(identity) if identity.license() == license => Ok(Some(identity)),
            Ok(_) => {
                info!("Cached identity is bound to another license, re-registering");
                Ok(None)
            }
            Err(e) => {
                warn!("Ignoring corrupt identity cache {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Persist `identity`, replacing any previous file atomically
    pub fn store(cache_dir: &Path, identity: &Identity) -> Result<(), CacheError> {
        prepare_dir(cache_dir)?;

        let path = Self::path_for(cache_dir);
        let temp_path = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(&IdentityFile::from(identity))
            .map_err(|e| CacheError::Io { path: path.clone(), message: e.to_string() })?;

        std::fs::write(&temp_path, &json).map_err(|e| CacheError::io(&temp_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CacheError::io(&temp_path, e))?;
        }

        std::fs::rename(&temp_path, &path).map_err(|e| CacheError::io(&path, e))?;

        debug!(path = %path.display(), "Identity persisted");
        Ok(())
    }
}

fn prepare_dir(cache_dir: &Path) -> Result<(), CacheError> {
    if cache_dir.exists() && !cache_dir.is_dir() {
        return Err(CacheError::NotADirectory(cache_dir.to_path_buf()));
    }
    std::fs::create_dir_all(cache_dir).map_err(|e| CacheError::io(cache_dir, e))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::CancelReason;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Registrar that never touches the network
    #[derive(Default)]
    pub(crate) struct FakeRegistrar {
        pub calls: AtomicUsize,
        pub fail: bool,
        pub delay: Option<Duration>,
    }

    pub(crate) fn fake_account(license: &str) -> AccountBinding {
        AccountBinding {
            account_id: "acc".to_string(),
            token: "tok".to_string(),
            license: license.to_string(),
            account_license: "SRV-ASSIGNED".to_string(),
            account_type: "free".to_string(),
            peer_public_key: KeyPair::generate().public,
            reserved: [1, 2, 3],
            interface_v4: "172.16.0.2".to_string(),
            interface_v6: "2606:4700:110:8a36::2".to_string(),
        }
    }

    #[async_trait]
    impl Registrar for FakeRegistrar {
        async fn register(
            &self,
            _public_key: &PublicKey,
            license: &str,
        ) -> Result<AccountBinding, RegistrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(RegistrationError::InvalidResponse("rejected".into()));
            }
            Ok(fake_account(license))
        }
    }

    fn cache_with(registrar: &Arc<FakeRegistrar>) -> IdentityCache {
        IdentityCache::new(registrar.clone())
    }

    #[tokio::test]
    async fn test_registers_once_then_loads() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Arc::new(FakeRegistrar::default());
        let cache = cache_with(&registrar);
        let ctx = RunContext::new();

        let first = cache.load_or_create(dir.path(), "lic", &ctx).await.unwrap();
        let second = cache.load_or_create(dir.path(), "lic", &ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
        assert!(IdentityCache::path_for(dir.path()).exists());
        assert!(!IdentityCache::path_for(dir.path()).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_creates_missing_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let registrar = Arc::new(FakeRegistrar::default());

        cache_with(&registrar)
            .load_or_create(&nested, "", &RunContext::new())
            .await
            .unwrap();

        assert!(IdentityCache::path_for(&nested).exists());
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(IdentityCache::path_for(dir.path()), b"{\"version\": 1, \"priv").unwrap();

        let registrar = Arc::new(FakeRegistrar::default());
        let identity = cache_with(&registrar)
            .load_or_create(dir.path(), "", &RunContext::new())
            .await
            .unwrap();

        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(IdentityCache::load(dir.path(), "").unwrap(), Some(identity));
    }

    #[tokio::test]
    async fn test_license_change_reregisters() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Arc::new(FakeRegistrar::default());
        let cache = cache_with(&registrar);
        let ctx = RunContext::new();

        let anonymous = cache.load_or_create(dir.path(), "", &ctx).await.unwrap();
        let licensed = cache.load_or_create(dir.path(), "new-license", &ctx).await.unwrap();

        assert_ne!(anonymous, licensed);
        assert_eq!(licensed.license(), "new-license");
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let registrar = Arc::new(FakeRegistrar::default());
        let err = cache_with(&registrar)
            .load_or_create(&file, "", &RunContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cache);
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Arc::new(FakeRegistrar { fail: true, ..Default::default() });

        let err = cache_with(&registrar)
            .load_or_create(dir.path(), "", &RunContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Registration);
        assert!(!IdentityCache::path_for(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_deadline_mid_registration() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Arc::new(FakeRegistrar {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let ctx = RunContext::with_timeout(Duration::from_millis(50));

        let err = cache_with(&registrar)
            .load_or_create(dir.path(), "", &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, WarpError::Cancelled(CancelReason::DeadlineExceeded)));
        assert!(!IdentityCache::path_for(dir.path()).exists());
    }
}

//! Session acquisition, verification and persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::api::Api;
use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

/// Opaque session token set for the remote service.
///
/// Unknown fields are preserved so that a credential written by a newer
/// tool version survives a load/save cycle here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub sessdata: String,
    #[serde(default)]
    pub bili_jct: String,
    #[serde(default)]
    pub buvid3: String,
    #[serde(default)]
    pub dedeuserid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Credential {
    /// True when the credential carries the session token the service
    /// requires for authenticated calls.
    pub fn is_usable(&self) -> bool {
        !self.sessdata.is_empty()
    }

    /// Render the token set as a Cookie header value.
    pub fn cookie_header(&self) -> String {
        let mut parts = Vec::new();
        if !self.sessdata.is_empty() {
            parts.push(format!("SESSDATA={}", self.sessdata));
        }
        if !self.bili_jct.is_empty() {
            parts.push(format!("bili_jct={}", self.bili_jct));
        }
        if !self.buvid3.is_empty() {
            parts.push(format!("buvid3={}", self.buvid3));
        }
        if !self.dedeuserid.is_empty() {
            parts.push(format!("DedeUserID={}", self.dedeuserid));
        }
        parts.join("; ")
    }
}

/// Out-of-band interactive authentication, delegated to the outer system.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> ClientResult<Credential>;
}

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where the credential document is persisted.
    pub credential_file: PathBuf,
    /// Interactive login attempts before giving up.
    pub max_retries: u32,
    /// Base spacing between login attempts (doubles each time).
    pub retry_interval: Duration,
    /// Probe these hosts before any login attempt.
    pub check_network: bool,
    pub network_timeout: Duration,
    pub probe_hosts: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_file: PathBuf::from("config/credential.json"),
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            check_network: true,
            network_timeout: Duration::from_secs(10),
            probe_hosts: vec![
                "api.bilibili.com".to_string(),
                "passport.bilibili.com".to_string(),
                "www.bilibili.com".to_string(),
            ],
        }
    }
}

/// Obtains and maintains the authenticated session.
pub struct SessionManager {
    transport: Arc<Transport>,
    config: SessionConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl SessionManager {
    pub fn new(transport: Arc<Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            authenticator: None,
        }
    }

    /// Attach the delegated interactive login capability.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Acquire a working session.
    ///
    /// Unless `force` is set, a persisted credential is loaded and verified
    /// first. Otherwise (or when verification fails) the interactive
    /// authenticator is invoked up to `max_retries` times with exponential
    /// spacing. The winning credential is installed into the transport and
    /// persisted.
    pub async fn login(&self, force: bool) -> ClientResult<Credential> {
        if self.config.check_network {
            self.network_precheck().await?;
        }

        if !force {
            if let Some(credential) = self.load()? {
                if self.verify(&credential).await {
                    info!("persisted credential verified");
                    self.transport.set_credential(Some(credential.clone()));
                    return Ok(credential);
                }
                warn!("persisted credential rejected by remote, discarding");
                self.discard_stored();
            }
        }

        let Some(authenticator) = &self.authenticator else {
            return Err(ClientError::NoAuthenticator);
        };

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            match authenticator.authenticate().await {
                Ok(mut credential) => {
                    if self.verify(&credential).await {
                        credential.saved_at = Some(Utc::now());
                        self.save(&credential)?;
                        self.transport.set_credential(Some(credential.clone()));
                        info!("interactive login succeeded");
                        return Ok(credential);
                    }
                    warn!(attempt, "fresh credential failed verification");
                    last_error = Some(ClientError::AuthExpired);
                }
                Err(e) => {
                    warn!(attempt, "interactive login failed: {e}");
                    last_error = Some(e);
                }
            }
            if attempt < self.config.max_retries {
                let spacing = self.config.retry_interval * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(spacing).await;
            }
        }

        Err(last_error.unwrap_or(ClientError::AuthExpired))
    }

    /// Probe the session with a lightweight authenticated call.
    pub async fn verify(&self, credential: &Credential) -> bool {
        if !credential.is_usable() {
            return false;
        }
        // Install temporarily; the caller decides whether it sticks.
        let previous = self.transport.credential();
        self.transport.set_credential(Some(credential.clone()));
        let api = Api::new(Arc::clone(&self.transport));
        let verified = match api.nav().await {
            Ok(identity) if identity.is_login => {
                info!(uid = identity.mid, user = %identity.uname, "session verified");
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!("session probe failed: {e}");
                false
            }
        };
        if !verified {
            self.transport.set_credential(previous);
        }
        verified
    }

    /// Load the persisted credential document, if present and parseable.
    pub fn load(&self) -> ClientResult<Option<Credential>> {
        let path = &self.config.credential_file;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Credential>(&raw) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!("credential file unreadable, ignoring: {e}");
                Ok(None)
            }
        }
    }

    /// Atomically persist the credential with user-only permissions.
    pub fn save(&self, credential: &Credential) -> ClientResult<()> {
        let path = &self.config.credential_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(credential)?;
        std::fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "credential persisted");
        Ok(())
    }

    fn discard_stored(&self) {
        let path = &self.config.credential_file;
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("failed to remove stale credential file: {e}");
            }
        }
    }

    /// Fail fast when no probe host is reachable.
    ///
    /// A TCP connect to port 443 counts as reachable; if every raw connect
    /// fails, one HTTP round trip is attempted before declaring the network
    /// down.
    async fn network_precheck(&self) -> ClientResult<()> {
        for host in &self.config.probe_hosts {
            let connect = TcpStream::connect((host.as_str(), 443));
            match tokio::time::timeout(self.config.network_timeout, connect).await {
                Ok(Ok(_)) => {
                    debug!(host, "network precheck passed");
                    return Ok(());
                }
                Ok(Err(e)) => debug!(host, "tcp probe failed: {e}"),
                Err(_) => debug!(host, "tcp probe timed out"),
            }
        }

        for host in &self.config.probe_hosts {
            let url = format!("https://{host}/");
            match self.transport.content_length(&url).await {
                Ok(_) => {
                    debug!(host, "http probe passed");
                    return Ok(());
                }
                Err(e) => debug!(host, "http probe failed: {e}"),
            }
        }

        Err(ClientError::NetworkUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        let transport = Arc::new(Transport::new(TransportConfig::default()).unwrap());
        SessionManager::new(
            transport,
            SessionConfig {
                credential_file: dir.path().join("credential.json"),
                check_network: false,
                ..Default::default()
            },
        )
    }

    fn credential() -> Credential {
        Credential {
            sessdata: "secret-token".to_string(),
            bili_jct: "csrf".to_string(),
            buvid3: "device".to_string(),
            dedeuserid: "12345".to_string(),
            saved_at: Some(Utc::now()),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_cookie_header_skips_empty_fields() {
        let mut c = credential();
        c.buvid3.clear();
        let header = c.cookie_header();
        assert!(header.contains("SESSDATA=secret-token"));
        assert!(header.contains("DedeUserID=12345"));
        assert!(!header.contains("buvid3"));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        assert!(manager.load().unwrap().is_none());

        let credential = credential();
        manager.save(&credential).unwrap();
        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded, credential);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("credential.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_load_preserves_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("credential.json"),
            r#"{"sessdata": "s", "ac_time_value": "refresh-token"}"#,
        )
        .unwrap();

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.sessdata, "s");
        assert_eq!(loaded.extra["ac_time_value"], "refresh-token");

        manager.save(&loaded).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("credential.json")).unwrap();
        assert!(raw.contains("ac_time_value"));
    }

    #[tokio::test]
    async fn test_login_without_authenticator_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let err = manager.login(true).await.unwrap_err();
        assert!(matches!(err, ClientError::NoAuthenticator));
    }

    #[test]
    fn test_unparseable_credential_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        std::fs::write(dir.path().join("credential.json"), "not json").unwrap();
        assert!(manager.load().unwrap().is_none());
    }
}

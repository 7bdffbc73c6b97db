//! Session lifecycle: token-refreshing client, cookie persistence, probe-driven
//! state machine and the password/captcha re-login flow.

pub mod client;
pub mod cookies;
pub mod login;

pub use client::{RequestError, SiteClient, TOKEN_COOKIE};
pub use cookies::{CookieFile, CookieMap};
pub use login::{LoginEndpoints, LoginError, PasswordLogin};

use crate::config::Config;
use crate::scheduler::backoff::sleep_or_cancel;
use crate::scheduler::PageSource;
use crate::transport::{egress_ip, HttpResponse};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Session state as observed through the probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Valid,
    Expired,
    Blocked(u16),
}

impl SessionState {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => SessionState::Valid,
            300..=399 => SessionState::Expired,
            other => SessionState::Blocked(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("re-login failed {attempts} times")]
    LoginExhausted { attempts: u32 },
    #[error("session still blocked after {attempts} probes (last status {last_status:?})")]
    BlockedExhausted { attempts: u32, last_status: Option<u16> },
    #[error("session validation cancelled")]
    Cancelled,
}

/// Produces a fresh cookie set for the client it is given.
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    async fn login(&self, client: &SiteClient) -> Result<CookieMap, LoginError>;
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub probe_url: String,
    pub egress_check_url: Option<String>,
    pub max_login_attempts: u32,
    pub max_blocked_attempts: u32,
    pub blocked_backoff: Duration,
}

impl SessionPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        let egress = cfg.transport.egress_check_url.trim();
        Self {
            probe_url: cfg.session.probe_url.clone(),
            egress_check_url: (!egress.is_empty()).then(|| egress.to_string()),
            max_login_attempts: cfg.session.max_login_attempts,
            max_blocked_attempts: cfg.session.max_blocked_attempts,
            blocked_backoff: Duration::from_secs_f64(cfg.session.blocked_backoff_seconds),
        }
    }
}

#[derive(Default)]
struct Generation {
    /// The current cookie set already had its token-only retry.
    token_retry_spent: bool,
}

pub struct SessionManager {
    client: Arc<SiteClient>,
    reauth: Arc<dyn Reauthenticator>,
    cookie_file: CookieFile,
    policy: SessionPolicy,
    gate: Mutex<Generation>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        client: Arc<SiteClient>,
        reauth: Arc<dyn Reauthenticator>,
        cookie_file: CookieFile,
        policy: SessionPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            reauth,
            cookie_file,
            policy,
            gate: Mutex::new(Generation::default()),
            cancel,
        }
    }

    pub fn client(&self) -> &Arc<SiteClient> {
        &self.client
    }

    pub async fn probe(&self) -> Result<SessionState, RequestError> {
        let resp = self.client.get(&self.policy.probe_url).await?;
        Ok(SessionState::from_status(resp.status))
    }

    async fn log_egress(&self, attempt: u32) {
        let Some(url) = &self.policy.egress_check_url else {
            return;
        };
        match egress_ip(self.client.transport().as_ref(), url).await {
            Ok(ip) => warn!(%ip, attempt, "session blocked at current egress address"),
            Err(err) => warn!(%err, attempt, "could not determine egress address"),
        }
    }

    /// Probes until the session is valid, re-logging in or backing off as the
    /// probe dictates. Concurrent callers are serialized and each re-probes
    /// after acquiring the gate, so one repair serves everybody waiting.
    pub async fn ensure_valid(&self) -> Result<(), SessionError> {
        let mut generation = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            guard = self.gate.lock() => guard,
        };
        let max_logins = self.policy.max_login_attempts;
        let max_blocked = self.policy.max_blocked_attempts;
        let mut logins = 0u32;
        let mut blocked = 0u32;
        let mut last_status = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let state = match self.probe().await {
                Ok(state) => state,
                Err(err) => {
                    warn!(%err, "session probe failed");
                    SessionState::Blocked(0)
                }
            };

            match state {
                SessionState::Valid => return Ok(()),
                SessionState::Expired if !generation.token_retry_spent => {
                    generation.token_retry_spent = true;
                    info!("session probe redirected; retrying with a fresh token");
                }
                SessionState::Expired => {
                    if logins >= max_logins {
                        error!(attempts = logins, "re-login attempts exhausted");
                        return Err(SessionError::LoginExhausted { attempts: logins });
                    }
                    logins += 1;
                    info!(attempt = logins, max = max_logins, "session expired; logging in");
                    self.client.replace_cookies(CookieMap::new());
                    match self.reauth.login(&self.client).await {
                        Ok(cookies) => {
                            generation.token_retry_spent = false;
                            self.client.replace_cookies(cookies.clone());
                            if let Err(err) = self.cookie_file.save(&cookies).await {
                                warn!(?err, path = %self.cookie_file.path().display(), "failed to persist session cookies");
                            }
                            info!(attempt = logins, cookies = cookies.len(), "re-login succeeded");
                        }
                        Err(err) => warn!(%err, attempt = logins, max = max_logins, "re-login failed"),
                    }
                }
                SessionState::Blocked(status) => {
                    blocked += 1;
                    if status != 0 {
                        last_status = Some(status);
                    }
                    if blocked >= max_blocked {
                        error!(attempts = blocked, ?last_status, "session blocked; giving up");
                        return Err(SessionError::BlockedExhausted { attempts: blocked, last_status });
                    }
                    warn!(status, attempt = blocked, max = max_blocked, "session blocked; backing off");
                    self.log_egress(blocked).await;
                    if !sleep_or_cancel(self.policy.blocked_backoff * blocked, &self.cancel).await {
                        return Err(SessionError::Cancelled);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for SessionManager {
    async fn fetch(&self, url: &str) -> Result<HttpResponse, RequestError> {
        self.client.get(url).await
    }

    async fn revalidate(&self) -> Result<(), SessionError> {
        self.ensure_valid().await
    }
}

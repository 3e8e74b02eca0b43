//! Signed-in principal as an explicit, injectable context.
//!
//! [`SessionProvider`] owns the identity round-trips and the persisted refresh
//! token; [`SessionContext`] is the cheap clone every view receives. A context
//! is created empty when the provider is built, filled by sign-in / sign-up /
//! restore, and emptied synchronously by sign-out. Anything that must not
//! outlive the session (the realtime feed) holds a [`SessionWatch`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::RecordId;
use crate::secrets::SecretVault;
use crate::store::{IdentityProvider, SignUpResponse};

const REFRESH_TOKEN_ALIAS: &str = "supabase-refresh-token";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    pub id: RecordId,
    pub email: String,
    pub company_name: Option<String>,
    pub ape_code: Option<String>,
}

/// Tokens and identity returned by the identity provider.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub principal: Principal,
}

#[derive(Debug)]
struct ActiveSession {
    epoch: u64,
    session: AuthSession,
}

#[derive(Clone)]
pub struct SessionContext {
    state: Arc<watch::Sender<Option<Arc<ActiveSession>>>>,
    epochs: Arc<AtomicU64>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            epochs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current_user(&self) -> Option<Principal> {
        self.state
            .borrow()
            .as_ref()
            .map(|active| active.session.principal.clone())
    }

    /// Route guard for every view other than sign-in and sign-up.
    pub fn require_user(&self) -> AppResult<Principal> {
        self.current_user().ok_or(AppError::Unauthenticated)
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.state
            .borrow()
            .as_ref()
            .map(|active| active.session.access_token.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Watches the session that is current right now.
    pub fn watch(&self) -> SessionWatch {
        let receiver = self.state.subscribe();
        let epoch = receiver.borrow().as_ref().map(|active| active.epoch);
        SessionWatch { receiver, epoch }
    }

    pub(crate) fn establish(&self, session: AuthSession) {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .send_replace(Some(Arc::new(ActiveSession { epoch, session })));
    }

    fn clear(&self) -> Option<AuthSession> {
        self.state
            .send_replace(None)
            .map(|active| active.session.clone())
    }
}

/// Resolves once the session it was taken from is no longer current.
pub struct SessionWatch {
    receiver: watch::Receiver<Option<Arc<ActiveSession>>>,
    epoch: Option<u64>,
}

impl SessionWatch {
    pub fn is_current(&self) -> bool {
        self.epoch.is_some()
            && self.receiver.borrow().as_ref().map(|active| active.epoch) == self.epoch
    }

    pub async fn ended(&mut self) {
        let Some(epoch) = self.epoch else {
            return;
        };
        let _ = self
            .receiver
            .wait_for(|state| state.as_ref().map(|active| active.epoch) != Some(epoch))
            .await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignUpOutcome {
    pub confirmation_required: bool,
    pub principal: Option<Principal>,
}

#[derive(Clone)]
pub struct SessionProvider {
    identity: Arc<dyn IdentityProvider>,
    vault: SecretVault,
    context: SessionContext,
}

impl SessionProvider {
    pub fn new(identity: Arc<dyn IdentityProvider>, vault: SecretVault) -> Self {
        Self::with_context(identity, vault, SessionContext::new())
    }

    pub fn with_context(
        identity: Arc<dyn IdentityProvider>,
        vault: SecretVault,
        context: SessionContext,
    ) -> Self {
        Self {
            identity,
            vault,
            context,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn current_user(&self) -> Option<Principal> {
        self.context.current_user()
    }

    pub async fn sign_in(&self, email: &str, password: &SecretString) -> AppResult<Principal> {
        let email = normalize_email(email)?;
        let session = self.identity.sign_in(&email, password).await?;
        Ok(self.adopt(session))
    }

    pub async fn sign_up(&self, email: &str, password: &SecretString) -> AppResult<SignUpOutcome> {
        let email = normalize_email(email)?;
        match self.identity.sign_up(&email, password).await? {
            SignUpResponse::Session(session) => Ok(SignUpOutcome {
                confirmation_required: false,
                principal: Some(self.adopt(session)),
            }),
            SignUpResponse::ConfirmationPending => {
                info!(target: "session", email = %email, "sign-up awaiting confirmation");
                Ok(SignUpOutcome {
                    confirmation_required: true,
                    principal: None,
                })
            }
        }
    }

    /// Clears the context before anything else so watchers stop immediately.
    pub async fn sign_out(&self) -> AppResult<()> {
        let previous = self.context.clear();
        let forgotten = self.vault.delete(REFRESH_TOKEN_ALIAS);
        if let Some(session) = previous {
            info!(target: "session", user = %session.principal.id, "signed out");
            if let Err(err) = self.identity.sign_out(&session.access_token).await {
                warn!(target: "session", ?err, "remote sign-out failed");
            }
        }
        forgotten
    }

    /// Re-establishes the persisted session, if any.
    pub async fn restore(&self) -> AppResult<Option<Principal>> {
        let Some(refresh_token) = self.vault.read_secret(REFRESH_TOKEN_ALIAS)? else {
            return Ok(None);
        };
        match self.identity.refresh(&refresh_token).await {
            Ok(session) => Ok(Some(self.adopt(session))),
            Err(AppError::Auth(message)) => {
                warn!(target: "session", %message, "stored session rejected; signing out");
                self.vault.delete(REFRESH_TOKEN_ALIAS)?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn adopt(&self, session: AuthSession) -> Principal {
        if let Some(refresh_token) = &session.refresh_token {
            if let Err(err) = self.vault.write_secret(REFRESH_TOKEN_ALIAS, refresh_token) {
                warn!(target: "session", ?err, "failed to persist session");
            }
        }
        let principal = session.principal.clone();
        info!(target: "session", user = %principal.id, "session established");
        self.context.establish(session);
        principal
    }
}

fn normalize_email(email: &str) -> AppResult<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(AppError::Auth("email is required".into()));
    }
    Ok(trimmed.to_string())
}

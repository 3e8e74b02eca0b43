use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{auth_error, SupabaseClient};
use crate::errors::AppResult;
use crate::models::RecordId;
use crate::session::{AuthSession, Principal};
use crate::store::{IdentityProvider, SignUpResponse};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

#[derive(Deserialize)]
struct AuthUser {
    id: RecordId,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<Map<String, Value>>,
}

impl TokenResponse {
    fn into_session(self, fallback_email: &str) -> AuthSession {
        let expires_at = self
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .or_else(|| {
                self.expires_in
                    .map(|secs| Utc::now() + Duration::seconds(secs))
            });
        AuthSession {
            access_token: SecretString::from(self.access_token),
            refresh_token: self.refresh_token.map(SecretString::from),
            expires_at,
            principal: self.user.into_principal(fallback_email),
        }
    }
}

impl AuthUser {
    fn into_principal(self, fallback_email: &str) -> Principal {
        let metadata_text = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                self.user_metadata
                    .as_ref()
                    .and_then(|metadata| metadata.get(*key))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
        };
        let company_name = metadata_text(&["company_name"]);
        let ape_code = metadata_text(&["APE_code", "ape_code"]);
        Principal {
            id: self.id,
            email: self
                .email
                .filter(|email| !email.is_empty())
                .unwrap_or_else(|| fallback_email.to_string()),
            company_name,
            ape_code,
        }
    }
}

impl SupabaseClient {
    async fn token_grant(
        &self,
        grant_type: &str,
        body: Value,
        fallback_email: &str,
    ) -> AppResult<AuthSession> {
        let mut url = self.endpoint(&["auth", "v1", "token"])?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let response = self
            .authorized(self.http.post(url), &self.settings.anon_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(auth_error(response).await);
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session(fallback_email))
    }
}

#[async_trait]
impl IdentityProvider for SupabaseClient {
    async fn sign_in(&self, email: &str, password: &SecretString) -> AppResult<AuthSession> {
        let session = self
            .token_grant(
                "password",
                json!({ "email": email, "password": password.expose_secret() }),
                email,
            )
            .await?;
        info!(target: "session", user = %session.principal.id, "password sign-in accepted");
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &SecretString) -> AppResult<SignUpResponse> {
        let url = self.endpoint(&["auth", "v1", "signup"])?;
        let response = self
            .authorized(self.http.post(url), &self.settings.anon_key)
            .json(&json!({ "email": email, "password": password.expose_secret() }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(auth_error(response).await);
        }

        let body: Value = response.json().await?;
        if body.get("access_token").and_then(Value::as_str).is_some() {
            let token: TokenResponse = serde_json::from_value(body)?;
            Ok(SignUpResponse::Session(token.into_session(email)))
        } else {
            debug!(target: "session", "sign-up accepted without a session");
            Ok(SignUpResponse::ConfirmationPending)
        }
    }

    async fn refresh(&self, refresh_token: &SecretString) -> AppResult<AuthSession> {
        self.token_grant(
            "refresh_token",
            json!({ "refresh_token": refresh_token.expose_secret() }),
            "",
        )
        .await
    }

    async fn sign_out(&self, access_token: &SecretString) -> AppResult<()> {
        let url = self.endpoint(&["auth", "v1", "logout"])?;
        let response = self
            .authorized(self.http.post(url), access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(auth_error(response).await);
        }
        Ok(())
    }
}

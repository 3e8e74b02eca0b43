//! Hosted backend client: PostgREST tables, GoTrue auth and the Realtime
//! socket, all behind the store seams.

mod auth;
mod realtime;
mod rest;

use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::session::SessionContext;

const USER_AGENT: &str = concat!("lead-desk/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    settings: Arc<SupabaseSettings>,
    session: SessionContext,
}

struct SupabaseSettings {
    base_url: Url,
    anon_key: SecretString,
    heartbeat_secs: u64,
}

impl SupabaseClient {
    /// `None` when the backend URL or anon key is not configured.
    pub fn maybe_new(config: &AppConfig, session: SessionContext) -> AppResult<Option<Self>> {
        match (&config.supabase_url, &config.supabase_anon_key) {
            (Some(url), Some(key)) => Self::new(
                url,
                key.clone(),
                config.realtime_heartbeat_secs,
                session,
            )
            .map(Some),
            _ => Ok(None),
        }
    }

    pub fn new(
        base_url: &str,
        anon_key: SecretString,
        heartbeat_secs: u64,
        session: SessionContext,
    ) -> AppResult<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| AppError::Config(format!("invalid SUPABASE_URL: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config("invalid SUPABASE_URL: not a base URL".into()));
        }
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            settings: Arc::new(SupabaseSettings {
                base_url,
                anon_key,
                heartbeat_secs: heartbeat_secs.max(1),
            }),
            session,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.settings.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.settings.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid SUPABASE_URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Signed-in access token, falling back to the anon key.
    fn bearer(&self) -> SecretString {
        self.session
            .access_token()
            .unwrap_or_else(|| self.settings.anon_key.clone())
    }

    fn authorized(&self, request: RequestBuilder, bearer: &SecretString) -> RequestBuilder {
        request
            .header("apikey", self.settings.anon_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
    }
}

#[derive(Deserialize)]
struct PostgrestError {
    message: Option<String>,
}

/// Turns a failed PostgREST response into `Store(message)`.
async fn store_error(response: Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<PostgrestError>(&body) {
        Ok(PostgrestError {
            message: Some(message),
        }) => AppError::Store(message),
        _ => AppError::Store(format!("request failed ({status})")),
    }
}

/// Turns a failed GoTrue response into `Auth(message)`.
async fn auth_error(response: Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body).ok().and_then(|value| {
        ["error_description", "msg", "message", "error"]
            .iter()
            .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
    });
    AppError::Auth(message.unwrap_or_else(|| format!("authentication failed ({status})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> AppResult<SupabaseClient> {
        SupabaseClient::new(
            url,
            SecretString::from("anon".to_string()),
            30,
            SessionContext::new(),
        )
    }

    #[test]
    fn joins_endpoint_segments() {
        let client = client("https://demo.supabase.co/").unwrap();
        let url = client.endpoint(&["rest", "v1", "leads"]).unwrap();
        assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/leads");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(client("not a url"), Err(AppError::Config(_))));
    }

    #[test]
    fn falls_back_to_anon_key_without_session() {
        let client = client("https://demo.supabase.co").unwrap();
        assert_eq!(client.bearer().expose_secret(), "anon");
    }
}

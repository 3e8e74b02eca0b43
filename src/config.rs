use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const PAGE_SIZE_OPTIONS: [usize; 3] = [10, 50, 100];

const DEFAULT_VAULT_SERVICE: &str = "LeadDesk";
const DEFAULT_RECENT_WINDOW_DAYS: u32 = 7;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<SecretString>,
    pub vault_service_name: String,
    pub persist_session: bool,
    pub recent_leads_window_days: u32,
    pub company_page_size: usize,
    pub realtime_heartbeat_secs: u64,
    pub export_dir: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub supabase_url: Option<String>,
    pub has_supabase_anon_key: bool,
    pub vault_service_name: String,
    pub persist_session: bool,
    pub recent_leads_window_days: u32,
    pub company_page_size: usize,
    pub realtime_heartbeat_secs: u64,
    pub export_dir: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            supabase_url: env::var("SUPABASE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            supabase_anon_key: env::var("SUPABASE_ANON_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            vault_service_name: env::var("LEAD_DESK_VAULT_SERVICE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_VAULT_SERVICE.to_string()),
            persist_session: parse_bool("PERSIST_SESSION", true),
            recent_leads_window_days: parse_u32(
                "RECENT_LEADS_WINDOW_DAYS",
                DEFAULT_RECENT_WINDOW_DAYS,
            )
            .max(1),
            company_page_size: sanitize_page_size(parse_usize(
                "COMPANY_PAGE_SIZE",
                PAGE_SIZE_OPTIONS[0],
            )),
            realtime_heartbeat_secs: parse_u64("REALTIME_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)
                .max(1),
            export_dir: env::var("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            supabase_url: self.supabase_url.clone(),
            has_supabase_anon_key: self.supabase_anon_key.is_some(),
            vault_service_name: self.vault_service_name.clone(),
            persist_session: self.persist_session,
            recent_leads_window_days: self.recent_leads_window_days,
            company_page_size: self.company_page_size,
            realtime_heartbeat_secs: self.realtime_heartbeat_secs,
            export_dir: self.export_dir.to_string_lossy().to_string(),
        }
    }
}

/// Snaps an arbitrary size to the closest offered page size.
pub fn sanitize_page_size(value: usize) -> usize {
    PAGE_SIZE_OPTIONS
        .iter()
        .copied()
        .min_by_key(|option| option.abs_diff(value))
        .unwrap_or(PAGE_SIZE_OPTIONS[0])
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

mod cli;
mod commands;
mod config;
mod errors;
mod import;
mod models;
mod secrets;
mod session;
mod store;
mod supabase;
mod views;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use commands::{
    advance_lead_status, export_leads, health, import_csv, list_companies, list_leads,
    open_recent_feed, sign_in, sign_out, sign_up, whoami, ExportReport, HealthReport,
    ImportReport, LeadListing,
};
pub use config::{sanitize_page_size, AppConfig, PublicAppConfig, PAGE_SIZE_OPTIONS};
pub use errors::{AppError, AppResult};
pub use import::{
    build_records, parse_csv, ColumnMapping, DestinationField, ImportSession, ImportSummary,
    ImportTarget, ParsedCsv,
};
pub use models::{Company, Lead, LeadStatus, RecordId, Table};
pub use secrets::SecretVault;
pub use session::{
    AuthSession, Principal, SessionContext, SessionProvider, SessionWatch, SignUpOutcome,
};
pub use store::{
    decode_row, decode_rows, ChangeFeed, Filter, IdentityProvider, MemoryStore, Order,
    QueryPage, QuerySpec, Record, RecordStore, RemoteStore, RowRange, SignUpResponse, StoreOp,
    Subscription,
};
pub use supabase::SupabaseClient;
pub use views::{
    export_leads as render_lead_export, CompanyListView, CompanyPage, LeadExport, LeadFilters,
    LeadListView, MountState, Pagination, RecentLeadsFeed, EXPORT_HEADER,
};

/// Everything a command needs, assembled once at start-up.
pub struct AppState {
    config: AppConfig,
    vault: SecretVault,
    sessions: SessionProvider,
    store: RemoteStore,
}

impl AppState {
    /// Wires the hosted backend from the environment and restores any
    /// persisted session.
    pub async fn initialize() -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        let vault = if config.persist_session {
            SecretVault::new(config.vault_service_name.clone())
        } else {
            SecretVault::in_memory()
        };

        let context = SessionContext::new();
        let client = SupabaseClient::maybe_new(&config, context.clone())?
            .ok_or_else(|| {
                AppError::Config("SUPABASE_URL and SUPABASE_ANON_KEY must be set".into())
            })?;
        let client = Arc::new(client);
        let store = RemoteStore::new(client.clone(), client.clone());
        let sessions = SessionProvider::with_context(client, vault.clone(), context);
        Self::assemble(config, vault, sessions, store).await
    }

    /// Builds state over any backend; used with [`MemoryStore`] for dry runs.
    pub async fn assemble(
        config: AppConfig,
        vault: SecretVault,
        sessions: SessionProvider,
        store: RemoteStore,
    ) -> AppResult<Self> {
        match sessions.restore().await {
            Ok(Some(user)) => info!(target: "session", user = %user.id, "restored session"),
            Ok(None) => {}
            Err(err) => warn!(target: "session", ?err, "unable to restore session"),
        }
        Ok(Self {
            config,
            vault,
            sessions,
            store,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn sessions(&self) -> &SessionProvider {
        &self.sessions
    }

    pub fn session(&self) -> &SessionContext {
        self.sessions.context()
    }

    pub fn store(&self) -> &RemoteStore {
        &self.store
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,lead_desk=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .ok();
    });
}

pub fn run() -> anyhow::Result<()> {
    cli::run()
}

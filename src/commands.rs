use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::Utc;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AppConfig, PublicAppConfig};
use crate::errors::AppResult;
use crate::import::{ImportSession, ImportSummary, ImportTarget};
use crate::models::Lead;
use crate::session::{Principal, SignUpOutcome};
use crate::views::{CompanyListView, CompanyPage, LeadFilters, LeadListView, RecentLeadsFeed};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub backend_configured: bool,
    pub signed_in_as: Option<String>,
    pub session_persisted: bool,
    pub config: PublicAppConfig,
}

impl HealthReport {
    /// Report for a process that could not reach a configured backend.
    pub fn unconfigured(config: &AppConfig) -> Self {
        Self {
            backend_configured: false,
            signed_in_as: None,
            session_persisted: config.persist_session,
            config: config.public_profile(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LeadListing {
    pub leads: Vec<Lead>,
    pub sources: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub rows: usize,
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub summary: ImportSummary,
    /// Size of the dependent list after it was reloaded.
    pub list_total: Option<usize>,
    /// Why the reload failed; the import itself still succeeded.
    pub reload_error: Option<String>,
}

pub fn health(state: &AppState) -> HealthReport {
    HealthReport {
        backend_configured: true,
        signed_in_as: state.session().current_user().map(|user| user.email),
        session_persisted: state.vault().is_persistent(),
        config: state.config().public_profile(),
    }
}

pub async fn sign_up(
    state: &AppState,
    email: &str,
    password: &SecretString,
) -> AppResult<SignUpOutcome> {
    state.sessions().sign_up(email, password).await
}

pub async fn sign_in(
    state: &AppState,
    email: &str,
    password: &SecretString,
) -> AppResult<Principal> {
    state.sessions().sign_in(email, password).await
}

pub async fn sign_out(state: &AppState) -> AppResult<()> {
    state.sessions().sign_out().await
}

pub fn whoami(state: &AppState) -> AppResult<Principal> {
    state.session().require_user()
}

pub async fn list_leads(state: &AppState, filters: &LeadFilters) -> AppResult<LeadListing> {
    let view = LeadListView::mount(state.store().clone(), state.session().clone());
    view.load(filters).await?;
    let listing = LeadListing {
        leads: view.leads(),
        sources: view.distinct_sources(),
    };
    view.unmount();
    Ok(listing)
}

/// Loads the list the user is looking at, then cycles one lead's status.
pub async fn advance_lead_status(
    state: &AppState,
    filters: &LeadFilters,
    lead_id: &str,
) -> AppResult<Lead> {
    let view = LeadListView::mount(state.store().clone(), state.session().clone());
    view.load(filters).await?;
    let lead = view.advance_status(lead_id).await;
    view.unmount();
    lead
}

pub async fn export_leads(
    state: &AppState,
    filters: &LeadFilters,
    dir: Option<&Path>,
) -> AppResult<ExportReport> {
    let view = LeadListView::mount(state.store().clone(), state.session().clone());
    view.load(filters).await?;
    let export = view.export(Utc::now().date_naive())?;
    let rows = view.leads().len();
    view.unmount();

    let dir = dir.unwrap_or(state.config().export_dir.as_path());
    fs::create_dir_all(dir)?;
    let path = dir.join(&export.file_name);
    fs::write(&path, export.contents.as_bytes())?;
    info!(path = %path.display(), rows, "exported leads");
    Ok(ExportReport { path, rows })
}

/// Runs one import session end to end and reloads the list it feeds.
pub async fn import_csv(
    state: &AppState,
    target: ImportTarget,
    file: &Path,
    mappings: &[(String, String)],
) -> AppResult<ImportReport> {
    let owner = state.session().require_user()?;
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let mut session = ImportSession::new(target);
    session.load(&file_name, BufReader::new(File::open(file)?))?;
    for (source, destination) in mappings {
        session.map(source, destination)?;
    }
    let summary = session.submit(state.store(), &owner).await?;

    // The rows are committed at this point; a failed reload only leaves the
    // dependent list stale.
    let (list_total, reload_error) = match reload_dependent_list(state, target).await {
        Ok(total) => (Some(total), None),
        Err(err) => {
            warn!(?err, "import committed but the list reload failed");
            (None, Some(err.to_string()))
        }
    };
    Ok(ImportReport {
        summary,
        list_total,
        reload_error,
    })
}

async fn reload_dependent_list(state: &AppState, target: ImportTarget) -> AppResult<usize> {
    match target {
        ImportTarget::Leads => {
            let view = LeadListView::mount(state.store().clone(), state.session().clone());
            let total = view.load(&LeadFilters::default()).await;
            view.unmount();
            total
        }
        ImportTarget::Companies => {
            let view = CompanyListView::mount(
                state.store().clone(),
                state.session().clone(),
                state.config().company_page_size,
            );
            let total = view.load().await.map(|page| page.pagination.total);
            view.unmount();
            total
        }
    }
}

pub async fn list_companies(
    state: &AppState,
    page: usize,
    page_size: Option<usize>,
) -> AppResult<CompanyPage> {
    let view = CompanyListView::mount(
        state.store().clone(),
        state.session().clone(),
        page_size.unwrap_or(state.config().company_page_size),
    );
    let mut current = view.load().await?;
    if page > 1 {
        current = view.go_to(page).await?;
    }
    view.unmount();
    Ok(current)
}

pub async fn open_recent_feed(state: &AppState) -> AppResult<RecentLeadsFeed> {
    RecentLeadsFeed::mount(
        state.store().clone(),
        state.session(),
        state.config().recent_leads_window_days,
    )
    .await
}

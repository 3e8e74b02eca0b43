use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Days, NaiveDate, NaiveTime, SecondsFormat};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::export::{export_leads, LeadExport};
use super::MountState;
use crate::errors::{AppError, AppResult};
use crate::models::{Lead, LeadStatus, Table};
use crate::session::SessionContext;
use crate::store::{decode_row, QuerySpec, Record, RemoteStore};

const SEARCH_COLUMNS: [&str; 3] = ["name", "email", "company"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadFilters {
    pub search: String,
    pub statuses: Vec<LeadStatus>,
    pub sources: Vec<String>,
    pub created_from: Option<NaiveDate>,
    /// Inclusive: the whole day is kept.
    pub created_to: Option<NaiveDate>,
}

impl LeadFilters {
    pub fn to_query(&self, owner_id: &str) -> QuerySpec {
        let mut spec = QuerySpec::owned_by(owner_id)
            .search(&SEARCH_COLUMNS, &self.search)
            .one_of("status", self.statuses.iter().map(|s| s.as_str()))
            .one_of("source", self.sources.iter().cloned());
        if let Some(from) = self.created_from {
            spec = spec.gte("created_at", start_of_day(from));
        }
        if let Some(to) = self.created_to {
            match to.checked_add_days(Days::new(1)) {
                Some(next_day) => spec = spec.lt("created_at", start_of_day(next_day)),
                None => spec = spec.lte("created_at", start_of_day(to)),
            }
        }
        spec
    }
}

fn start_of_day(date: NaiveDate) -> String {
    date.and_time(NaiveTime::MIN)
        .and_utc()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Default)]
struct LeadListState {
    leads: Vec<Lead>,
    loaded: bool,
    error: Option<String>,
}

/// Owner-scoped lead list with filters, status cycling and export.
#[derive(Clone)]
pub struct LeadListView {
    store: RemoteStore,
    session: SessionContext,
    state: Arc<Mutex<LeadListState>>,
    mount: MountState,
}

impl LeadListView {
    pub fn mount(store: RemoteStore, session: SessionContext) -> Self {
        Self {
            store,
            session,
            state: Arc::new(Mutex::new(LeadListState::default())),
            mount: MountState::mounted(),
        }
    }

    pub fn unmount(&self) {
        self.mount.unmount();
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_mounted()
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.state.lock().leads.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Replaces the loaded set. On failure the previous set stays on display.
    pub async fn load(&self, filters: &LeadFilters) -> AppResult<usize> {
        let owner = self.session.require_user()?;
        let spec = filters.to_query(owner.id.as_str());
        let result = self.store.query_as::<Lead>(Table::Leads, &spec).await;
        if !self.mount.is_mounted() {
            debug!("lead list unmounted before load finished");
            return result.map(|_| 0);
        }

        let mut state = self.state.lock();
        match result {
            Ok((leads, _)) => {
                let count = leads.len();
                state.leads = leads;
                state.loaded = true;
                state.error = None;
                Ok(count)
            }
            Err(err) => {
                warn!(?err, "failed to load leads");
                state.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Moves one lead to the next status; local state changes only after the
    /// store confirms.
    pub async fn advance_status(&self, lead_id: &str) -> AppResult<Lead> {
        let owner = self.session.require_user()?;
        let current = self
            .state
            .lock()
            .leads
            .iter()
            .find(|lead| lead.id.as_str() == lead_id)
            .map(|lead| lead.status)
            .ok_or_else(|| AppError::Store("lead not found".into()))?;
        let next = current.next();

        let mut patch = Record::new();
        patch.insert("status".into(), Value::String(next.as_str().to_string()));
        let stored = self
            .store
            .update(Table::Leads, owner.id.as_str(), lead_id, patch)
            .await;

        let stored = match stored {
            Ok(row) => row,
            Err(err) => {
                if self.mount.is_mounted() {
                    self.state.lock().error = Some(err.to_string());
                }
                return Err(err);
            }
        };
        let stored = decode_row::<Lead>(stored);
        let confirmed = stored.as_ref().map(|lead| lead.status).unwrap_or(next);

        let mut state = self.state.lock();
        match state.leads.iter_mut().find(|lead| lead.id.as_str() == lead_id) {
            Some(lead) => {
                if self.mount.is_mounted() {
                    lead.status = confirmed;
                }
                let mut updated = lead.clone();
                updated.status = confirmed;
                Ok(updated)
            }
            // A reload replaced the list while the update was in flight.
            None => stored,
        }
    }

    pub fn export(&self, today: NaiveDate) -> AppResult<LeadExport> {
        export_leads(&self.state.lock().leads, today)
    }

    /// Source labels present in the loaded set, for the source filter.
    pub fn distinct_sources(&self) -> Vec<String> {
        self.state
            .lock()
            .leads
            .iter()
            .filter_map(|lead| lead.source.clone())
            .filter(|source| !source.trim().is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use async_trait::async_trait;

    use super::*;
    use crate::store::{Filter, MemoryStore, QueryPage, RecordStore, StoreOp};

    fn leads_fixture() -> Vec<Record> {
        [
            json!({"id": "l1", "user_id": "user-1", "name": "Ada", "email": "ada@example.com", "company": "Engines", "source": "fair", "status": "new", "created_at": "2024-03-01T09:00:00Z"}),
            json!({"id": "l2", "user_id": "user-1", "name": "Grace", "email": "grace@navy.mil", "company": null, "source": "web", "status": "contacted", "created_at": "2024-03-03T23:59:00Z"}),
            json!({"id": "l3", "user_id": "user-1", "name": "Alan", "email": "alan@bletchley.uk", "company": "Ada Corp", "source": "web", "status": "converted", "created_at": "2024-03-04T08:00:00Z"}),
            json!({"id": "l4", "user_id": "user-2", "name": "Ada Twin", "email": "twin@example.com", "status": "new", "created_at": "2024-03-02T00:00:00Z"}),
        ]
        .into_iter()
        .filter_map(|value| value.as_object().cloned())
        .collect()
    }

    async fn mounted_view() -> (LeadListView, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        memory.seed(Table::Leads, leads_fixture());
        let session = crate::test_support::signed_in_context("user-1");
        let view = LeadListView::mount(RemoteStore::from_memory(memory.clone()), session);
        (view, memory)
    }

    fn ids(view: &LeadListView) -> Vec<String> {
        view.leads().iter().map(|l| l.id.to_string()).collect()
    }

    #[test]
    fn builds_inclusive_day_bounds() {
        let filters = LeadFilters {
            created_from: NaiveDate::from_ymd_opt(2024, 3, 1),
            created_to: NaiveDate::from_ymd_opt(2024, 3, 3),
            ..LeadFilters::default()
        };
        let spec = filters.to_query("user-1");
        assert!(spec.filters.contains(&Filter::Gte {
            column: "created_at".into(),
            value: "2024-03-01T00:00:00Z".into()
        }));
        assert!(spec.filters.contains(&Filter::Lt {
            column: "created_at".into(),
            value: "2024-03-04T00:00:00Z".into()
        }));
    }

    #[tokio::test]
    async fn loads_owner_scoped_newest_first() {
        let (view, _) = mounted_view().await;
        assert_eq!(view.load(&LeadFilters::default()).await.unwrap(), 3);
        assert_eq!(ids(&view), vec!["l3", "l2", "l1"]);
        assert_eq!(view.distinct_sources(), vec!["fair", "web"]);
    }

    #[tokio::test]
    async fn filters_are_conjunctive() {
        let (view, _) = mounted_view().await;
        let filters = LeadFilters {
            search: " ada ".into(),
            statuses: vec![LeadStatus::New, LeadStatus::Contacted],
            ..LeadFilters::default()
        };
        view.load(&filters).await.unwrap();
        assert_eq!(ids(&view), vec!["l1"]);

        let by_date = LeadFilters {
            created_to: NaiveDate::from_ymd_opt(2024, 3, 3),
            sources: vec!["web".into()],
            ..LeadFilters::default()
        };
        view.load(&by_date).await.unwrap();
        assert_eq!(ids(&view), vec!["l2"]);
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_rows() {
        let (view, memory) = mounted_view().await;
        view.load(&LeadFilters::default()).await.unwrap();
        memory.fail_next(StoreOp::Query, "JWT expired");
        let err = view.load(&LeadFilters::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "JWT expired");
        assert_eq!(view.leads().len(), 3);
        assert_eq!(view.error().as_deref(), Some("JWT expired"));
    }

    #[tokio::test]
    async fn advance_status_applies_only_after_confirmation() {
        let (view, memory) = mounted_view().await;
        view.load(&LeadFilters::default()).await.unwrap();

        memory.fail_next(StoreOp::Update, "permission denied");
        assert!(view.advance_status("l3").await.is_err());
        assert_eq!(view.leads()[0].status, LeadStatus::Converted);

        let updated = view.advance_status("l3").await.unwrap();
        assert_eq!(updated.status, LeadStatus::New);
        assert_eq!(memory.rows(Table::Leads)[2]["status"], json!("new"));

        let err = view.advance_status("l4").await.unwrap_err();
        assert_eq!(err.to_string(), "lead not found");
    }

    #[tokio::test]
    async fn unmounted_view_ignores_late_results() {
        let (view, _) = mounted_view().await;
        view.unmount();
        assert_eq!(view.load(&LeadFilters::default()).await.unwrap(), 0);
        assert!(view.leads().is_empty());
        assert!(!view.is_loaded());
    }

    #[tokio::test]
    async fn unmounted_view_still_reports_failed_load() {
        let (view, memory) = mounted_view().await;
        view.unmount();
        memory.fail_next(StoreOp::Query, "JWT expired");
        let err = view.load(&LeadFilters::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "JWT expired");
        assert!(view.error().is_none());
    }

    /// Empties the view's list while the update is in flight, as a concurrent
    /// reload would.
    struct ReloadingStore {
        inner: Arc<MemoryStore>,
        view: Mutex<Option<LeadListView>>,
    }

    #[async_trait]
    impl RecordStore for ReloadingStore {
        async fn query(&self, table: Table, spec: &QuerySpec) -> AppResult<QueryPage> {
            self.inner.query(table, spec).await
        }

        async fn insert(&self, table: Table, records: Vec<Record>) -> AppResult<()> {
            self.inner.insert(table, records).await
        }

        async fn update(
            &self,
            table: Table,
            owner_id: &str,
            id: &str,
            patch: Record,
        ) -> AppResult<Record> {
            let row = self.inner.update(table, owner_id, id, patch).await?;
            if let Some(view) = self.view.lock().as_ref() {
                view.state.lock().leads.clear();
            }
            Ok(row)
        }
    }

    #[tokio::test]
    async fn confirmed_update_survives_a_concurrent_reload() {
        let memory = Arc::new(MemoryStore::new());
        memory.seed(Table::Leads, leads_fixture());
        let records = Arc::new(ReloadingStore {
            inner: memory.clone(),
            view: Mutex::new(None),
        });
        let view = LeadListView::mount(
            RemoteStore::new(records.clone(), memory.clone()),
            crate::test_support::signed_in_context("user-1"),
        );
        *records.view.lock() = Some(view.clone());
        view.load(&LeadFilters::default()).await.unwrap();

        let updated = view.advance_status("l1").await.unwrap();
        assert_eq!(updated.id.as_str(), "l1");
        assert_eq!(updated.status, LeadStatus::Contacted);
        assert_eq!(memory.rows(Table::Leads)[0]["status"], json!("contacted"));
    }

    #[tokio::test]
    async fn requires_signed_in_user() {
        let memory = Arc::new(MemoryStore::new());
        let view = LeadListView::mount(RemoteStore::from_memory(memory), SessionContext::new());
        let err = view.load(&LeadFilters::default()).await.unwrap_err();
        assert!(err.requires_sign_in());
    }
}

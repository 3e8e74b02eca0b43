use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::MountState;
use crate::config::{sanitize_page_size, PAGE_SIZE_OPTIONS};
use crate::errors::AppResult;
use crate::models::{Company, Table};
use crate::session::SessionContext;
use crate::store::{QuerySpec, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl Pagination {
    pub fn new(page_size: usize) -> Self {
        Self {
            page: 1,
            page_size: sanitize_page_size(page_size),
            total: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.total.div_ceil(self.page_size)
    }

    pub fn can_previous(&self) -> bool {
        self.page > 1
    }

    pub fn can_next(&self) -> bool {
        self.page < self.page_count()
    }

    /// Zero-based inclusive row window for the current page.
    pub fn row_window(&self) -> (usize, usize) {
        let from = self.page.saturating_sub(1).saturating_mul(self.page_size);
        (from, from + self.page_size - 1)
    }

    /// One-based "from..=to of total" for display; `None` when empty.
    pub fn display_range(&self) -> Option<(usize, usize)> {
        if self.total == 0 {
            return None;
        }
        let (from, to) = self.row_window();
        Some((from + 1, (to + 1).min(self.total)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyPage {
    pub companies: Vec<Company>,
    pub pagination: Pagination,
}

#[derive(Debug)]
struct CompanyListState {
    companies: Vec<Company>,
    pagination: Pagination,
    error: Option<String>,
}

/// Paged, owner-scoped company list.
#[derive(Clone)]
pub struct CompanyListView {
    store: RemoteStore,
    session: SessionContext,
    state: Arc<Mutex<CompanyListState>>,
    mount: MountState,
}

impl CompanyListView {
    pub fn mount(store: RemoteStore, session: SessionContext, page_size: usize) -> Self {
        Self {
            store,
            session,
            state: Arc::new(Mutex::new(CompanyListState {
                companies: Vec::new(),
                pagination: Pagination::new(page_size),
                error: None,
            })),
            mount: MountState::mounted(),
        }
    }

    pub fn page_size_options() -> &'static [usize] {
        &PAGE_SIZE_OPTIONS
    }

    pub fn unmount(&self) {
        self.mount.unmount();
    }

    pub fn pagination(&self) -> Pagination {
        self.state.lock().pagination
    }

    pub fn companies(&self) -> Vec<Company> {
        self.state.lock().companies.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn snapshot(&self) -> CompanyPage {
        let state = self.state.lock();
        CompanyPage {
            companies: state.companies.clone(),
            pagination: state.pagination,
        }
    }

    pub async fn load(&self) -> AppResult<CompanyPage> {
        let owner = self.session.require_user()?;
        let (from, to) = self.state.lock().pagination.row_window();
        let spec = QuerySpec::owned_by(owner.id.as_str())
            .range(from, to)
            .with_exact_count();
        let result = self.store.query_as::<Company>(Table::Companies, &spec).await;
        if !self.mount.is_mounted() {
            debug!("company list unmounted before load finished");
            return result.map(|_| self.snapshot());
        }

        match result {
            Ok((companies, total)) => {
                let mut state = self.state.lock();
                state.pagination.total = total.unwrap_or(companies.len());
                state.companies = companies;
                state.error = None;
            }
            Err(err) => {
                warn!(?err, "failed to load companies");
                self.state.lock().error = Some(err.to_string());
                return Err(err);
            }
        }
        Ok(self.snapshot())
    }

    /// Changing the page size always returns to the first page.
    pub async fn set_page_size(&self, page_size: usize) -> AppResult<CompanyPage> {
        {
            let mut state = self.state.lock();
            state.pagination.page_size = sanitize_page_size(page_size);
            state.pagination.page = 1;
        }
        self.load().await
    }

    pub async fn next_page(&self) -> AppResult<CompanyPage> {
        {
            let mut state = self.state.lock();
            if !state.pagination.can_next() {
                return Ok(CompanyPage {
                    companies: state.companies.clone(),
                    pagination: state.pagination,
                });
            }
            state.pagination.page += 1;
        }
        self.load().await
    }

    pub async fn previous_page(&self) -> AppResult<CompanyPage> {
        {
            let mut state = self.state.lock();
            if !state.pagination.can_previous() {
                return Ok(CompanyPage {
                    companies: state.companies.clone(),
                    pagination: state.pagination,
                });
            }
            state.pagination.page -= 1;
        }
        self.load().await
    }

    /// Jumps to `page`, clamped to the known page range.
    pub async fn go_to(&self, page: usize) -> AppResult<CompanyPage> {
        {
            let mut state = self.state.lock();
            let last = state.pagination.page_count().max(1);
            state.pagination.page = page.clamp(1, last);
        }
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::{MemoryStore, Record};

    fn companies(count: usize) -> Vec<Record> {
        (0..count)
            .filter_map(|i| {
                json!({
                    "id": format!("c{i:02}"),
                    "user_id": "user-1",
                    "company_name": format!("Company {i:02}"),
                    "created_at": format!("2024-01-01T00:{:02}:00Z", i),
                })
                .as_object()
                .cloned()
            })
            .collect()
    }

    fn view_with(count: usize, page_size: usize) -> CompanyListView {
        let memory = Arc::new(MemoryStore::new());
        memory.seed(Table::Companies, companies(count));
        CompanyListView::mount(
            RemoteStore::from_memory(memory),
            crate::test_support::signed_in_context("user-1"),
            page_size,
        )
    }

    #[test]
    fn pagination_bounds() {
        let mut pagination = Pagination::new(10);
        assert_eq!(pagination.page_count(), 0);
        assert!(!pagination.can_previous());
        assert!(!pagination.can_next());
        assert_eq!(pagination.display_range(), None);

        pagination.total = 25;
        assert_eq!(pagination.page_count(), 3);
        assert!(pagination.can_next());
        pagination.page = 3;
        assert!(!pagination.can_next());
        assert_eq!(pagination.row_window(), (20, 29));
        assert_eq!(pagination.display_range(), Some((21, 25)));
    }

    #[test]
    fn page_size_snaps_to_offered_sizes() {
        assert_eq!(Pagination::new(37).page_size, 50);
        assert_eq!(CompanyListView::page_size_options(), &[10, 50, 100]);
    }

    #[tokio::test]
    async fn pages_through_companies_newest_first() {
        let view = view_with(25, 10);
        let page = view.load().await.unwrap();
        assert_eq!(page.pagination.total, 25);
        assert_eq!(page.companies.len(), 10);
        assert_eq!(page.companies[0].id.as_str(), "c24");

        view.next_page().await.unwrap();
        let last = view.next_page().await.unwrap();
        assert_eq!(last.pagination.page, 3);
        assert_eq!(last.companies.len(), 5);

        let still_last = view.next_page().await.unwrap();
        assert_eq!(still_last.pagination.page, 3);

        let reset = view.set_page_size(50).await.unwrap();
        assert_eq!(reset.pagination.page, 1);
        assert_eq!(reset.companies.len(), 25);
        assert!(!reset.pagination.can_next());
    }

    #[tokio::test]
    async fn empty_list_stays_on_first_page() {
        let view = view_with(0, 10);
        let page = view.load().await.unwrap();
        assert_eq!(page.pagination.page, 1);
        assert!(page.companies.is_empty());
        assert_eq!(view.previous_page().await.unwrap().pagination.page, 1);
        assert_eq!(view.go_to(4).await.unwrap().pagination.page, 1);
    }
}

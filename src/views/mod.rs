//! Headless view models. Each view owns its loaded state behind a shared
//! handle so a request still in flight when the view unmounts lands nowhere.

mod company_list;
mod export;
mod lead_list;
mod recent_feed;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use company_list::{CompanyListView, CompanyPage, Pagination};
pub use export::{export_leads, LeadExport, EXPORT_HEADER};
pub use lead_list::{LeadFilters, LeadListView};
pub use recent_feed::RecentLeadsFeed;

/// Shared mounted flag checked before any async result is applied.
#[derive(Debug, Clone)]
pub struct MountState(Arc<AtomicBool>);

impl MountState {
    pub fn mounted() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_mounted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn unmount(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for MountState {
    fn default() -> Self {
        Self::mounted()
    }
}

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::MountState;
use crate::errors::AppResult;
use crate::models::{Lead, LeadStatus, Table};
use crate::session::{SessionContext, SessionWatch};
use crate::store::{decode_row, QuerySpec, Record, RemoteStore, Subscription};

#[derive(Debug, Default)]
struct FeedState {
    leads: Vec<Lead>,
    error: Option<String>,
}

impl FeedState {
    /// Newest first; a lead already shown is never shown twice.
    fn prepend(&mut self, lead: Lead) -> bool {
        if self.leads.iter().any(|existing| existing.id == lead.id) {
            return false;
        }
        self.leads.insert(0, lead);
        true
    }
}

/// New leads from the trailing window, kept live by an insert subscription.
///
/// The subscription belongs to a background task that stops on [`unmount`],
/// on drop, or as soon as the session it was opened under ends.
///
/// [`unmount`]: RecentLeadsFeed::unmount
pub struct RecentLeadsFeed {
    state: Arc<Mutex<FeedState>>,
    mount: MountState,
    window_days: u32,
    arrivals: watch::Receiver<u64>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RecentLeadsFeed {
    pub async fn mount(
        store: RemoteStore,
        session: &SessionContext,
        window_days: u32,
    ) -> AppResult<Self> {
        Self::mount_at(store, session, window_days, Utc::now()).await
    }

    pub async fn mount_at(
        store: RemoteStore,
        session: &SessionContext,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> AppResult<Self> {
        let owner = session.require_user()?;
        let session_watch = session.watch();
        let subscription = store
            .subscribe_inserts(Table::Leads, owner.id.as_str())
            .await?;

        let since = now - Duration::days(i64::from(window_days));
        let spec = QuerySpec::owned_by(owner.id.as_str())
            .eq("status", LeadStatus::New.as_str())
            .gte(
                "created_at",
                since.to_rfc3339_opts(SecondsFormat::Micros, true),
            );

        let mut state = FeedState::default();
        match store.query_as::<Lead>(Table::Leads, &spec).await {
            Ok((leads, _)) => state.leads = leads,
            Err(err) => {
                warn!(target: "recent_feed", ?err, "initial recent-leads query failed");
                state.error = Some(err.to_string());
            }
        }

        let state = Arc::new(Mutex::new(state));
        let mount = MountState::mounted();
        let (stop, stopped) = oneshot::channel();
        let (arrived, arrivals) = watch::channel(0);
        let task = tokio::spawn(run_feed(
            subscription,
            session_watch,
            stopped,
            state.clone(),
            mount.clone(),
            arrived,
        ));
        debug!(target: "recent_feed", owner = %owner.id, "recent-leads feed mounted");

        Ok(Self {
            state,
            mount,
            window_days,
            arrivals,
            stop: Some(stop),
            task: Some(task),
        })
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.state.lock().leads.clone()
    }

    pub fn count(&self) -> usize {
        self.state.lock().leads.len()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn empty_message(&self) -> String {
        format!("No new leads in the past {} days", self.window_days)
    }

    pub fn is_live(&self) -> bool {
        self.mount.is_mounted()
            && self
                .task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }

    /// Counter bumped once per merged arrival.
    pub fn arrivals(&self) -> watch::Receiver<u64> {
        self.arrivals.clone()
    }

    pub fn unmount(&mut self) {
        self.mount.unmount();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Unmounts and waits for the subscription to be released.
    pub async fn close(mut self) {
        self.unmount();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Resolves once the background task has released the subscription.
    pub async fn stopped(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }
}

impl Drop for RecentLeadsFeed {
    fn drop(&mut self) {
        self.unmount();
    }
}

async fn run_feed(
    mut subscription: Subscription,
    mut session: SessionWatch,
    mut stopped: oneshot::Receiver<()>,
    state: Arc<Mutex<FeedState>>,
    mount: MountState,
    arrived: watch::Sender<u64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => {
                debug!(target: "recent_feed", "feed unmounted");
                break;
            }
            _ = session.ended() => {
                info!(target: "recent_feed", "session ended; closing recent-leads subscription");
                break;
            }
            event = subscription.next() => match event {
                Some(record) => {
                    if mount.is_mounted() && merge_event(&state, &session, record) {
                        arrived.send_modify(|count| *count += 1);
                    }
                }
                None => {
                    debug!(target: "recent_feed", "insert stream ended");
                    break;
                }
            },
        }
    }
    mount.unmount();
    subscription.close();
}

/// The session is re-checked under the state lock, so an event still queued
/// when the session ends is never shown.
fn merge_event(state: &Mutex<FeedState>, session: &SessionWatch, record: Record) -> bool {
    let lead = match decode_row::<Lead>(record) {
        Ok(lead) => lead,
        Err(err) => {
            warn!(target: "recent_feed", ?err, "discarding undecodable insert event");
            return false;
        }
    };
    let mut state = state.lock();
    if !session.is_current() {
        debug!(target: "recent_feed", "dropping insert event from an ended session");
        return false;
    }
    state.prepend(lead)
}

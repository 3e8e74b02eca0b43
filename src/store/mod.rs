//! Seams over the hosted backend: table reads/writes, insert notifications
//! and identity. Views only ever talk to [`RemoteStore`].

mod memory;
mod query;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::errors::{AppError, AppResult};
use crate::models::Table;
use crate::session::AuthSession;

pub use memory::{MemoryStore, StoreOp};
pub use query::{Filter, Order, QueryPage, QuerySpec, RowRange};

/// One row as exchanged with the backend.
pub type Record = Map<String, Value>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn query(&self, table: Table, spec: &QuerySpec) -> AppResult<QueryPage>;

    /// Inserts the whole batch or nothing.
    async fn insert(&self, table: Table, records: Vec<Record>) -> AppResult<()>;

    /// Applies `patch` to the single owned row `id` and returns the stored row.
    async fn update(&self, table: Table, owner_id: &str, id: &str, patch: Record)
        -> AppResult<Record>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe_inserts(&self, table: Table, owner_id: &str) -> AppResult<Subscription>;
}

#[derive(Debug, Clone)]
pub enum SignUpResponse {
    Session(AuthSession),
    ConfirmationPending,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &SecretString) -> AppResult<AuthSession>;
    async fn sign_up(&self, email: &str, password: &SecretString) -> AppResult<SignUpResponse>;
    async fn refresh(&self, refresh_token: &SecretString) -> AppResult<AuthSession>;
    async fn sign_out(&self, access_token: &SecretString) -> AppResult<()>;
}

/// Stream of inserted rows for one table and owner.
///
/// The producer side stops as soon as [`Subscription::close`] runs or the
/// subscription is dropped.
pub struct Subscription {
    events: mpsc::Receiver<Record>,
    close: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<Record>, close: oneshot::Sender<()>) -> Self {
        Self {
            events,
            close: Some(close),
        }
    }

    pub async fn next(&mut self) -> Option<Record> {
        if self.close.is_none() {
            return None;
        }
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        self.events.close();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable handle handed to every view.
#[derive(Clone)]
pub struct RemoteStore {
    records: Arc<dyn RecordStore>,
    changes: Arc<dyn ChangeFeed>,
}

impl RemoteStore {
    pub fn new(records: Arc<dyn RecordStore>, changes: Arc<dyn ChangeFeed>) -> Self {
        Self { records, changes }
    }

    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            records: store.clone(),
            changes: store,
        }
    }

    pub async fn query(&self, table: Table, spec: &QuerySpec) -> AppResult<QueryPage> {
        self.records.query(table, spec).await
    }

    pub async fn query_as<T: DeserializeOwned>(
        &self,
        table: Table,
        spec: &QuerySpec,
    ) -> AppResult<(Vec<T>, Option<usize>)> {
        let page = self.query(table, spec).await?;
        let rows = decode_rows(page.rows)?;
        Ok((rows, page.total))
    }

    pub async fn insert(&self, table: Table, records: Vec<Record>) -> AppResult<()> {
        self.records.insert(table, records).await
    }

    pub async fn update(
        &self,
        table: Table,
        owner_id: &str,
        id: &str,
        patch: Record,
    ) -> AppResult<Record> {
        self.records.update(table, owner_id, id, patch).await
    }

    pub async fn subscribe_inserts(&self, table: Table, owner_id: &str) -> AppResult<Subscription> {
        self.changes.subscribe_inserts(table, owner_id).await
    }
}

pub fn decode_row<T: DeserializeOwned>(row: Record) -> AppResult<T> {
    serde_json::from_value(Value::Object(row)).map_err(AppError::from)
}

pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Record>) -> AppResult<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

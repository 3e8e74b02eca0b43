use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::query::value_as_text;
use super::{
    ChangeFeed, Filter, IdentityProvider, QueryPage, QuerySpec, Record, RecordStore,
    SignUpResponse, Subscription,
};
use crate::errors::{AppError, AppResult};
use crate::models::{RecordId, Table};
use crate::session::{AuthSession, Principal};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Query,
    Insert,
    Update,
    Subscribe,
    SignIn,
}

/// In-process stand-in for the hosted backend, evaluating the same filter
/// semantics locally. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Vec<Record>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    users: Mutex<HashMap<String, MemoryUser>>,
    refresh_tokens: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<StoreOp, String>>,
    confirm_signups: bool,
    sequence: AtomicU64,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

struct Subscriber {
    table: Table,
    owner_id: String,
    sender: mpsc::Sender<Record>,
}

#[derive(Clone)]
struct MemoryUser {
    principal: Principal,
    password: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign-ups answer "check your inbox" instead of a session.
    pub fn requiring_confirmation() -> Self {
        Self {
            confirm_signups: true,
            ..Self::default()
        }
    }

    pub fn seed(&self, table: Table, rows: Vec<Record>) {
        let mut tables = self.tables.lock();
        let entries = tables.entry(table).or_default();
        for row in rows {
            entries.push(self.complete_row(row));
        }
    }

    pub fn register_user(&self, principal: Principal, password: &str) {
        self.users.lock().insert(
            principal.email.to_ascii_lowercase(),
            MemoryUser {
                principal,
                password: password.to_string(),
            },
        );
    }

    pub fn rows(&self, table: Table) -> Vec<Record> {
        self.tables.lock().get(&table).cloned().unwrap_or_default()
    }

    pub fn fail_next(&self, op: StoreOp, message: impl Into<String>) {
        self.failures.lock().insert(op, message.into());
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| !sub.sender.is_closed());
        subscribers.len()
    }

    fn enter(&self, op: StoreOp) -> AppResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        match self.failures.lock().remove(&op) {
            Some(message) if op == StoreOp::SignIn => Err(AppError::Auth(message)),
            Some(message) => Err(AppError::Store(message)),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    fn complete_row(&self, mut row: Record) -> Record {
        if !row.contains_key("id") {
            row.insert("id".into(), Value::String(format!("mem-{}", self.next_id())));
        }
        if !matches!(row.get("created_at"), Some(Value::String(_))) {
            row.insert(
                "created_at".into(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        row
    }

    fn broadcast(&self, table: Table, rows: &[Record]) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| !sub.sender.is_closed());
        for sub in subscribers.iter().filter(|sub| sub.table == table) {
            for row in rows
                .iter()
                .filter(|row| text_field(row, "user_id").as_deref() == Some(&sub.owner_id))
            {
                if sub.sender.try_send(row.clone()).is_err() {
                    trace!(table = %table, "dropping insert event for saturated subscriber");
                }
            }
        }
    }

    fn issue_session(&self, principal: Principal) -> AuthSession {
        let access = format!("access-{}", self.next_id());
        let refresh = format!("refresh-{}", self.next_id());
        self.refresh_tokens
            .lock()
            .insert(refresh.clone(), principal.email.to_ascii_lowercase());
        AuthSession {
            access_token: SecretString::from(access),
            refresh_token: Some(SecretString::from(refresh)),
            expires_at: None,
            principal,
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn query(&self, table: Table, spec: &QuerySpec) -> AppResult<QueryPage> {
        self.enter(StoreOp::Query)?;
        let mut rows: Vec<Record> = self
            .tables
            .lock()
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| text_field(row, "user_id").as_deref() == Some(&spec.owner_id))
                    .filter(|row| spec.filters.iter().all(|filter| matches_filter(row, filter)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            let ordering = compare_column(a, b, &spec.order.column);
            if spec.order.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let total = rows.len();
        if let Some(range) = spec.range {
            rows = rows
                .into_iter()
                .skip(range.from)
                .take(range.limit())
                .collect();
        }

        Ok(QueryPage {
            rows,
            total: spec.count_exact.then_some(total),
        })
    }

    async fn insert(&self, table: Table, records: Vec<Record>) -> AppResult<()> {
        self.enter(StoreOp::Insert)?;
        let completed: Vec<Record> = records
            .into_iter()
            .map(|row| self.complete_row(row))
            .collect();
        self.tables
            .lock()
            .entry(table)
            .or_default()
            .extend(completed.iter().cloned());
        self.broadcast(table, &completed);
        Ok(())
    }

    async fn update(
        &self,
        table: Table,
        owner_id: &str,
        id: &str,
        patch: Record,
    ) -> AppResult<Record> {
        self.enter(StoreOp::Update)?;
        let mut tables = self.tables.lock();
        let row = tables
            .get_mut(&table)
            .and_then(|rows| {
                rows.iter_mut().find(|row| {
                    text_field(row, "id").as_deref() == Some(id)
                        && text_field(row, "user_id").as_deref() == Some(owner_id)
                })
            })
            .ok_or_else(|| AppError::Store("record not found".into()))?;
        for (key, value) in patch {
            row.insert(key, value);
        }
        Ok(row.clone())
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe_inserts(&self, table: Table, owner_id: &str) -> AppResult<Subscription> {
        self.enter(StoreOp::Subscribe)?;
        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        let (close, _closed) = oneshot::channel();
        self.subscribers.lock().push(Subscriber {
            table,
            owner_id: owner_id.to_string(),
            sender,
        });
        Ok(Subscription::new(events, close))
    }
}

#[async_trait]
impl IdentityProvider for MemoryStore {
    async fn sign_in(&self, email: &str, password: &SecretString) -> AppResult<AuthSession> {
        self.enter(StoreOp::SignIn)?;
        let user = self
            .users
            .lock()
            .get(&email.trim().to_ascii_lowercase())
            .cloned()
            .filter(|user| user.password == password.expose_secret())
            .ok_or_else(|| AppError::Auth("Invalid login credentials".into()))?;
        Ok(self.issue_session(user.principal))
    }

    async fn sign_up(&self, email: &str, password: &SecretString) -> AppResult<SignUpResponse> {
        let key = email.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(AppError::Auth("Unable to validate email address".into()));
        }
        let principal = {
            let mut users = self.users.lock();
            if users.contains_key(&key) {
                return Err(AppError::Auth("User already registered".into()));
            }
            let principal = Principal {
                id: RecordId::new(format!("user-{}", self.next_id())),
                email: key.clone(),
                company_name: None,
                ape_code: None,
            };
            users.insert(
                key,
                MemoryUser {
                    principal: principal.clone(),
                    password: password.expose_secret().to_string(),
                },
            );
            principal
        };
        if self.confirm_signups {
            Ok(SignUpResponse::ConfirmationPending)
        } else {
            Ok(SignUpResponse::Session(self.issue_session(principal)))
        }
    }

    async fn refresh(&self, refresh_token: &SecretString) -> AppResult<AuthSession> {
        let email = self
            .refresh_tokens
            .lock()
            .remove(refresh_token.expose_secret())
            .ok_or_else(|| AppError::Auth("Invalid Refresh Token".into()))?;
        let user = self
            .users
            .lock()
            .get(&email)
            .cloned()
            .ok_or_else(|| AppError::Auth("User not found".into()))?;
        Ok(self.issue_session(user.principal))
    }

    async fn sign_out(&self, _access_token: &SecretString) -> AppResult<()> {
        Ok(())
    }
}

fn text_field(row: &Record, column: &str) -> Option<String> {
    row.get(column).and_then(value_as_text)
}

fn matches_filter(row: &Record, filter: &Filter) -> bool {
    match filter {
        Filter::Eq { column, value } => text_field(row, column).as_deref() == Some(value),
        Filter::In { column, values } => text_field(row, column)
            .map(|current| values.iter().any(|v| *v == current))
            .unwrap_or(false),
        Filter::Gte { column, value } => matches!(
            compare_text(text_field(row, column).as_deref(), value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Filter::Lt { column, value } => {
            compare_text(text_field(row, column).as_deref(), value) == Some(Ordering::Less)
        }
        Filter::Lte { column, value } => matches!(
            compare_text(text_field(row, column).as_deref(), value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Filter::SearchAny { columns, term } => {
            let needle = term.to_lowercase();
            columns.iter().any(|column| {
                text_field(row, column)
                    .map(|value| value.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
        }
    }
}

fn compare_text(left: Option<&str>, right: &str) -> Option<Ordering> {
    let left = left?;
    match (parse_timestamp(left), parse_timestamp(right)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => Some(left.cmp(right)),
    }
}

fn compare_column(a: &Record, b: &Record, column: &str) -> Ordering {
    match (text_field(a, column), text_field(b, column)) {
        (Some(left), Some(right)) => compare_text(Some(&left), &right).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn scopes_queries_to_owner_and_orders_newest_first() {
        let store = MemoryStore::new();
        store.seed(
            Table::Leads,
            vec![
                row(json!({"id": "a", "user_id": "u1", "name": "Old", "created_at": "2024-01-01T00:00:00Z"})),
                row(json!({"id": "b", "user_id": "u2", "name": "Other", "created_at": "2024-01-03T00:00:00Z"})),
                row(json!({"id": "c", "user_id": "u1", "name": "Fresh", "created_at": "2024-01-02T00:00:00Z"})),
            ],
        );

        let page = store
            .query(Table::Leads, &QuerySpec::owned_by("u1").with_exact_count())
            .await
            .unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| text_field(r, "id").unwrap()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(page.total, Some(2));
    }

    #[tokio::test]
    async fn broadcasts_inserts_to_matching_owner_only() {
        let store = MemoryStore::new();
        let mut mine = store.subscribe_inserts(Table::Leads, "u1").await.unwrap();
        let mut theirs = store.subscribe_inserts(Table::Leads, "u2").await.unwrap();

        store
            .insert(Table::Leads, vec![row(json!({"user_id": "u1", "name": "Ada"}))])
            .await
            .unwrap();

        let event = mine.next().await.unwrap();
        assert_eq!(text_field(&event, "name").as_deref(), Some("Ada"));
        assert!(theirs.events.try_recv().is_err());

        theirs.close();
        assert_eq!(store.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::Insert, "permission denied for table leads");
        let err = store.insert(Table::Leads, vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "permission denied for table leads");
        store.insert(Table::Leads, vec![]).await.unwrap();
        assert_eq!(store.call_count(StoreOp::Insert), 2);
    }
}

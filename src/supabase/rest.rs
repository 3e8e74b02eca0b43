use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_RANGE};
use reqwest::Url;
use tracing::debug;

use super::{store_error, SupabaseClient};
use crate::errors::{AppError, AppResult};
use crate::models::Table;
use crate::store::{Filter, QueryPage, QuerySpec, Record, RecordStore};

const RESERVED: &[char] = &[',', '(', ')', '"', '\\', ':'];

impl SupabaseClient {
    fn table_url(&self, table: Table) -> AppResult<Url> {
        self.endpoint(&["rest", "v1", table.as_str()])
    }
}

#[async_trait]
impl RecordStore for SupabaseClient {
    async fn query(&self, table: Table, spec: &QuerySpec) -> AppResult<QueryPage> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .extend_pairs(query_pairs(spec));

        let mut request = self.authorized(self.http.get(url), &self.bearer());
        if spec.count_exact {
            request = request.header("Prefer", "count=exact");
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(store_error(response).await);
        }

        let total = if spec.count_exact {
            content_range_total(response.headers())
        } else {
            None
        };
        let rows: Vec<Record> = response.json().await?;
        debug!(table = %table, rows = rows.len(), ?total, "query answered");
        Ok(QueryPage { rows, total })
    }

    async fn insert(&self, table: Table, records: Vec<Record>) -> AppResult<()> {
        let url = self.table_url(table)?;
        let response = self
            .authorized(self.http.post(url), &self.bearer())
            .header("Prefer", "return=minimal")
            .json(&records)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(store_error(response).await);
        }
        debug!(table = %table, rows = records.len(), "batch inserted");
        Ok(())
    }

    async fn update(
        &self,
        table: Table,
        owner_id: &str,
        id: &str,
        patch: Record,
    ) -> AppResult<Record> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{id}"))
            .append_pair("user_id", &format!("eq.{owner_id}"));
        let response = self
            .authorized(self.http.patch(url), &self.bearer())
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(store_error(response).await);
        }
        let rows: Vec<Record> = response.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::Store("record not found".into()))
    }
}

/// PostgREST query string for one owner-scoped read.
fn query_pairs(spec: &QuerySpec) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("select".to_string(), "*".to_string()),
        ("user_id".to_string(), format!("eq.{}", spec.owner_id)),
    ];
    for filter in &spec.filters {
        pairs.push(match filter {
            Filter::Eq { column, value } => (column.clone(), format!("eq.{value}")),
            Filter::In { column, values } => {
                let quoted: Vec<String> = values.iter().map(|v| quote_value(v)).collect();
                (column.clone(), format!("in.({})", quoted.join(",")))
            }
            Filter::Gte { column, value } => (column.clone(), format!("gte.{value}")),
            Filter::Lt { column, value } => (column.clone(), format!("lt.{value}")),
            Filter::Lte { column, value } => (column.clone(), format!("lte.{value}")),
            Filter::SearchAny { columns, term } => {
                let pattern = quote_value(&format!("*{term}*"));
                let clauses: Vec<String> = columns
                    .iter()
                    .map(|column| format!("{column}.ilike.{pattern}"))
                    .collect();
                ("or".to_string(), format!("({})", clauses.join(",")))
            }
        });
    }

    let direction = if spec.order.descending { "desc" } else { "asc" };
    pairs.push((
        "order".to_string(),
        format!("{}.{direction}", spec.order.column),
    ));
    if let Some(range) = spec.range {
        pairs.push(("offset".to_string(), range.from.to_string()));
        pairs.push(("limit".to_string(), range.limit().to_string()));
    }
    pairs
}

/// Double-quotes values PostgREST would otherwise split or misread.
fn quote_value(value: &str) -> String {
    if value.contains(RESERVED) || value.trim() != value {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

/// Total from `Content-Range: 0-9/25`; `*` means unknown.
fn content_range_total(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
}

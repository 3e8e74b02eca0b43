use serde_json::Value;

use super::Record;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
    Gte { column: String, value: String },
    Lt { column: String, value: String },
    Lte { column: String, value: String },
    /// Case-insensitive partial match, OR-ed across `columns`.
    SearchAny { columns: Vec<String>, term: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

impl Order {
    pub fn newest_first() -> Self {
        Self {
            column: "created_at".into(),
            descending: true,
        }
    }
}

/// Inclusive row window, zero based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub from: usize,
    pub to: usize,
}

impl RowRange {
    pub fn limit(&self) -> usize {
        self.to.saturating_sub(self.from) + 1
    }
}

/// Backend-neutral description of one owner-scoped read.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub owner_id: String,
    pub filters: Vec<Filter>,
    pub order: Order,
    pub range: Option<RowRange>,
    pub count_exact: bool,
}

impl QuerySpec {
    pub fn owned_by(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            filters: Vec::new(),
            order: Order::newest_first(),
            range: None,
            count_exact: false,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Eq {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// An empty value set adds no constraint.
    pub fn one_of<I, S>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.filters.push(Filter::In {
                column: column.into(),
                values,
            });
        }
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Gte {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn lt(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Lt {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn lte(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Lte {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// A blank term adds no constraint.
    pub fn search(mut self, columns: &[&str], term: &str) -> Self {
        let term = term.trim();
        if !term.is_empty() {
            self.filters.push(Filter::SearchAny {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                term: term.to_string(),
            });
        }
        self
    }

    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.range = Some(RowRange { from, to });
        self
    }

    pub fn with_exact_count(mut self) -> Self {
        self.count_exact = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub rows: Vec<Record>,
    /// Present when the query asked for an exact count.
    pub total: Option<usize>,
}

pub(crate) fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

use std::collections::HashMap;
use std::io::Read;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::models::{LeadStatus, Table};
use crate::session::Principal;
use crate::store::{Record, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DestinationField {
    pub name: &'static str,
    pub label: &'static str,
}

const fn field(name: &'static str, label: &'static str) -> DestinationField {
    DestinationField { name, label }
}

const LEAD_FIELDS: &[DestinationField] = &[
    field("name", "Name"),
    field("email", "Email"),
    field("company", "Company"),
    field("source", "Source"),
    field("status", "Status"),
    field("notes", "Notes"),
    field("ape_code", "APE Code"),
];

const COMPANY_FIELDS: &[DestinationField] = &[
    field("company_name", "Company Name"),
    field("address", "Address"),
    field("city", "City"),
    field("country", "Country (ISO2)"),
    field("siret", "SIRET"),
    field("siren", "SIREN"),
    field("registration_number", "Registration Number"),
    field("customer_email", "Customer Email"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportTarget {
    Leads,
    Companies,
}

impl ImportTarget {
    pub fn table(&self) -> Table {
        match self {
            ImportTarget::Leads => Table::Leads,
            ImportTarget::Companies => Table::Companies,
        }
    }

    pub fn fields(&self) -> &'static [DestinationField] {
        match self {
            ImportTarget::Leads => LEAD_FIELDS,
            ImportTarget::Companies => COMPANY_FIELDS,
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields().iter().any(|field| field.name == name)
    }
}

/// Header names in file order plus one header→value map per data row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
}

/// Reads comma-delimited text whose first line names the columns.
///
/// Empty lines are skipped by the reader; a row of empty cells is still a
/// row. Short rows are tolerated. When the file holds
/// no data rows the header list is reported empty so callers show
/// "0 records found" instead of an error. Repeated header names collapse to a
/// single key carrying the right-most value.
pub fn parse_csv<R: Read>(reader: R) -> AppResult<ParsedCsv> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()
        .map_err(parse_error)?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record.map_err(parse_error)?;
        let mut row = HashMap::with_capacity(headers.len());
        for (index, header) in headers.iter().enumerate() {
            row.insert(
                header.clone(),
                record.get(index).unwrap_or_default().to_string(),
            );
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Ok(ParsedCsv::default());
    }

    let mut unique_headers = Vec::with_capacity(headers.len());
    for header in headers {
        if !unique_headers.contains(&header) {
            unique_headers.push(header);
        }
    }

    Ok(ParsedCsv {
        headers: unique_headers,
        rows,
    })
}

fn parse_error(err: csv::Error) -> AppError {
    AppError::Parse(format!("Error parsing CSV: {err}"))
}

/// Source column → destination field pairs, unique on both sides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMapping {
    // (source column, destination field)
    pairs: Vec<(String, String)>,
}

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any pair sharing either side.
    pub fn assign(&mut self, source: &str, destination: &str) {
        self.pairs
            .retain(|(src, dest)| src != source && dest != destination);
        self.pairs.push((source.to_string(), destination.to_string()));
    }

    pub fn unassign(&mut self, destination: &str) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|(_, dest)| dest != destination);
        before != self.pairs.len()
    }

    pub fn source_for(&self, destination: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(_, dest)| dest == destination)
            .map(|(src, _)| src.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(src, dest)| (src.as_str(), dest.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// One insert payload per row; never fails per row.
pub fn build_records(
    rows: &[HashMap<String, String>],
    mapping: &ColumnMapping,
    owner: &Principal,
    target: ImportTarget,
) -> Vec<Record> {
    rows.iter()
        .map(|row| build_record(row, mapping, owner, target))
        .collect()
}

fn build_record(
    row: &HashMap<String, String>,
    mapping: &ColumnMapping,
    owner: &Principal,
    target: ImportTarget,
) -> Record {
    let mut record = Record::new();
    for field in target.fields() {
        let value = mapping
            .source_for(field.name)
            .and_then(|source| row.get(source))
            .filter(|value| !value.trim().is_empty());
        record.insert(
            field.name.to_string(),
            value
                .map(|value| Value::String(value.to_string()))
                .unwrap_or(Value::Null),
        );
    }

    if target == ImportTarget::Leads {
        let status = record
            .get("status")
            .and_then(Value::as_str)
            .and_then(|value| LeadStatus::parse(value).ok())
            .unwrap_or(LeadStatus::New);
        record.insert("status".into(), Value::String(status.as_str().to_string()));
    }

    record.insert(
        "user_id".into(),
        Value::String(owner.id.as_str().to_string()),
    );
    record
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub target: ImportTarget,
    pub file_name: Option<String>,
    pub row_count: usize,
}

/// Ephemeral state of one import: file, parsed rows and column mapping.
#[derive(Debug, Clone)]
pub struct ImportSession {
    target: ImportTarget,
    file_name: Option<String>,
    parsed: ParsedCsv,
    mapping: ColumnMapping,
}

impl ImportSession {
    pub fn new(target: ImportTarget) -> Self {
        Self {
            target,
            file_name: None,
            parsed: ParsedCsv::default(),
            mapping: ColumnMapping::new(),
        }
    }

    pub fn target(&self) -> ImportTarget {
        self.target
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn headers(&self) -> &[String] {
        &self.parsed.headers
    }

    pub fn record_count(&self) -> usize {
        self.parsed.rows.len()
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    /// Replaces the current file. A parse failure leaves the session untouched.
    pub fn load<R: Read>(&mut self, file_name: &str, reader: R) -> AppResult<usize> {
        let parsed = parse_csv(reader)?;
        debug!(
            file = file_name,
            headers = parsed.headers.len(),
            rows = parsed.rows.len(),
            "parsed import file"
        );
        self.file_name = Some(file_name.to_string());
        self.parsed = parsed;
        self.mapping = ColumnMapping::new();
        Ok(self.record_count())
    }

    pub fn map(&mut self, source: &str, destination: &str) -> AppResult<()> {
        if !self.target.has_field(destination) {
            return Err(AppError::Mapping(format!(
                "unknown field `{destination}` for {} import",
                self.target.table()
            )));
        }
        self.mapping.assign(source, destination);
        Ok(())
    }

    pub fn unmap(&mut self, destination: &str) -> bool {
        self.mapping.unassign(destination)
    }

    pub fn preview(&self, owner: &Principal) -> Vec<Record> {
        build_records(&self.parsed.rows, &self.mapping, owner, self.target)
    }

    /// Inserts every row as one batch and resets on success.
    pub async fn submit(
        &mut self,
        store: &RemoteStore,
        owner: &Principal,
    ) -> AppResult<ImportSummary> {
        let records = self.preview(owner);
        let summary = ImportSummary {
            target: self.target,
            file_name: self.file_name.clone(),
            row_count: records.len(),
        };
        if records.is_empty() {
            debug!(target_table = %self.target.table(), "nothing to import");
            return Ok(summary);
        }

        store.insert(self.target.table(), records).await?;
        info!(
            target_table = %self.target.table(),
            rows = summary.row_count,
            "import committed"
        );
        self.reset();
        Ok(summary)
    }

    pub fn reset(&mut self) {
        self.file_name = None;
        self.parsed = ParsedCsv::default();
        self.mapping = ColumnMapping::new();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::models::RecordId;
    use crate::store::{MemoryStore, StoreOp};

    use super::*;

    const SAMPLE_CSV: &str = "Email,Full Name\nada@example.com,Ada Lovelace\n\ngrace@example.com,  Grace Hopper \n";

    fn owner() -> Principal {
        Principal {
            id: RecordId::new("user-1"),
            email: "owner@example.com".into(),
            company_name: None,
            ape_code: None,
        }
    }

    #[test]
    fn parses_headers_and_skips_blank_lines() {
        let parsed = parse_csv(SAMPLE_CSV.as_bytes()).unwrap();
        assert_eq!(parsed.headers, vec!["Email", "Full Name"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[1]["Email"], "grace@example.com");
    }

    #[test]
    fn header_only_file_reports_nothing() {
        let parsed = parse_csv("Email,Full Name\n".as_bytes()).unwrap();
        assert!(parsed.headers.is_empty());
        assert!(parsed.rows.is_empty());
    }

    #[test]
    fn duplicate_headers_collapse_to_last_value() {
        let parsed = parse_csv("Email,Email\nfirst@x.io,second@x.io\n".as_bytes()).unwrap();
        assert_eq!(parsed.headers, vec!["Email"]);
        assert_eq!(parsed.rows[0]["Email"], "second@x.io");
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        let err = parse_csv(&b"Name\n\xff\xfe\n"[..]).unwrap_err();
        assert!(matches!(err, AppError::Parse(ref m) if m.starts_with("Error parsing CSV")));
    }

    #[test]
    fn mapping_stays_injective() {
        let mut mapping = ColumnMapping::new();
        mapping.assign("Full Name", "name");
        mapping.assign("Email", "email");
        mapping.assign("Email", "name");
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.source_for("name"), Some("Email"));
        assert_eq!(mapping.source_for("email"), None);

        mapping.assign("Full Name", "name");
        assert_eq!(mapping.source_for("name"), Some("Full Name"));
        assert!(mapping.unassign("name"));
        assert!(mapping.is_empty());
    }

    #[test]
    fn builds_lead_payloads_with_nulls_and_default_status() {
        let mut session = ImportSession::new(ImportTarget::Leads);
        assert_eq!(session.load("leads.csv", SAMPLE_CSV.as_bytes()).unwrap(), 2);
        session.map("Full Name", "name").unwrap();
        session.map("Email", "email").unwrap();

        let records = session.preview(&owner());
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record["user_id"], Value::String("user-1".into()));
            assert_eq!(record["company"], Value::Null);
            assert_eq!(record["source"], Value::Null);
            assert_eq!(record["status"], Value::String("new".into()));
        }
        assert_eq!(records[1]["name"], Value::String("  Grace Hopper ".into()));
    }

    #[test]
    fn row_of_empty_cells_yields_an_all_null_payload() {
        let mut session = ImportSession::new(ImportTarget::Companies);
        let count = session
            .load("companies.csv", "Company,City,Country
,,
Acme,Lyon,FR
".as_bytes())
            .unwrap();
        assert_eq!(count, 2);
        session.map("Company", "company_name").unwrap();
        session.map("City", "city").unwrap();
        session.map("Country", "country").unwrap();

        let records = session.preview(&owner());
        assert_eq!(records.len(), 2);
        for field in ImportTarget::Companies.fields() {
            assert_eq!(records[0][field.name], Value::Null);
        }
        assert_eq!(records[0]["user_id"], Value::String("user-1".into()));
        assert_eq!(records[1]["city"], Value::String("Lyon".into()));
    }

    #[test]
    fn normalises_mapped_status_values() {
        let mut session = ImportSession::new(ImportTarget::Leads);
        session
            .load("s.csv", "Who,State\nA,In Progress\nB,lost\nC,   \n".as_bytes())
            .unwrap();
        session.map("State", "status").unwrap();
        let statuses: Vec<_> = session
            .preview(&owner())
            .into_iter()
            .map(|r| r["status"].clone())
            .collect();
        assert_eq!(statuses, vec!["in_progress", "new", "new"]);
    }

    #[test]
    fn rejects_unknown_destination_field() {
        let mut session = ImportSession::new(ImportTarget::Companies);
        let err = session.map("Name", "name").unwrap_err();
        assert!(matches!(err, AppError::Mapping(_)));
        session.map("Name", "company_name").unwrap();
    }

    #[tokio::test]
    async fn submit_inserts_batch_and_resets() {
        let memory = Arc::new(MemoryStore::new());
        let store = RemoteStore::from_memory(memory.clone());
        let mut session = ImportSession::new(ImportTarget::Companies);
        session
            .load(
                "companies.csv",
                "Company,Country\nAcme,FR\nGlobex,  \n".as_bytes(),
            )
            .unwrap();
        session.map("Company", "company_name").unwrap();
        session.map("Country", "country").unwrap();

        let summary = session.submit(&store, &owner()).await.unwrap();
        assert_eq!(summary.row_count, 2);
        assert_eq!(session.record_count(), 0);
        assert!(session.mapping().is_empty());

        let rows = memory.rows(Table::Companies);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["country"], Value::Null);
        assert_eq!(rows[0]["siret"], Value::Null);
    }

    #[tokio::test]
    async fn failed_submit_keeps_state_and_empty_submit_skips_store() {
        let memory = Arc::new(MemoryStore::new());
        let store = RemoteStore::from_memory(memory.clone());
        let mut session = ImportSession::new(ImportTarget::Leads);

        let summary = session.submit(&store, &owner()).await.unwrap();
        assert_eq!(summary.row_count, 0);
        assert_eq!(memory.call_count(StoreOp::Insert), 0);

        session.load("leads.csv", SAMPLE_CSV.as_bytes()).unwrap();
        session.map("Email", "email").unwrap();
        memory.fail_next(StoreOp::Insert, "new row violates row-level security policy");
        let err = session.submit(&store, &owner()).await.unwrap_err();
        assert_eq!(err.to_string(), "new row violates row-level security policy");
        assert_eq!(session.record_count(), 2);
        assert_eq!(session.mapping().len(), 1);
        assert!(memory.rows(Table::Leads).is_empty());
    }
}

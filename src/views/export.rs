use chrono::NaiveDate;
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::models::Lead;

pub const EXPORT_HEADER: [&str; 7] = [
    "Name",
    "Email",
    "Company",
    "Source",
    "Status",
    "Created At",
    "Notes",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadExport {
    pub file_name: String,
    pub contents: String,
}

/// Renders `leads` as delimited text, one line per lead in the given order.
pub fn export_leads(leads: &[Lead], today: NaiveDate) -> AppResult<LeadExport> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(EXPORT_HEADER)?;
    for lead in leads {
        let created_at = lead.created_at.format(TIMESTAMP_FORMAT).to_string();
        writer.write_record([
            lead.name.as_str(),
            lead.email.as_str(),
            lead.company.as_deref().unwrap_or_default(),
            lead.source.as_deref().unwrap_or_default(),
            lead.status.as_str(),
            created_at.as_str(),
            lead.notes.as_deref().unwrap_or_default(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| AppError::Io(err.into_error()))?;
    let contents = String::from_utf8(bytes)
        .map_err(|err| AppError::Parse(format!("export produced invalid UTF-8: {err}")))?;

    Ok(LeadExport {
        file_name: format!("leads-{}.csv", today.format("%Y-%m-%d")),
        contents,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::{LeadStatus, RecordId};

    fn lead(name: &str, notes: Option<&str>) -> Lead {
        Lead {
            id: RecordId::new(name),
            name: name.into(),
            email: format!("{}@example.com", name.to_lowercase()),
            company: Some("Acme, Inc.".into()),
            source: None,
            status: LeadStatus::InProgress,
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
            user_id: RecordId::new("user-1"),
            notes: notes.map(str::to_string),
            ape_code: None,
        }
    }

    #[test]
    fn writes_fixed_header_and_one_line_per_lead() {
        let leads = vec![lead("Ada", Some("call back")), lead("Grace", None)];
        let today = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let export = export_leads(&leads, today).unwrap();

        assert_eq!(export.file_name, "leads-2024-03-06.csv");
        let lines: Vec<_> = export.contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Name,Email,Company,Source,Status,Created At,Notes");
        assert_eq!(
            lines[1],
            "Ada,ada@example.com,\"Acme, Inc.\",,in_progress,2024-03-05 14:07:09,call back"
        );
        assert!(lines[2].ends_with(",2024-03-05 14:07:09,"));
    }

    #[test]
    fn export_is_repeatable() {
        let leads = vec![lead("Ada", None)];
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            export_leads(&leads, today).unwrap(),
            export_leads(&leads, today).unwrap()
        );
        assert_eq!(export_leads(&[], today).unwrap().contents.lines().count(), 1);
    }
}

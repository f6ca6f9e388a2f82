//! Ingestion boundary: turns raw row cells into [`JobRecord`]s.

use chrono_tz::Tz;
use tracing::warn;

use crate::eta::parse_eta;
use crate::types::{FieldValue, JobPriority, JobRecord, Payload};

impl JobRecord {
    /// Build a pending record from raw ingested text.
    ///
    /// Unparseable ETA text is logged and treated as "no ETA"; it never fails
    /// the batch. Unknown priority text becomes `normal`.
    pub fn from_ingested(
        row_id: u64,
        payload: Payload,
        eta_text: Option<&str>,
        priority_text: Option<&str>,
        tz: Tz,
    ) -> Self {
        let eta = eta_text.and_then(|text| {
            let parsed = parse_eta(text, tz);
            if parsed.is_none() && !text.trim().is_empty() {
                warn!(row_id, eta = text, "Invalid ETA format, scheduling immediately");
            }
            parsed
        });
        let priority = priority_text
            .map(JobPriority::parse_lenient)
            .unwrap_or_default();

        let mut record = JobRecord::new(row_id, payload).with_priority(priority);
        record.eta = eta;
        record
    }
}

/// Split a row using the positional convention: the last two cells are the
/// ETA and the priority, everything before them is form data.
///
/// Rows with fewer than two cells have neither.
pub fn split_row(cells: &[String]) -> (&[String], Option<&str>, Option<&str>) {
    match cells.len() {
        0 | 1 => (cells, None, None),
        n => (
            &cells[..n - 2],
            Some(cells[n - 2].as_str()),
            Some(cells[n - 1].as_str()),
        ),
    }
}

/// Build records from tabular rows.
///
/// `field_ids[i]` names the form field for data cell `i`; extra cells are
/// ignored and empty cells are left out of the payload. Row ids start at 1.
pub fn records_from_rows(field_ids: &[String], rows: &[Vec<String>], tz: Tz) -> Vec<JobRecord> {
    rows.iter()
        .enumerate()
        .map(|(index, cells)| {
            let (data, eta, priority) = split_row(cells);
            let payload: Payload = field_ids
                .iter()
                .zip(data)
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(id, value)| (id.clone(), FieldValue::from(value.as_str())))
                .collect();
            JobRecord::from_ingested(index as u64 + 1, payload, eta, priority, tz)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;
    use tracing_test::traced_test;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_row_takes_last_two() {
        let row = cells(&["Alice", "alice@example.com", "2030-01-01 09:00:00", "HIGH"]);
        let (data, eta, priority) = split_row(&row);
        assert_eq!(data.len(), 2);
        assert_eq!(eta, Some("2030-01-01 09:00:00"));
        assert_eq!(priority, Some("HIGH"));

        let short = cells(&["only"]);
        assert_eq!(split_row(&short), (&short[..], None, None));
    }

    #[traced_test]
    #[test]
    fn test_bad_eta_becomes_immediate() {
        let record = JobRecord::from_ingested(
            3,
            Payload::new(),
            Some("someday"),
            Some("urgent"),
            chrono_tz::Asia::Jakarta,
        );
        assert!(record.eta.is_none());
        assert_eq!(record.priority, JobPriority::Normal);
        assert_eq!(record.status, JobStatus::Pending);
        assert!(logs_contain("Invalid ETA format"));
    }

    #[test]
    fn test_records_from_rows() {
        let fields = cells(&["entry.1", "entry.2"]);
        let rows = vec![
            cells(&["Alice", "", "", "low"]),
            cells(&["Bob", "Blue", "2030-01-01", "High"]),
        ];
        let records = records_from_rows(&fields, &rows, chrono_tz::Asia::Jakarta);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row_id, 1);
        assert_eq!(records[0].payload.len(), 1);
        assert!(records[0].eta.is_none());
        assert_eq!(records[0].priority, JobPriority::Low);
        assert_eq!(records[1].payload.len(), 2);
        assert!(records[1].eta.is_some());
        assert_eq!(records[1].priority, JobPriority::High);
    }
}

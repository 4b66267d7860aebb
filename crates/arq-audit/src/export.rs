//! Audit history exports for treasury review.
//!
//! Three formats over the same row set: spreadsheet (xlsx), CSV, and JSON.
//! The `*_bytes` functions build the document in memory (the daemon serves
//! them directly); the `write_*` functions persist to a file. Exports are
//! read-only snapshots; the store itself stays append-only.

use anyhow::{Context, Result};
use rust_xlsxwriter::{Format, Workbook};
use std::path::Path;

use crate::TaskRecord;

const HEADERS: [&str; 9] = [
    "task_id",
    "status",
    "init_time",
    "end_time",
    "duration_secs",
    "operation_number",
    "declared_total",
    "computed_sum",
    "error",
];

/// xlsx workbook with one `history` worksheet.
pub fn xlsx_bytes(records: &[TaskRecord]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet().set_name("history")?;

    let bold = Format::new().set_bold();
    for (col, header) in HEADERS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &bold)?;
    }

    for (i, rec) in records.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, &rec.task_id)?;
        sheet.write_string(row, 1, rec.status.as_str())?;
        sheet.write_string(row, 2, rec.init_time.to_rfc3339())?;
        sheet.write_string(row, 3, rec.end_time.to_rfc3339())?;
        sheet.write_number(row, 4, rec.duration_secs)?;
        sheet.write_string(row, 5, rec.assigned_operation_number.as_deref().unwrap_or(""))?;
        sheet.write_string(
            row,
            6,
            rec.declared_total.map(|c| c.to_string()).unwrap_or_default(),
        )?;
        sheet.write_string(row, 7, rec.computed_sum.to_string())?;
        sheet.write_string(row, 8, rec.error.as_deref().unwrap_or(""))?;
    }

    workbook.save_to_buffer().context("build xlsx export")
}

/// CSV with a header row.
pub fn csv_bytes(records: &[TaskRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(HEADERS).context("write csv header")?;
    for rec in records {
        writer
            .write_record([
                rec.task_id.as_str(),
                rec.status.as_str(),
                &rec.init_time.to_rfc3339(),
                &rec.end_time.to_rfc3339(),
                &rec.duration_secs.to_string(),
                rec.assigned_operation_number.as_deref().unwrap_or(""),
                &rec.declared_total.map(|c| c.to_string()).unwrap_or_default(),
                &rec.computed_sum.to_string(),
                rec.error.as_deref().unwrap_or(""),
            ])
            .context("write csv row")?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("finish csv export: {e}"))
}

/// Pretty-printed JSON array, raw payloads included.
pub fn json_bytes(records: &[TaskRecord]) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(records).context("serialize json export")
}

pub fn write_xlsx(records: &[TaskRecord], path: impl AsRef<Path>) -> Result<()> {
    write_bytes(xlsx_bytes(records)?, path)
}

pub fn write_csv(records: &[TaskRecord], path: impl AsRef<Path>) -> Result<()> {
    write_bytes(csv_bytes(records)?, path)
}

pub fn write_json(records: &[TaskRecord], path: impl AsRef<Path>) -> Result<()> {
    write_bytes(json_bytes(records)?, path)
}

fn write_bytes(bytes: Vec<u8>, path: impl AsRef<Path>) -> Result<()> {
    std::fs::write(path.as_ref(), bytes)
        .with_context(|| format!("write export {:?}", path.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload_hash;
    use arq_schemas::{Cents, OperationStatus};
    use chrono::Utc;
    use serde_json::json;

    fn sample() -> Vec<TaskRecord> {
        let now = Utc::now();
        let raw = json!({"task_id": "t-1"});
        vec![TaskRecord {
            task_id: "t-1".to_string(),
            status: OperationStatus::Completed,
            init_time: now,
            end_time: now,
            duration_secs: 2.0,
            assigned_operation_number: Some("220000001".to_string()),
            declared_total: Some(Cents(140_000)),
            computed_sum: Cents(140_000),
            error: None,
            payload_sha256: payload_hash(&raw.to_string()),
            raw_payload: raw,
            recorded_at: now,
        }]
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let text = String::from_utf8(csv_bytes(&sample()).unwrap()).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("task_id,status"));
        let row = lines.next().unwrap();
        assert!(row.contains("t-1"));
        assert!(row.contains("COMPLETED"));
        assert!(row.contains("1400.00"));
    }

    #[test]
    fn json_export_round_trips() {
        let bytes = json_bytes(&sample()).unwrap();
        let parsed: Vec<TaskRecord> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].task_id, "t-1");
        assert_eq!(parsed[0].raw_payload["task_id"], "t-1");
    }

    #[test]
    fn xlsx_export_is_nonempty_zip() {
        let bytes = xlsx_bytes(&sample()).unwrap();
        // xlsx is a zip container.
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn file_writers_persist_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        write_csv(&sample(), &path).unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }
}

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use permit_ledger_core::{
    LedgerError, LedgerResult, RawContactRecord, RecordPage, RecordSource, SourceTable,
};

/// Reads `<dir>/<source_table>.jsonl`; the cursor is a byte offset into the
/// file, so each page seeks to its start and reads at most `limit` lines.
///
/// Field values decode leniently. A line missing `source_table` (or naming an
/// unknown one) belongs to the file's table. Only lines that are not a JSON
/// object, or that carry no permit id, are skipped; they are counted in the
/// page and still advance the cursor.
#[derive(Clone, Debug)]
pub struct JsonlRecordSource {
    dir: PathBuf,
}

impl JsonlRecordSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn feed_path(&self, source_table: SourceTable) -> PathBuf {
        self.dir.join(format!("{}.jsonl", source_table.as_str()))
    }
}

fn decode_line(line: &str, source_table: SourceTable) -> Result<RawContactRecord, String> {
    let mut value: Value = serde_json::from_str(line).map_err(|err| err.to_string())?;
    let Some(object) = value.as_object_mut() else {
        return Err("not a JSON object".to_string());
    };
    let declared = object
        .get("source_table")
        .and_then(Value::as_str)
        .and_then(|table| table.parse::<SourceTable>().ok());
    if declared.is_none() {
        object.insert(
            "source_table".to_string(),
            Value::String(source_table.as_str().to_string()),
        );
    }
    serde_json::from_value(value).map_err(|err| err.to_string())
}

#[async_trait]
impl RecordSource for JsonlRecordSource {
    async fn fetch_page(
        &self,
        source_table: SourceTable,
        cursor: i64,
        limit: usize,
    ) -> LedgerResult<RecordPage> {
        let path = self.feed_path(source_table);
        let io_err = |err: std::io::Error| {
            LedgerError::storage(format!("read feed {}: {err}", path.display()))
        };
        let offset = u64::try_from(cursor)
            .map_err(|_| LedgerError::invalid(format!("negative cursor {cursor}")))?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RecordPage::end(cursor));
            }
            Err(err) => return Err(io_err(err)),
        };
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut reader = BufReader::new(file);

        let mut page = RecordPage::end(cursor);
        let mut consumed = 0u64;
        let mut buf = Vec::new();
        for _ in 0..limit.max(1) {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await.map_err(io_err)?;
            if read == 0 {
                break;
            }
            let line_start = offset + consumed;
            consumed += read as u64;
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match decode_line(line, source_table) {
                Ok(record) => page.records.push(record),
                Err(err) => {
                    page.skipped += 1;
                    log::warn!(
                        "skipping undecodable entry at byte {line_start} of {}: {err}",
                        path.display()
                    );
                }
            }
        }
        page.next_cursor = cursor + consumed as i64;
        Ok(page)
    }
}

/// In-memory feed; the cursor is an index into the table's records.
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    tables: Mutex<HashMap<SourceTable, Vec<RawContactRecord>>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = RawContactRecord>) -> Self {
        let source = Self::new();
        source.extend(records);
        source
    }

    pub fn extend(&self, records: impl IntoIterator<Item = RawContactRecord>) {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for record in records {
            tables.entry(record.source_table).or_default().push(record);
        }
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn fetch_page(
        &self,
        source_table: SourceTable,
        cursor: i64,
        limit: usize,
    ) -> LedgerResult<RecordPage> {
        let start = usize::try_from(cursor)
            .map_err(|_| LedgerError::invalid(format!("negative cursor {cursor}")))?;
        let tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let records: Vec<RawContactRecord> = tables
            .get(&source_table)
            .map(|records| {
                records
                    .iter()
                    .skip(start)
                    .take(limit.max(1))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let next_cursor = cursor + records.len() as i64;
        Ok(RecordPage::new(records, next_cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permit_ledger_core::ContactRole;
    use tempfile::tempdir;

    fn record(id: &str) -> RawContactRecord {
        RawContactRecord {
            source_table: SourceTable::Plumbing,
            source_record_id: id.to_string(),
            role: ContactRole::Contractor,
            raw_name: "Pipe Co".to_string(),
            raw_license: Some("778899".to_string()),
            address_hint: None,
        }
    }

    #[tokio::test]
    async fn memory_source_pages_by_index() {
        let source = MemoryRecordSource::with_records((0..5).map(|i| record(&format!("P-{i}"))));
        let first = source
            .fetch_page(SourceTable::Plumbing, 0, 2)
            .await
            .expect("page");
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.next_cursor, 2);
        let last = source
            .fetch_page(SourceTable::Plumbing, 4, 2)
            .await
            .expect("page");
        assert_eq!(last.records.len(), 1);
        let end = source
            .fetch_page(SourceTable::Plumbing, 5, 2)
            .await
            .expect("page");
        assert!(end.is_end(5));
        let other = source
            .fetch_page(SourceTable::Building, 0, 2)
            .await
            .expect("page");
        assert!(other.is_end(0));
    }

    #[tokio::test]
    async fn jsonl_source_keeps_loose_records_and_seeks_by_offset() {
        let dir = tempdir().expect("tempdir");
        let lines = [
            serde_json::to_string(&record("P-1")).expect("encode"),
            r#"{"source_record_id":"P-2","role":"Owner","raw_name":"Ann Lee"}"#.to_string(),
            r#"{"source_table":"plumbing","source_record_id":"P-3","role":"CONTRACTOR","raw_license":123456}"#
                .to_string(),
            "{not json".to_string(),
            "[1, 2, 3]".to_string(),
            r#"{"source_table":"plumbing","role":"engineer"}"#.to_string(),
            serde_json::to_string(&record("P-4")).expect("encode"),
        ];
        let body = format!("{}\n", lines.join("\n"));
        std::fs::write(dir.path().join("plumbing.jsonl"), &body).expect("write");
        let source = JsonlRecordSource::new(dir.path());

        let first = source
            .fetch_page(SourceTable::Plumbing, 0, 3)
            .await
            .expect("page");
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.records[1].source_table, SourceTable::Plumbing);
        assert_eq!(first.records[1].role, ContactRole::Applicant);
        assert_eq!(first.records[2].role, ContactRole::Contractor);
        assert_eq!(first.records[2].raw_license.as_deref(), Some("123456"));
        let expected: usize = lines[..3].iter().map(|line| line.len() + 1).sum();
        assert_eq!(first.next_cursor, expected as i64);

        let second = source
            .fetch_page(SourceTable::Plumbing, first.next_cursor, 10)
            .await
            .expect("page");
        assert_eq!(second.skipped, 3);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].source_record_id, "P-4");
        assert_eq!(second.next_cursor, body.len() as i64);

        assert!(
            source
                .fetch_page(SourceTable::Plumbing, second.next_cursor, 10)
                .await
                .expect("page")
                .is_end(second.next_cursor)
        );
        assert!(
            source
                .fetch_page(SourceTable::Electrical, 0, 2)
                .await
                .expect("missing feed")
                .is_end(0)
        );
    }
}

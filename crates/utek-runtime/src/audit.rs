//! Append-only audit trail.
//!
//! One record per instruction outcome across all units. The sink is the
//! only resource shared by every execution unit, so appends serialize
//! under one lock and each line is flushed before the lock drops. Records
//! are never mutated or reordered after being written.

use std::io::Write;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

use crate::fault::Outcome;

pub const AUDIT_FIELD_SEPARATOR: &str = " | ";
const MAX_DETAIL_BYTES: usize = 512;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp_utc: String,
    pub unit_id: u32,
    pub opcode: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub program_hash: String,
    pub details: String,
}

impl AuditRecord {
    pub fn new(
        unit_id: u32,
        opcode: &str,
        outcome: Outcome,
        duration_ms: u64,
        program_hash: &str,
        details: &str,
    ) -> Self {
        AuditRecord {
            timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            unit_id,
            opcode: opcode.to_string(),
            outcome,
            duration_ms,
            program_hash: program_hash.to_string(),
            details: sanitize_details(details),
        }
    }

    /// `ts | unit | opcode | OUTCOME | <n>ms | hash | details`
    pub fn line(&self) -> String {
        format!(
            "{}{sep}unit-{:03}{sep}{}{sep}{}{sep}{}ms{sep}{}{sep}{}",
            self.timestamp_utc,
            self.unit_id,
            self.opcode,
            self.outcome,
            self.duration_ms,
            self.program_hash,
            self.details,
            sep = AUDIT_FIELD_SEPARATOR,
        )
    }
}

/// Detail payloads are truncated and must not carry the field separator.
fn sanitize_details(details: &str) -> String {
    let mut cleaned: String = details.replace('|', ";").replace('\n', " ");
    if cleaned.len() > MAX_DETAIL_BYTES {
        let mut cut = MAX_DETAIL_BYTES;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned.push_str("...");
    }
    cleaned
}

struct SinkInner {
    records: Vec<AuditRecord>,
    writer: Option<Box<dyn Write + Send>>,
}

pub struct AuditSink {
    inner: Mutex<SinkInner>,
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink {
    pub fn new() -> Self {
        AuditSink {
            inner: Mutex::new(SinkInner {
                records: Vec::new(),
                writer: None,
            }),
        }
    }

    /// Sink that tees every line to `writer` (e.g. an audit-log file),
    /// flushed synchronously per record.
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        AuditSink {
            inner: Mutex::new(SinkInner {
                records: Vec::new(),
                writer: Some(writer),
            }),
        }
    }

    pub fn append(&self, record: AuditRecord) {
        let mut inner = self.inner.lock().expect("audit sink poisoned");
        if let Some(writer) = inner.writer.as_mut() {
            // A failing writer must not take the interpreter down with it.
            let line = record.line();
            if writeln!(writer, "{line}").and_then(|()| writer.flush()).is_err() {
                tracing::warn!("audit writer failed; record kept in memory only");
            }
        }
        inner.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("audit sink poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the trail (optionally one unit's slice of it).
    pub fn records(&self, unit_id: Option<u32>) -> Vec<AuditRecord> {
        let inner = self.inner.lock().expect("audit sink poisoned");
        inner
            .records
            .iter()
            .filter(|r| unit_id.map_or(true, |id| r.unit_id == id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_has_seven_fields() {
        let record = AuditRecord::new(3, "LOG", Outcome::Success, 12, "abc123", "hello");
        let line = record.line();
        let fields: Vec<&str> = line.split(AUDIT_FIELD_SEPARATOR).collect();
        assert_eq!(fields.len(), 7, "line: {line}");
        assert_eq!(fields[1], "unit-003");
        assert_eq!(fields[2], "LOG");
        assert_eq!(fields[3], "SUCCESS");
        assert_eq!(fields[4], "12ms");
        assert_eq!(fields[5], "abc123");
        assert_eq!(fields[6], "hello");
        assert!(fields[0].ends_with('Z'), "timestamp is UTC: {}", fields[0]);
    }

    #[test]
    fn details_are_escaped_and_truncated() {
        let record = AuditRecord::new(0, "LOG", Outcome::Failed, 0, "h", "a|b|c");
        assert_eq!(record.details, "a;b;c");

        let long = "x".repeat(2048);
        let record = AuditRecord::new(0, "LOG", Outcome::Failed, 0, "h", &long);
        assert!(record.details.len() <= MAX_DETAIL_BYTES + 3);
        assert!(record.details.ends_with("..."));
    }

    #[test]
    fn appends_preserve_order() {
        let sink = AuditSink::new();
        for i in 0..10u64 {
            sink.append(AuditRecord::new(
                0,
                "LOG",
                Outcome::Success,
                i,
                "h",
                &format!("n{i}"),
            ));
        }
        let records = sink.records(None);
        assert_eq!(records.len(), 10);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.details, format!("n{i}"));
        }
    }

    #[test]
    fn unit_filter_selects_one_units_slice() {
        let sink = AuditSink::new();
        sink.append(AuditRecord::new(1, "LOG", Outcome::Success, 0, "h", "a"));
        sink.append(AuditRecord::new(2, "LOG", Outcome::Success, 0, "h", "b"));
        sink.append(AuditRecord::new(1, "HALT", Outcome::Halted, 0, "h", ""));
        assert_eq!(sink.records(Some(1)).len(), 2);
        assert_eq!(sink.records(Some(2)).len(), 1);
        assert_eq!(sink.records(None).len(), 3);
    }
}

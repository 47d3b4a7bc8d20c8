//! Process-wide, append-only error journal.
//!
//! Every failure occurrence is appended here *before* any recovery action is
//! taken, so the journal reflects each occurrence regardless of outcome.
//! Entries are never pruned; a branch that eventually succeeds keeps its
//! earlier records.

use std::sync::{Arc, RwLock};

use branchline_types::error::ErrorRecord;
use branchline_types::fei::Fei;
use uuid::Uuid;

/// Shared handle to the append-only error log.
#[derive(Clone, Debug, Default)]
pub struct ErrorLog {
    records: Arc<RwLock<Vec<ErrorRecord>>>,
}

impl ErrorLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn append(&self, record: ErrorRecord) {
        tracing::warn!(
            fei = %record.fei,
            kind = %record.kind,
            error = record.message.as_str(),
            "error recorded"
        );
        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
    }

    /// All records, in append order.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records belonging to one process instance, in append order.
    pub fn for_process(&self, process_id: Uuid) -> Vec<ErrorRecord> {
        self.records
            .read()
            .map(|r| {
                r.iter()
                    .filter(|rec| rec.fei.process_id == process_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records for a single expression instance.
    pub fn for_fei(&self, fei: &Fei) -> Vec<ErrorRecord> {
        self.records
            .read()
            .map(|r| r.iter().filter(|rec| &rec.fei == fei).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchline_types::error::FailureKind;

    #[test]
    fn append_preserves_order() {
        let log = ErrorLog::new();
        let fei = Fei::root(Uuid::now_v7());
        log.append(ErrorRecord::now(fei.clone(), FailureKind::Participant, "first"));
        log.append(ErrorRecord::now(fei, FailureKind::Configuration, "second"));

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "first");
        assert_eq!(records[1].message, "second");
    }

    #[test]
    fn for_process_filters_by_process_id() {
        let log = ErrorLog::new();
        let a = Fei::root(Uuid::now_v7());
        let b = Fei::root(Uuid::now_v7());
        log.append(ErrorRecord::now(a.clone(), FailureKind::Participant, "a"));
        log.append(ErrorRecord::now(b, FailureKind::Participant, "b"));

        let records = log.for_process(a.process_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "a");
    }

    #[test]
    fn clones_share_the_same_journal() {
        let log = ErrorLog::new();
        let log2 = log.clone();
        log2.append(ErrorRecord::now(
            Fei::root(Uuid::now_v7()),
            FailureKind::Cancellation,
            "shared",
        ));
        assert_eq!(log.len(), 1);
        assert!(!log.is_empty());
    }
}

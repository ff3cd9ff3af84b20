use cortex_common::{CortexError, Result};
use serde::{Deserialize, Serialize};

/// What a committed entry means to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Leader-epoch marker; carries no payload
    Noop,
    /// Membership change (join/approve/drain/leave/reset)
    Membership,
    /// A node's periodic health + resource report
    NodeReport,
    /// Opaque shared-state operation for the workload layer
    StateOp,
}

/// One replicated log entry. Never mutated after append, except when a
/// leader overwrites a conflicting uncommitted suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Noop,
            payload: Vec::new(),
        }
    }
}

/// In-memory replicated log, 1-indexed. Index 0 is the empty-log sentinel
/// with term 0.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`; 0 at index 0, None past the end.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Entries in `[from, to]`, clamped to the log bounds.
    pub fn range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from == 0 || from > to {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = std::cmp::min(to as usize, self.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(CortexError::Internal(format!(
                "log append out of order: got index {}, expected {}",
                entry.index,
                self.last_index() + 1
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drop every entry at `from_index` and beyond.
    pub fn truncate_from(&mut self, from_index: u64) {
        if from_index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate(from_index as usize - 1);
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::noop(index, term)
    }

    #[test]
    fn test_empty_log_boundaries() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.entry(1).is_none());
    }

    #[test]
    fn test_append_and_query() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 1)).unwrap();
        log.append(entry(3, 2)).unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.range(2, 3).len(), 2);
        assert_eq!(log.range(4, 9).len(), 0);
    }

    #[test]
    fn test_append_rejects_gaps() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1)).unwrap();
        assert!(log.append(entry(3, 1)).is_err());
    }

    #[test]
    fn test_truncate_suffix() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(entry(i, 1)).unwrap();
        }
        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);
        assert!(log.entry(3).is_none());
    }

    #[test]
    fn test_entry_payload_round_trip() {
        let original = LogEntry {
            index: 7,
            term: 3,
            kind: EntryKind::Membership,
            payload: b"join:node-a".to_vec(),
        };
        let bytes = bincode::serialize(&original).unwrap();
        let back: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, original);
    }
}

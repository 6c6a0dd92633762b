//! Per-run outcome counting.

use crate::error::{error_chain, Side, TransferError};
use crate::model::{FileMark, FileRecord};

/// Counts file outcomes of one run. Every file is charged to exactly one counter.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    files: u64,
    src_errors: u64,
    tgt_errors: u64,
    records: Vec<FileRecord>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transferred(&mut self, path: &str, info: impl Into<String>) -> &FileRecord {
        self.files += 1;
        self.push(path, info.into(), FileMark::Transferred)
    }

    pub fn failed(&mut self, err: &TransferError) -> &FileRecord {
        self.failed_on(err.side(), err.path(), error_chain(err))
    }

    pub fn failed_on(&mut self, side: Side, path: &str, info: impl Into<String>) -> &FileRecord {
        let mark = match side {
            Side::Source => {
                self.src_errors += 1;
                FileMark::SourceError
            }
            Side::Target => {
                self.tgt_errors += 1;
                FileMark::TargetError
            }
        };
        self.push(path, info.into(), mark)
    }

    /// Record a transferred file that was not post-processed. Not counted.
    pub fn unprocessed(&mut self, path: &str, info: impl Into<String>) -> &FileRecord {
        self.push(path, info.into(), FileMark::Unprocessed)
    }

    fn push(&mut self, path: &str, info: String, mark: FileMark) -> &FileRecord {
        self.records.push(FileRecord {
            path: path.to_string(),
            info,
            mark,
        });
        &self.records[self.records.len() - 1]
    }

    pub fn files(&self) -> u64 {
        self.files
    }

    pub fn src_errors(&self) -> u64 {
        self.src_errors
    }

    pub fn tgt_errors(&self) -> u64 {
        self.tgt_errors
    }

    pub fn has_errors(&self) -> bool {
        self.src_errors + self.tgt_errors > 0
    }

    /// Records sorted by path.
    pub fn into_records(mut self) -> Vec<FileRecord> {
        self.records.sort_by(|a, b| a.path.cmp(&b.path));
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_each_outcome_counts_once() {
        let mut agg = ErrorAggregator::new();
        agg.transferred("b.txt", "0.10s");
        agg.failed(&TransferError::Read {
            path: "a.txt".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        });
        agg.failed_on(Side::Target, "c.txt", "target connection lost");
        agg.unprocessed("d.txt", "terminated");

        assert_eq!((agg.files(), agg.src_errors(), agg.tgt_errors()), (1, 1, 1));
        assert!(agg.has_errors());
        let records = agg.into_records();
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "c.txt", "d.txt"]);
        assert_eq!(records[0].mark, FileMark::SourceError);
        assert_eq!(records[0].info, "cannot read a.txt: gone");
    }
}

//! Run-wide counters shared by all workers.
//!
//! Plain relaxed atomics; readers get a snapshot that is monotone per
//! field but not consistent across fields (files_completed may be ahead
//! of bytes_copied at any instant).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CopyStats {
    files_total: AtomicU64,
    files_completed: AtomicU64,
    files_failed: AtomicU64,
    bytes_total: AtomicU64,
    bytes_copied: AtomicU64,
    dirs_created: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub files_total: u64,
    pub files_completed: u64,
    pub files_failed: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub dirs_created: u64,
}

impl CopyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_files_total(&self, n: u64) {
        self.files_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_total(&self, n: u64) {
        self.bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_copied(&self, n: u64) {
        self.bytes_copied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dir_created(&self) {
        self.dirs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_total: self.files_total.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Every file was accounted for, one way or the other.
    pub fn settled(&self) -> bool {
        self.files_completed + self.files_failed >= self.files_total
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} files, {} copied",
            self.files_completed,
            self.files_total,
            bytesize::ByteSize(self.bytes_copied)
        )?;
        if self.files_failed > 0 {
            write!(f, ", {} failed", self.files_failed)?;
        }
        if self.dirs_created > 0 {
            write!(f, ", {} dirs created", self.dirs_created)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let stats = CopyStats::new();
        stats.add_files_total(10);
        stats.file_completed();
        stats.file_completed();
        stats.file_failed();
        stats.add_bytes_total(4096);
        stats.add_bytes_copied(1024);
        stats.dir_created();
        let snap = stats.snapshot();
        assert_eq!(snap.files_total, 10);
        assert_eq!(snap.files_completed, 2);
        assert_eq!(snap.files_failed, 1);
        assert_eq!(snap.bytes_total, 4096);
        assert_eq!(snap.bytes_copied, 1024);
        assert_eq!(snap.dirs_created, 1);
        assert!(!snap.settled());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(CopyStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.file_completed();
                    stats.add_bytes_copied(13);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.files_completed, 8000);
        assert_eq!(snap.bytes_copied, 8000 * 13);
    }

    #[test]
    fn snapshot_display_mentions_failures() {
        let stats = CopyStats::new();
        stats.add_files_total(2);
        stats.file_completed();
        stats.file_failed();
        let line = stats.snapshot().to_string();
        assert!(line.contains("1/2 files"));
        assert!(line.contains("1 failed"));
    }
}

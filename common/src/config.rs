use crate::error::{EngineError, EngineResult};

pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Settings consumed by the local copy engine.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Number of worker threads. One is usually right for a single fast
    /// local disk (the ring provides the parallelism); more helps on
    /// networked filesystems.
    pub workers: usize,
    /// Ring depth; also the buffer count and pipe count per worker.
    pub queue_depth: usize,
    /// Per-operation byte budget; buffer size and pipe capacity.
    pub chunk_size: usize,
    /// Zero-copy data path (file -> pipe -> file splice) instead of
    /// buffered read/write.
    pub use_splice: bool,
    /// Blocking per-file copy_file_range loop instead of the ring engine.
    pub sync_mode: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_splice: true,
            sync_mode: false,
        }
    }
}

impl CopyConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be positive".into()));
        }
        if self.queue_depth == 0 || self.queue_depth > 32768 {
            return Err(EngineError::InvalidConfig(format!(
                "queue depth {} out of range (1..=32768)",
                self.queue_depth
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > (u32::MAX / 2) as usize {
            return Err(EngineError::InvalidConfig(format!(
                "chunk size {} out of range",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

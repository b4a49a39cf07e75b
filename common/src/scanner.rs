//! Source tree walk and transfer planning.
//!
//! The scan produces the complete work list up front, creating destination
//! directories on the way, and samples file sizes so the run can pick a
//! chunk size before any worker starts. Items are sorted by source inode:
//! on most filesystems inode order approximates on-disk allocation order,
//! which makes a large difference on rotational and networked storage.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::stats::CopyStats;

/// One file to copy, as planned by the scanner. Immutable once created.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub src: PathBuf,
    pub dst: PathBuf,
    /// Sort key only; approximate on-disk order.
    pub inode: u64,
}

/// One file to send over the network: absolute path plus the relative
/// path that goes on the wire.
#[derive(Debug, Clone)]
pub struct SendItem {
    pub abs: PathBuf,
    pub rel: String,
    pub inode: u64,
    pub size: u64,
}

pub struct ScanOutcome {
    pub items: Vec<WorkItem>,
    pub sizes: SizeStats,
}

/// Walk `src` and plan a copy into `dst`. Destination directories are
/// created greedily; a regular-file source yields a single item.
pub fn scan(src: &Path, dst: &Path, stats: &CopyStats) -> EngineResult<ScanOutcome> {
    let mut outcome = ScanOutcome {
        items: Vec::new(),
        sizes: SizeStats::new(),
    };

    let md = fs::metadata(src)?;
    if md.is_file() {
        if let Some(parent) = dst.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                stats.dir_created();
            }
        }
        outcome.sizes.observe(md.len());
        outcome.items.push(WorkItem {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            inode: md.ino(),
        });
        return Ok(outcome);
    }
    if !md.is_dir() {
        return Err(EngineError::InvalidConfig(format!(
            "{}: not a regular file or directory",
            src.display()
        )));
    }

    if !dst.exists() {
        fs::create_dir_all(dst)?;
        stats.dir_created();
    }
    walk(src, dst, stats, &mut outcome)?;
    outcome.items.sort_by_key(|item| item.inode);
    Ok(outcome)
}

fn walk(
    src_dir: &Path,
    dst_dir: &Path,
    stats: &CopyStats,
    outcome: &mut ScanOutcome,
) -> EngineResult<()> {
    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst_dir.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            match fs::create_dir(&dst_path) {
                Ok(()) => stats.dir_created(),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            walk(&src_path, &dst_path, stats, outcome)?;
            continue;
        }
        // Follows symlinks, so a link to a regular file is copied by
        // content; anything else (sockets, fifos, dangling links) is
        // skipped.
        let md = match fs::metadata(&src_path) {
            Ok(md) => md,
            Err(e) => {
                tracing::debug!("skipping {}: {}", src_path.display(), e);
                continue;
            }
        };
        if !md.is_file() {
            continue;
        }
        outcome.sizes.observe(md.len());
        outcome.items.push(WorkItem {
            src: src_path,
            dst: dst_path,
            inode: md.ino(),
        });
    }
    Ok(())
}

/// Walk `root` for the network sender: relative wire paths, no destination
/// side effects. Non-UTF-8 names cannot be represented on the wire and
/// fail the file (not the run).
pub fn scan_relative(root: &Path, stats: &CopyStats) -> EngineResult<(Vec<SendItem>, SizeStats)> {
    let mut items = Vec::new();
    let mut sizes = SizeStats::new();

    let md = fs::metadata(root)?;
    if md.is_file() {
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                EngineError::InvalidConfig(format!("{}: not a sendable file name", root.display()))
            })?;
        sizes.observe(md.len());
        items.push(SendItem {
            abs: root.to_path_buf(),
            rel: name.to_string(),
            inode: md.ino(),
            size: md.len(),
        });
        return Ok((items, sizes));
    }
    if !md.is_dir() {
        return Err(EngineError::InvalidConfig(format!(
            "{}: not a regular file or directory",
            root.display()
        )));
    }

    walk_relative(root, "", stats, &mut items, &mut sizes)?;
    items.sort_by_key(|item| item.inode);
    Ok((items, sizes))
}

fn walk_relative(
    dir: &Path,
    rel_prefix: &str,
    stats: &CopyStats,
    items: &mut Vec<SendItem>,
    sizes: &mut SizeStats,
) -> EngineResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!("skipping non-UTF-8 name {:?}", raw);
                stats.file_failed();
                continue;
            }
        };
        let rel = if rel_prefix.is_empty() {
            name
        } else {
            format!("{}/{}", rel_prefix, name)
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_relative(&path, &rel, stats, items, sizes)?;
            continue;
        }
        let md = match fs::metadata(&path) {
            Ok(md) => md,
            Err(e) => {
                tracing::debug!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if !md.is_file() {
            continue;
        }
        sizes.observe(md.len());
        items.push(SendItem {
            abs: path,
            rel,
            inode: md.ino(),
            size: md.len(),
        });
    }
    Ok(())
}

const KIB: u64 = 1024;
const FULL_SAMPLE_COUNT: usize = 20;
const MAX_SAMPLES: usize = 200;

/// Running reservoir of file sizes: the first 20 observations are always
/// kept, after that sampling is thinned by a growing stride so the
/// reservoir stays around 200 entries no matter how large the tree is.
#[derive(Debug, Clone)]
pub struct SizeStats {
    samples: Vec<u64>,
    observed: u64,
    stride: u64,
}

impl SizeStats {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            observed: 0,
            stride: 1,
        }
    }

    pub fn observe(&mut self, size: u64) {
        self.observed += 1;
        if self.samples.len() < FULL_SAMPLE_COUNT {
            self.samples.push(size);
            return;
        }
        if self.samples.len() >= MAX_SAMPLES {
            // Compact: keep the head intact, halve the tail, double the
            // stride so future pushes arrive half as often.
            let mut kept: Vec<u64> = self.samples[..FULL_SAMPLE_COUNT].to_vec();
            kept.extend(self.samples[FULL_SAMPLE_COUNT..].iter().copied().step_by(2));
            self.samples = kept;
            self.stride *= 2;
        }
        if self.observed % self.stride == 0 {
            self.samples.push(size);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Nearest-rank percentile over the current sample set; 0 when empty.
    pub fn percentile(&self, pct: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((sorted.len() - 1) as f64 * pct).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    /// Chunk size bracketing the 90th percentile of observed sizes.
    /// With no samples the 128 KiB default stands.
    pub fn pick_chunk_size(&self) -> usize {
        if self.samples.is_empty() {
            return (128 * KIB) as usize;
        }
        let p90 = self.percentile(0.90);
        let chunk = if p90 <= 32 * KIB {
            64 * KIB
        } else if p90 <= 128 * KIB {
            128 * KIB
        } else if p90 <= 512 * KIB {
            256 * KIB
        } else if p90 <= 2 * KIB * KIB {
            512 * KIB
        } else {
            KIB * KIB
        };
        chunk as usize
    }
}

impl Default for SizeStats {
    fn default() -> Self {
        Self::new()
    }
}

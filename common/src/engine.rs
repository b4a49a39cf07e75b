//! Worker engine: N threads, each owning one ring, one buffer pool, one
//! pipe pool and up to queue-depth in-flight jobs.
//!
//! Each loop iteration admits work up to the in-flight budget, hands
//! pending submissions to the kernel, blocks for at least one completion,
//! then advances every tagged job one step. Terminal jobs return their
//! loans and free their slot. The CQE token is the job's slot index, so
//! lookup is O(1) and nothing is ever aliased across jobs.

use crate::buffer_pool::BufferPool;
use crate::config::CopyConfig;
use crate::error::EngineResult;
use crate::job::FileJob;
use crate::pipe_pool::PipePool;
use crate::ring::{Completion, Ring};
use crate::scanner::WorkItem;
use crate::stats::CopyStats;
use crate::work_queue::WorkQueue;

/// Copy all `items` using the ring engine. Returns when every admitted
/// job has reached DONE or FAILED on every worker; per-file failures are
/// visible in `stats`, not here.
pub fn run_local(cfg: &CopyConfig, items: Vec<WorkItem>, stats: &CopyStats) -> EngineResult<()> {
    cfg.validate()?;
    stats.add_files_total(items.len() as u64);
    let queue = WorkQueue::new();
    queue.push_bulk(items);
    queue.close();

    let results: Vec<EngineResult<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..cfg.workers)
            .map(|id| {
                let queue = &queue;
                scope.spawn(move || worker_loop(id, cfg, queue, stats))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });
    for result in results {
        result?;
    }
    Ok(())
}

enum Admission {
    Started,
    /// No free buffer or slot; the item went back to the queue front.
    Requeued,
    /// The item itself was unusable and was counted failed.
    Rejected,
}

fn admit(
    item: WorkItem,
    want_splice: bool,
    ring: &mut Ring,
    buffers: &mut BufferPool,
    pipes: &mut PipePool,
    slots: &mut [Option<Box<FileJob>>],
    free: &mut Vec<usize>,
    queue: &WorkQueue<WorkItem>,
    stats: &CopyStats,
) -> EngineResult<Admission> {
    let Some(buf_idx) = buffers.acquire() else {
        queue.push_front(item);
        return Ok(Admission::Requeued);
    };
    let Some(slot_idx) = free.pop() else {
        buffers.release(buf_idx);
        queue.push_front(item);
        return Ok(Admission::Requeued);
    };
    let Some(mut job) = FileJob::new(item, want_splice) else {
        // Interior NUL in the path; the kernel could never open it.
        buffers.release(buf_idx);
        free.push(slot_idx);
        stats.file_failed();
        return Ok(Admission::Rejected);
    };
    job.set_buffer(buf_idx, buffers.ptr(buf_idx));
    if want_splice {
        // No pipe free means this job runs buffered; the pools are
        // depth-sized, so that only happens if the run mixes paths.
        if let Some(pipe_idx) = pipes.acquire() {
            let (read, write) = pipes.fds(pipe_idx);
            job.set_pipe(pipe_idx, read, write);
        }
    }
    // Boxed so the statx block and path strings have stable addresses for
    // the kernel while the submission is in flight.
    let mut job = Box::new(job);
    job.start(ring, slot_idx as u64)?;
    slots[slot_idx] = Some(job);
    Ok(Admission::Started)
}

fn worker_loop(
    id: usize,
    cfg: &CopyConfig,
    queue: &WorkQueue<WorkItem>,
    stats: &CopyStats,
) -> EngineResult<()> {
    let depth = cfg.queue_depth;
    let chunk = cfg.chunk_size as u32;
    let mut ring = Ring::new(depth as u32)?;
    let mut buffers = BufferPool::new(depth, cfg.chunk_size)?;
    let mut pipes = if cfg.use_splice {
        PipePool::new(depth, cfg.chunk_size)?
    } else {
        PipePool::empty()
    };
    let mut slots: Vec<Option<Box<FileJob>>> = (0..depth).map(|_| None).collect();
    let mut free: Vec<usize> = (0..depth).rev().collect();
    let mut in_flight = 0usize;
    let mut exhausted = false;
    let mut completions: Vec<Completion> = Vec::with_capacity(depth * 2);

    loop {
        while !exhausted && in_flight < depth {
            let Some(item) = queue.try_pop() else {
                if queue.is_done() {
                    exhausted = true;
                }
                break;
            };
            match admit(
                item,
                cfg.use_splice,
                &mut ring,
                &mut buffers,
                &mut pipes,
                &mut slots,
                &mut free,
                queue,
                stats,
            )? {
                Admission::Started => in_flight += 1,
                Admission::Requeued => break,
                Admission::Rejected => {}
            }
        }

        if in_flight == 0 {
            if exhausted {
                break;
            }
            // Nothing in flight and the queue is still open: block for
            // work rather than spinning.
            match queue.wait_pop() {
                Some(item) => {
                    match admit(
                        item,
                        cfg.use_splice,
                        &mut ring,
                        &mut buffers,
                        &mut pipes,
                        &mut slots,
                        &mut free,
                        queue,
                        stats,
                    )? {
                        Admission::Started => in_flight += 1,
                        Admission::Requeued | Admission::Rejected => {}
                    }
                    continue;
                }
                None => {
                    exhausted = true;
                    continue;
                }
            }
        }

        completions.clear();
        ring.wait_completions(&mut completions)?;
        for c in &completions {
            let idx = c.token as usize;
            let Some(job) = slots.get_mut(idx).and_then(|slot| slot.as_mut()) else {
                tracing::debug!("worker {}: completion for empty slot {}", id, idx);
                continue;
            };
            job.advance(c.result, c.token, &mut ring, chunk, stats, &mut buffers)?;
            if job.is_terminal() {
                let mut job = slots[idx].take().unwrap();
                job.release_loans(&mut buffers, &mut pipes);
                free.push(idx);
                in_flight -= 1;
            }
        }
    }

    debug_assert_eq!(buffers.available(), buffers.count());
    debug_assert_eq!(pipes.available(), pipes.count());
    tracing::debug!("worker {} finished", id);
    Ok(())
}

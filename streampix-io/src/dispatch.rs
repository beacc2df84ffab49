//! Decode dispatcher: a pool of workers keyed by chip index.
//!
//! The framer submits word batches tagged with the chunk's chip index and
//! metadata. Batches route to worker `chip % N`, so each chip's words are
//! decoded by exactly one worker in FIFO order. Workers accumulate into
//! private [`PartialStats`] and only the merge at flush points touches the
//! shared aggregator lock.

use log::warn;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use streampix_core::event::ChunkMetadata;
use streampix_core::processor::HitProcessor;
use streampix_core::stats::PartialStats;
use streampix_core::timing::extend_timestamp;
use streampix_tpx::packet::{
    decode_extra_timestamp, decode_global_time, decode_pixel, decode_spidr_control,
    decode_spidr_packet_id, decode_tdc, decode_tpx3_control, PacketKind,
};

/// Width of the narrow per-hit time field lifted by the extender.
const EXTENSION_BITS: u32 = 30;
const EXTENSION_MASK: u64 = (1 << EXTENSION_BITS) - 1;

/// Decode errors logged per sub-kind before going silent.
const MAX_ERRORS_LOGGED: u32 = 5;

/// Pool settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Worker thread count. Stream mode defaults to
    /// [`default_stream_workers`]; file mode to 1.
    pub workers: usize,
    /// Bound for each worker's recent-hit buffer (matches the aggregator
    /// ring).
    pub recent_hit_capacity: usize,
}

/// Default worker count for live stream decoding.
pub fn default_stream_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(4)
}

/// Shared decode context: the aggregator plus once-only logging state.
pub(crate) struct DecodeContext {
    processor: Arc<HitProcessor>,
    pixel_errors_logged: AtomicU32,
    tdc_errors_logged: AtomicU32,
}

impl DecodeContext {
    fn new(processor: Arc<HitProcessor>) -> Self {
        Self {
            processor,
            pixel_errors_logged: AtomicU32::new(0),
            tdc_errors_logged: AtomicU32::new(0),
        }
    }
}

/// Decodes one word into worker-local stats, falling back to the shared
/// aggregator for the rare control-path packets.
fn decode_word(
    word: u64,
    chip_index: u8,
    meta: &ChunkMetadata,
    partial: &mut PartialStats,
    ctx: &DecodeContext,
) {
    match PacketKind::of(word) {
        PacketKind::PixelCountFb | PacketKind::PixelStandard => {
            partial.pixel_bytes += 8;
            match decode_pixel(word, chip_index) {
                Ok(mut hit) => {
                    if meta.has_extra_packets {
                        hit.toa_ticks = extend_timestamp(
                            hit.toa_ticks & EXTENSION_MASK,
                            meta.min_timestamp,
                            EXTENSION_BITS,
                        );
                    }
                    partial.record_hit(hit);
                }
                Err(e) => {
                    partial.decode_errors += 1;
                    if ctx.pixel_errors_logged.fetch_add(1, Ordering::Relaxed) < MAX_ERRORS_LOGGED
                    {
                        warn!("error decoding pixel data: {e}");
                    }
                }
            }
        }
        PacketKind::Tdc => {
            partial.tdc_bytes += 8;
            match decode_tdc(word) {
                Ok(event) => partial.record_tdc(&event, chip_index),
                Err(e) => {
                    partial.decode_errors += 1;
                    if e.is_fractional() {
                        partial.fractional_errors += 1;
                    }
                    if ctx.tdc_errors_logged.fetch_add(1, Ordering::Relaxed) < MAX_ERRORS_LOGGED {
                        warn!("error decoding TDC data: {e}");
                    }
                }
            }
        }
        PacketKind::GlobalTimeLow | PacketKind::GlobalTimeHigh => {
            let _ = decode_global_time(word);
        }
        PacketKind::SpidrId => {
            let _ = decode_spidr_packet_id(word);
        }
        PacketKind::SpidrControl => {
            if decode_spidr_control(word).is_some() {
                ctx.processor.increment_control_packet();
            }
        }
        PacketKind::Tpx3Control => {
            if decode_tpx3_control(word).is_some() {
                ctx.processor.increment_control_packet();
            }
        }
        PacketKind::ExtraTimestamp => {
            // Mid-chunk extra timestamps carry no chunk metadata role.
            let _ = decode_extra_timestamp(word);
        }
        PacketKind::Unknown => ctx.processor.increment_unknown_packet(),
    }
}

struct DecodeTask {
    words: Vec<u64>,
    chip_index: u8,
    meta: ChunkMetadata,
}

struct WorkerShared {
    queue: Mutex<VecDeque<DecodeTask>>,
    task_available: Condvar,
    stop: AtomicBool,
    partial: Mutex<PartialStats>,
}

struct PendingCounter {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Worker pool decoding word batches keyed by chip index.
pub struct DecodeDispatcher {
    ctx: Arc<DecodeContext>,
    workers: Vec<Arc<WorkerShared>>,
    pending: Arc<PendingCounter>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DecodeDispatcher {
    pub fn new(processor: Arc<HitProcessor>, config: DispatcherConfig) -> Self {
        let worker_count = config.workers.max(1);
        let ctx = Arc::new(DecodeContext::new(processor));
        let pending = Arc::new(PendingCounter {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });

        let workers: Vec<Arc<WorkerShared>> = (0..worker_count)
            .map(|_| {
                Arc::new(WorkerShared {
                    queue: Mutex::new(VecDeque::new()),
                    task_available: Condvar::new(),
                    stop: AtomicBool::new(false),
                    partial: Mutex::new(PartialStats::with_recent_capacity(
                        config.recent_hit_capacity,
                    )),
                })
            })
            .collect();

        let handles = workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                let ctx = ctx.clone();
                let pending = pending.clone();
                std::thread::spawn(move || worker_loop(&worker, &ctx, &pending))
            })
            .collect();

        Self {
            ctx,
            workers,
            pending,
            handles: Mutex::new(handles),
        }
    }

    /// Enqueues a word batch on the worker owning `chip_index`.
    pub fn submit_batch(&self, words: &[u64], chip_index: u8, meta: ChunkMetadata) {
        if words.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.count.lock().unwrap_or_else(|e| e.into_inner());
            *pending += words.len();
        }
        let worker = &self.workers[chip_index as usize % self.workers.len()];
        {
            let mut queue = worker.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(DecodeTask {
                words: words.to_vec(),
                chip_index,
                meta,
            });
        }
        worker.task_available.notify_one();
    }

    /// Words submitted but not yet decoded.
    pub fn pending_tasks(&self) -> usize {
        *self.pending.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until every submitted word has been decoded, then merges all
    /// worker partial stats into the aggregator.
    pub fn wait_until_idle(&self) {
        let mut pending = self.pending.count.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .pending
                .idle
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(pending);
        self.flush_partials();
    }

    /// Merges every worker's partial stats into the aggregator.
    pub fn flush_partials(&self) {
        for worker in &self.workers {
            let mut partial = worker.partial.lock().unwrap_or_else(|e| e.into_inner());
            self.ctx.processor.merge_partial(&mut partial);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals all workers, joins them, and performs the final merge.
    /// Queued tasks are drained before exit. Idempotent.
    pub fn stop(&self) {
        for worker in &self.workers {
            // Set the flag while holding the queue lock so a worker between
            // its stop check and its wait cannot miss the wakeup.
            let guard = worker.queue.lock().unwrap_or_else(|e| e.into_inner());
            worker.stop.store(true, Ordering::Release);
            drop(guard);
            worker.task_available.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        self.flush_partials();
    }
}

impl Drop for DecodeDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl streampix_tpx::framer::PacketSink for DecodeDispatcher {
    fn submit_batch(&self, words: &[u64], chip_index: u8, meta: ChunkMetadata) {
        DecodeDispatcher::submit_batch(self, words, chip_index, meta);
    }
}

fn worker_loop(worker: &WorkerShared, ctx: &DecodeContext, pending: &PendingCounter) {
    loop {
        let task = {
            let mut queue = worker.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if worker.stop.load(Ordering::Acquire) {
                    break None;
                }
                queue = worker
                    .task_available
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        let Some(task) = task else { break };

        {
            let mut partial = worker.partial.lock().unwrap_or_else(|e| e.into_inner());
            for &word in &task.words {
                decode_word(word, task.chip_index, &task.meta, &mut partial, ctx);
            }
        }

        let mut count = pending.count.lock().unwrap_or_else(|e| e.into_inner());
        *count -= task.words.len();
        if *count == 0 {
            pending.idle.notify_all();
        }
    }
}

/// Synchronous decoder for running without a worker pool (one-thread file
/// processing and tests). Implements the same sink contract; decoding
/// happens on the submitting thread.
pub struct InlineDecoder {
    ctx: DecodeContext,
    partial: Mutex<PartialStats>,
}

impl InlineDecoder {
    pub fn new(processor: Arc<HitProcessor>, recent_hit_capacity: usize) -> Self {
        Self {
            ctx: DecodeContext::new(processor),
            partial: Mutex::new(PartialStats::with_recent_capacity(recent_hit_capacity)),
        }
    }

    /// Merges accumulated stats into the aggregator.
    pub fn flush(&self) {
        let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());
        self.ctx.processor.merge_partial(&mut partial);
    }
}

impl streampix_tpx::framer::PacketSink for InlineDecoder {
    fn submit_batch(&self, words: &[u64], chip_index: u8, meta: ChunkMetadata) {
        let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());
        for &word in words {
            decode_word(word, chip_index, &meta, &mut partial, &self.ctx);
        }
    }
}

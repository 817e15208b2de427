//! Pipeline supervision: cancellation flags, worker lifecycle, and the
//! `run_pack` / `run_unpack` orchestration.
//!
//! One archive operation wires three roles to one queue: a producer thread
//! (filesystem reader on pack, archive reader on restore), a pool of
//! transformer threads, and a consumer running on the calling thread
//! (archive writer on pack, filesystem reconstructor on restore).
//!
//! Lifecycle is cooperative, governed by three controls:
//! - `abort` — fatal error or signal; every queue wait observes it within
//!   one timeout period.
//! - `stopfillqueue` — set by transformers or the consumer on fatal error to
//!   tell the producer to stop feeding.
//! - `secthreads` — count of live secondary threads, so teardown knows when
//!   the queue can be dropped.
//!
//! Shutdown order: the producer stops enqueueing and closes the queue;
//! transformers drain remaining TODO blocks and exit; the consumer drains
//! DONE items and exits; dropping the queue frees whatever is left.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error};

use crate::codec::{BuiltinCodecs, CodecError, CodecProvider};
use crate::crypto::CryptoError;
use crate::format::{CompressAlgo, FormatError};
use crate::io_stream::{ArchiveReader, ArchiveWriter};
use crate::options::{ArchiveOptions, OptionsError};
use crate::queue::{BlockQueue, Item, QueueError, Status};
use crate::stats::{Stats, StatsSnapshot};
use crate::transform::{transform_worker, TransformDirection, TransformError};
use crate::util::{generate_archive_id, path_force_extension};
use crate::{pack, unpack};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A worker or the producer hit a fatal error; details were logged by
    /// the thread that failed.
    #[error("archive operation aborted")]
    Aborted,
}

// ── Control ──────────────────────────────────────────────────────────────────

/// The cancellation trio shared by every thread of one operation.
pub struct PipelineControl {
    abort: Arc<AtomicBool>,
    stopfillqueue: AtomicBool,
    secthreads: AtomicUsize,
}

impl PipelineControl {
    pub fn new() -> Self {
        PipelineControl {
            abort: Arc::new(AtomicBool::new(false)),
            stopfillqueue: AtomicBool::new(false),
            secthreads: AtomicUsize::new(0),
        }
    }

    /// The flag queue waits re-check; cloned into the queue at construction.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Tell the producer to stop feeding the queue.
    pub fn set_stopfillqueue(&self) {
        self.stopfillqueue.store(true, Ordering::Relaxed);
    }

    pub fn stopfillqueue(&self) -> bool {
        self.stopfillqueue.load(Ordering::Relaxed)
    }

    /// True when the producer should wind down.
    pub fn interrupted(&self) -> bool {
        self.aborted() || self.stopfillqueue()
    }

    pub fn secthreads(&self) -> usize {
        self.secthreads.load(Ordering::Relaxed)
    }
}

impl Default for PipelineControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the live-thread count accurate even when a worker panics, and
/// converts a panic into an abort so no peer waits forever on a block that
/// will never complete.
struct SecThreadGuard {
    control: Arc<PipelineControl>,
}

impl SecThreadGuard {
    fn new(control: Arc<PipelineControl>) -> Self {
        control.secthreads.fetch_add(1, Ordering::Relaxed);
        SecThreadGuard { control }
    }
}

impl Drop for SecThreadGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("secondary thread panicked, aborting the operation");
            self.control.request_abort();
        }
        self.control.secthreads.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Closes the queue when dropped, so the consumer terminates even if the
/// producer unwinds.
struct CloseQueueGuard(Arc<BlockQueue>);

impl Drop for CloseQueueGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// Everything one archive operation shares across its threads.  The original
/// kept these as process-wide globals; here the context is an explicit value
/// handed to every worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub options: Arc<ArchiveOptions>,
    pub queue: Arc<BlockQueue>,
    pub codecs: Arc<dyn CodecProvider>,
    pub stats: Arc<Stats>,
    pub control: Arc<PipelineControl>,
}

impl PipelineContext {
    pub fn new(options: ArchiveOptions) -> Result<Self, PipelineError> {
        Self::with_codecs(options, Arc::new(BuiltinCodecs))
    }

    pub fn with_codecs(
        options: ArchiveOptions,
        codecs: Arc<dyn CodecProvider>,
    ) -> Result<Self, PipelineError> {
        options.validate()?;
        if options.compress_algo != CompressAlgo::None {
            // Fail before any thread starts rather than on the first block.
            codecs.resolve(options.compress_algo)?;
        }
        let control = Arc::new(PipelineControl::new());
        let queue = Arc::new(BlockQueue::new(options.queue_blocks, control.abort_flag()));
        Ok(PipelineContext {
            options: Arc::new(options),
            queue,
            codecs,
            stats: Arc::new(Stats::new()),
            control,
        })
    }
}

// ── Worker spawning ──────────────────────────────────────────────────────────

fn spawn_transformers(
    ctx: &PipelineContext,
    direction: TransformDirection,
) -> Result<Vec<JoinHandle<()>>, PipelineError> {
    (0..ctx.options.jobs)
        .map(|i| {
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("transform-{i}"))
                .spawn(move || {
                    let _guard = SecThreadGuard::new(ctx.control.clone());
                    transform_worker(&ctx, direction);
                })
                .map_err(PipelineError::from)
        })
        .collect()
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        // Panics already flipped the abort flag via the thread guard.
        let _ = handle.join();
    }
}

// ── Pack ─────────────────────────────────────────────────────────────────────

/// Archive `inputs` into `archive_path` (the `.fsa` extension is appended
/// when missing).  Returns the final statistics snapshot; the caller decides
/// the exit status from its error counters.
pub fn run_pack(
    options: ArchiveOptions,
    inputs: Vec<PathBuf>,
    archive_path: &Path,
) -> Result<StatsSnapshot, PipelineError> {
    let ctx = PipelineContext::new(options)?;
    let archive_id = generate_archive_id();
    let basepath = path_force_extension(archive_path, ".fsa");
    let writer = ArchiveWriter::create(&basepath, archive_id, ctx.options.volume_size)?;

    let producer = {
        let ctx = ctx.clone();
        thread::Builder::new().name("fs-reader".into()).spawn(move || {
            let _threads = SecThreadGuard::new(ctx.control.clone());
            let _close = CloseQueueGuard(ctx.queue.clone());
            if let Err(e) = pack::produce(&ctx, &inputs, archive_id) {
                error!(error = %e, "filesystem reader failed");
                ctx.control.set_stopfillqueue();
            }
        })?
    };
    let workers = spawn_transformers(&ctx, TransformDirection::Compress)?;

    let consumed = writer_consumer(&ctx, writer);

    join_all(workers);
    let _ = producer.join();
    debug!(secthreads = ctx.control.secthreads(), "pack teardown");

    consumed?;
    if ctx.control.interrupted() {
        return Err(PipelineError::Aborted);
    }
    Ok(ctx.stats.snapshot())
}

/// Consumer loop of the pack direction: dequeue in order, frame to disk.
fn writer_consumer(ctx: &PipelineContext, mut writer: ArchiveWriter) -> Result<(), PipelineError> {
    let result = (|| -> Result<(), PipelineError> {
        loop {
            match ctx.queue.dequeue() {
                Ok((_, Item::Header(head))) => writer.write_header(&head)?,
                Ok((_, Item::Block(block))) => writer.write_block(&block)?,
                Err(QueueError::EndOfQueue) => break,
                Err(e) => return Err(e.into()),
            }
        }
        writer.finish()?;
        Ok(())
    })();
    if result.is_err() {
        // Writing died: stop the producer and unblock every waiter.
        ctx.control.set_stopfillqueue();
        ctx.control.request_abort();
    }
    result
}

// ── Unpack ───────────────────────────────────────────────────────────────────

/// Restore `archive_path` into `dest`.  Per-block corruption is counted and
/// survived; structural errors abort the run.
pub fn run_unpack(
    options: ArchiveOptions,
    archive_path: &Path,
    dest: &Path,
) -> Result<StatsSnapshot, PipelineError> {
    let ctx = PipelineContext::new(options)?;
    let reader = ArchiveReader::open(archive_path)?;

    let producer = {
        let ctx = ctx.clone();
        thread::Builder::new().name("archive-reader".into()).spawn(move || {
            let _threads = SecThreadGuard::new(ctx.control.clone());
            let _close = CloseQueueGuard(ctx.queue.clone());
            if let Err(e) = reader_producer(&ctx, reader) {
                error!(error = %e, "archive reader failed");
                ctx.control.set_stopfillqueue();
            }
        })?
    };
    let workers = spawn_transformers(&ctx, TransformDirection::Decompress)?;

    let consumed = unpack::consume(&ctx, dest);
    if consumed.is_err() {
        ctx.control.set_stopfillqueue();
        ctx.control.request_abort();
    }

    join_all(workers);
    let _ = producer.join();
    debug!(secthreads = ctx.control.secthreads(), "unpack teardown");

    consumed?;
    if ctx.control.interrupted() {
        return Err(PipelineError::Aborted);
    }
    Ok(ctx.stats.snapshot())
}

/// Producer loop of the restore direction: parse framed items and feed the
/// queue in archive order.
fn reader_producer(ctx: &PipelineContext, mut reader: ArchiveReader) -> Result<(), PipelineError> {
    while !ctx.control.interrupted() {
        match reader.next_item()? {
            Some(crate::io_stream::ArchiveItem::Header(head)) => {
                match ctx.queue.enqueue_header(head) {
                    Ok(_) => {}
                    Err(QueueError::EndOfQueue) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            Some(crate::io_stream::ArchiveItem::Block(block)) => {
                match ctx.queue.enqueue_block(block, Status::Todo) {
                    Ok(_) => {}
                    Err(QueueError::EndOfQueue) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            None => break,
        }
    }
    Ok(())
}

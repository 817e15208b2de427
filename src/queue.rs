//! Bounded ordered pipeline queue.
//!
//! The single mailbox connecting the producer, the transformer pool and the
//! consumer.  Two item kinds flow through it in one FIFO sequence:
//!
//! - **blocks** — file payload chunks.  Created TODO by the producer, claimed
//!   (TODO→IN_PROGRESS) by a transformer, completed (→DONE) in place.
//! - **headers** — metadata records.  Born DONE, never transformed.
//!
//! Delivery to the consumer is strictly in `itemnum` order: `dequeue*` waits
//! on the *head* item until it is DONE, so transformers may finish out of
//! order without reordering the archive.  Backpressure applies to blocks
//! only: `enqueue_block` waits while more than `blkmax` blocks are in flight,
//! headers always flow freely (throttling them could deadlock the pipeline
//! once the block budget is exhausted).
//!
//! Every wait is a ~1 s timed condvar wait in a loop that re-checks the
//! predicate, the closed flag and the shared abort flag, so cancellation is
//! observed within one timeout period without requiring the canceller to
//! wake each waiter.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::dico::Dico;
use crate::format::{CompressAlgo, CryptAlgo, Magic};

/// Timed-wait period for every blocking queue operation.
pub const QUEUE_WAIT: Duration = Duration::from_secs(1);

// ── Item payloads ────────────────────────────────────────────────────────────

/// One unit of file payload moving through the pipeline.
///
/// `data` is exclusively owned by whichever stage currently holds the
/// `BlockInfo`; ownership moves across the queue with the struct.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload bytes in their current representation (raw, compressed, or
    /// encrypted, depending on pipeline position).
    pub data: Vec<u8>,
    /// Original uncompressed byte count.
    pub real_size: u64,
    /// Size after compression, before the cipher.
    pub comp_size: u64,
    /// Final on-archive size (equals `comp_size` when no cipher ran).
    pub archive_size: u64,
    /// Logical offset of this block within its source file.
    pub offset: u64,
    /// Codec actually applied (None when compression did not shrink the
    /// block, even if one was requested).
    pub comp_algo: CompressAlgo,
    /// Cipher applied.
    pub crypt_algo: CryptAlgo,
    /// Fletcher-32 of the final on-archive bytes.
    pub checksum: u32,
}

impl BlockInfo {
    /// A raw block fresh from the producer.
    pub fn raw(data: Vec<u8>, offset: u64) -> Self {
        let real_size = data.len() as u64;
        BlockInfo {
            data,
            real_size,
            comp_size: 0,
            archive_size: 0,
            offset,
            comp_algo: CompressAlgo::None,
            crypt_algo: CryptAlgo::None,
            checksum: 0,
        }
    }
}

/// A framed metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    /// Item kind tag, one of the closed magic set.
    pub magic: Magic,
    /// 0-based filesystem index this header belongs to.
    pub fsid: u16,
    /// Typed key/value body.
    pub dico: Dico,
}

impl HeadInfo {
    pub fn new(magic: &Magic, fsid: u16, dico: Dico) -> Self {
        HeadInfo { magic: *magic, fsid, dico }
    }
}

/// A dequeued item.
#[derive(Debug)]
pub enum Item {
    Block(BlockInfo),
    Header(HeadInfo),
}

/// What `peek_next` saw at the head without removing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Block,
    Header(Magic),
}

/// Block transformation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Todo,
    InProgress,
    Done,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is closed and drained (or the run was aborted).  Normal
    /// terminal signal, never a failure.
    #[error("end of queue")]
    EndOfQueue,
    /// `itemnum` lookup missed — the item was already dequeued or discarded.
    #[error("queue item {0} not found")]
    NotFound(u64),
    /// The head item's kind did not match the caller's expectation; a
    /// structural bug in the producer.
    #[error("wrong item type at queue head: expected {expected}")]
    WrongType { expected: &'static str },
}

// ── Internal state ───────────────────────────────────────────────────────────

enum Slot {
    Block(BlockInfo),
    Header(HeadInfo),
}

struct QueueSlot {
    itemnum: u64,
    status: Status,
    body: Slot,
}

impl QueueSlot {
    fn is_block(&self) -> bool {
        matches!(self.body, Slot::Block(_))
    }
}

struct State {
    items: VecDeque<QueueSlot>,
    blkcount: usize,
    curitemnum: u64,
    endofqueue: bool,
}

impl State {
    fn drained(&self) -> bool {
        self.items.is_empty() && self.endofqueue
    }
}

// ── Queue ────────────────────────────────────────────────────────────────────

pub struct BlockQueue {
    state: Mutex<State>,
    cond: Condvar,
    blkmax: usize,
    abort: Arc<AtomicBool>,
}

impl BlockQueue {
    /// Create a queue admitting at most `blkmax`+1 in-flight blocks.  Waiting
    /// operations observe `abort` within one [`QUEUE_WAIT`] period and return
    /// [`QueueError::EndOfQueue`].
    pub fn new(blkmax: usize, abort: Arc<AtomicBool>) -> Self {
        BlockQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                blkcount: 0,
                curitemnum: 1,
                endofqueue: false,
            }),
            cond: Condvar::new(),
            blkmax,
            abort,
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    // ── Producer interface ───────────────────────────────────────────────────

    /// Append a block, waiting while the block budget is exhausted.
    /// Returns the assigned `itemnum`.
    pub fn enqueue_block(&self, block: BlockInfo, status: Status) -> Result<u64, QueueError> {
        let mut st = self.state.lock();
        loop {
            if st.endofqueue || self.aborted() {
                return Err(QueueError::EndOfQueue);
            }
            if st.blkcount <= self.blkmax {
                break;
            }
            self.cond.wait_for(&mut st, QUEUE_WAIT);
        }
        let itemnum = st.curitemnum;
        st.curitemnum += 1;
        st.items.push_back(QueueSlot {
            itemnum,
            status,
            body: Slot::Block(block),
        });
        st.blkcount += 1;
        drop(st);
        self.cond.notify_all();
        Ok(itemnum)
    }

    /// Append a header.  Headers are born DONE, do not count against the
    /// block budget, and never wait for it.
    pub fn enqueue_header(&self, head: HeadInfo) -> Result<u64, QueueError> {
        let mut st = self.state.lock();
        if st.endofqueue || self.aborted() {
            return Err(QueueError::EndOfQueue);
        }
        let itemnum = st.curitemnum;
        st.curitemnum += 1;
        st.items.push_back(QueueSlot {
            itemnum,
            status: Status::Done,
            body: Slot::Header(head),
        });
        drop(st);
        self.cond.notify_all();
        Ok(itemnum)
    }

    /// Close the queue: no further enqueue succeeds.  Idempotent.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.endofqueue = true;
        drop(st);
        self.cond.notify_all();
    }

    // ── Transformer interface ────────────────────────────────────────────────

    /// Claim the earliest block still TODO, flipping it to IN_PROGRESS and
    /// moving its payload out to the caller.  Waits until a TODO block
    /// appears or the queue is closed and fully drained.
    pub fn claim_next_todo(&self) -> Result<(u64, BlockInfo), QueueError> {
        let mut st = self.state.lock();
        loop {
            if self.aborted() || st.drained() {
                return Err(QueueError::EndOfQueue);
            }
            let found = st
                .items
                .iter()
                .position(|s| s.is_block() && s.status == Status::Todo);
            if let Some(idx) = found {
                let slot = &mut st.items[idx];
                slot.status = Status::InProgress;
                let itemnum = slot.itemnum;
                let block = match &mut slot.body {
                    Slot::Block(b) => mem::take(b),
                    Slot::Header(_) => unreachable!("is_block checked above"),
                };
                drop(st);
                self.cond.notify_all();
                return Ok((itemnum, block));
            }
            self.cond.wait_for(&mut st, QUEUE_WAIT);
        }
    }

    /// Hand a transformed block back, marking its item DONE.  Returns
    /// [`QueueError::NotFound`] if the item was discarded meanwhile (normal
    /// during shutdown).
    pub fn complete_block(&self, itemnum: u64, block: BlockInfo) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        match st.items.iter_mut().find(|s| s.itemnum == itemnum) {
            Some(slot) => match &mut slot.body {
                Slot::Block(b) => {
                    *b = block;
                    slot.status = Status::Done;
                    drop(st);
                    self.cond.notify_all();
                    Ok(())
                }
                Slot::Header(_) => Err(QueueError::WrongType { expected: "block" }),
            },
            None => Err(QueueError::NotFound(itemnum)),
        }
    }

    // ── Consumer interface ───────────────────────────────────────────────────

    /// Wait until the head item is DONE, then remove and return it.
    pub fn dequeue(&self) -> Result<(u64, Item), QueueError> {
        let mut st = self.wait_head_done()?;
        let slot = st.items.pop_front().expect("head checked by wait_head_done");
        if slot.is_block() {
            st.blkcount -= 1;
        }
        drop(st);
        self.cond.notify_all();
        let item = match slot.body {
            Slot::Block(b) => Item::Block(b),
            Slot::Header(h) => Item::Header(h),
        };
        Ok((slot.itemnum, item))
    }

    /// Like [`dequeue`](Self::dequeue) but asserts the head is a block.
    /// The head is left in place on a type mismatch.
    pub fn dequeue_block(&self) -> Result<(u64, BlockInfo), QueueError> {
        let mut st = self.wait_head_done()?;
        if !st.items.front().expect("head checked").is_block() {
            return Err(QueueError::WrongType { expected: "block" });
        }
        let slot = st.items.pop_front().expect("head checked");
        st.blkcount -= 1;
        drop(st);
        self.cond.notify_all();
        match slot.body {
            Slot::Block(b) => Ok((slot.itemnum, b)),
            Slot::Header(_) => unreachable!("is_block checked above"),
        }
    }

    /// Like [`dequeue`](Self::dequeue) but asserts the head is a header.
    pub fn dequeue_header(&self) -> Result<(u64, HeadInfo), QueueError> {
        let mut st = self.wait_head_done()?;
        if st.items.front().expect("head checked").is_block() {
            return Err(QueueError::WrongType { expected: "header" });
        }
        let slot = st.items.pop_front().expect("head checked");
        drop(st);
        self.cond.notify_all();
        match slot.body {
            Slot::Header(h) => Ok((slot.itemnum, h)),
            Slot::Block(_) => unreachable!("kind checked above"),
        }
    }

    /// Wait until the head item is DONE and report its kind (and magic, for
    /// headers) without removing it.
    pub fn peek_next(&self) -> Result<ItemKind, QueueError> {
        let st = self.wait_head_done()?;
        let kind = match &st.items.front().expect("head checked").body {
            Slot::Block(_) => ItemKind::Block,
            Slot::Header(h) => ItemKind::Header(h.magic),
        };
        Ok(kind)
    }

    /// Wait until the head item is no longer IN_PROGRESS, then drop it
    /// without reading it.  Used on abort/unwind paths.
    pub fn discard_head(&self) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        loop {
            if self.aborted() || st.drained() {
                return Err(QueueError::EndOfQueue);
            }
            let head_ready =
                matches!(st.items.front(), Some(slot) if slot.status != Status::InProgress);
            if head_ready {
                break;
            }
            self.cond.wait_for(&mut st, QUEUE_WAIT);
        }
        let slot = st.items.pop_front().expect("head checked above");
        if slot.is_block() {
            st.blkcount -= 1;
        }
        drop(st);
        self.cond.notify_all();
        Ok(())
    }

    /// Lock the state and wait until the head item exists and is DONE.
    /// Returns the guard, or [`QueueError::EndOfQueue`] once the queue is
    /// closed and empty (or the run aborted).
    fn wait_head_done(&self) -> Result<parking_lot::MutexGuard<'_, State>, QueueError> {
        let mut st = self.state.lock();
        loop {
            if self.aborted() || st.drained() {
                return Err(QueueError::EndOfQueue);
            }
            let head_done =
                matches!(st.items.front(), Some(slot) if slot.status == Status::Done);
            if head_done {
                return Ok(st);
            }
            self.cond.wait_for(&mut st, QUEUE_WAIT);
        }
    }

    // ── Observers ────────────────────────────────────────────────────────────

    /// True once the queue is closed and every item has been consumed.
    pub fn is_drained(&self) -> bool {
        self.state.lock().drained()
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().endofqueue
    }

    /// Items currently queued (both kinds).
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks currently queued (any status).
    pub fn block_count(&self) -> usize {
        self.state.lock().blkcount
    }

    /// Blocks not yet DONE (TODO or IN_PROGRESS).
    pub fn todo_count(&self) -> usize {
        self.state
            .lock()
            .items
            .iter()
            .filter(|s| s.is_block() && s.status != Status::Done)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn queue(blkmax: usize) -> (Arc<BlockQueue>, Arc<AtomicBool>) {
        let abort = Arc::new(AtomicBool::new(false));
        (Arc::new(BlockQueue::new(blkmax, abort.clone())), abort)
    }

    fn block(n: u8) -> BlockInfo {
        BlockInfo::raw(vec![n; 16], n as u64 * 16)
    }

    fn header() -> HeadInfo {
        HeadInfo::new(crate::format::MAGIC_OBJECT, 0, Dico::new())
    }

    #[test]
    fn itemnums_increase_without_gaps() {
        let (q, _) = queue(64);
        let mut nums = Vec::new();
        for i in 0..10u8 {
            nums.push(q.enqueue_block(block(i), Status::Done).unwrap());
            nums.push(q.enqueue_header(header()).unwrap());
        }
        assert_eq!(nums, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn claim_takes_earliest_todo() {
        let (q, _) = queue(64);
        for i in 0..3u8 {
            q.enqueue_block(block(i), Status::Todo).unwrap();
        }
        let (n1, b1) = q.claim_next_todo().unwrap();
        let (n2, _) = q.claim_next_todo().unwrap();
        let (n3, _) = q.claim_next_todo().unwrap();
        assert_eq!((n1, n2, n3), (1, 2, 3));
        assert_eq!(b1.data, vec![0u8; 16]);
        assert_eq!(q.todo_count(), 3); // all in progress, none done
    }

    #[test]
    fn dequeue_waits_for_head_even_when_later_items_finish_first() {
        let (q, _) = queue(64);
        q.enqueue_block(block(1), Status::Todo).unwrap();
        q.enqueue_block(block(2), Status::Todo).unwrap();
        let (n1, b1) = q.claim_next_todo().unwrap();
        let (n2, b2) = q.claim_next_todo().unwrap();
        // Finish the second block first.
        q.complete_block(n2, b2).unwrap();

        let qc = q.clone();
        let consumer = thread::spawn(move || qc.dequeue_block().unwrap().0);
        thread::sleep(Duration::from_millis(100));
        q.complete_block(n1, b1).unwrap();
        assert_eq!(consumer.join().unwrap(), 1);
        assert_eq!(q.dequeue_block().unwrap().0, 2);
    }

    #[test]
    fn headers_bypass_the_block_budget() {
        let (q, _) = queue(0);
        q.enqueue_block(block(1), Status::Done).unwrap();
        // blkcount(1) > blkmax(0): a second block would wait, headers must not.
        let n = q.enqueue_header(header()).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn backpressure_blocks_the_producer() {
        let (q, _) = queue(1);
        q.enqueue_block(block(1), Status::Done).unwrap();
        q.enqueue_block(block(2), Status::Done).unwrap();

        let qc = q.clone();
        let producer = thread::spawn(move || {
            qc.enqueue_block(block(3), Status::Done).unwrap();
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(q.block_count(), 2, "third enqueue must be parked");
        q.dequeue_block().unwrap();
        producer.join().unwrap();
        assert_eq!(q.block_count(), 2);
    }

    #[test]
    fn close_is_idempotent_and_rejects_enqueue() {
        let (q, _) = queue(8);
        q.close();
        q.close();
        assert!(q.is_closed());
        assert_eq!(
            q.enqueue_block(block(1), Status::Todo),
            Err(QueueError::EndOfQueue)
        );
        assert_eq!(q.enqueue_header(header()), Err(QueueError::EndOfQueue));
        assert!(q.is_drained());
        assert_eq!(q.dequeue().err(), Some(QueueError::EndOfQueue));
    }

    #[test]
    fn wrong_type_leaves_head_in_place() {
        let (q, _) = queue(8);
        q.enqueue_header(header()).unwrap();
        assert_eq!(
            q.dequeue_block().err(),
            Some(QueueError::WrongType { expected: "block" })
        );
        let (n, h) = q.dequeue_header().unwrap();
        assert_eq!(n, 1);
        assert_eq!(&h.magic, crate::format::MAGIC_OBJECT);
    }

    #[test]
    fn complete_after_dequeue_reports_not_found() {
        let (q, _) = queue(8);
        q.enqueue_block(block(1), Status::Todo).unwrap();
        let (n, b) = q.claim_next_todo().unwrap();
        q.complete_block(n, b.clone()).unwrap();
        q.dequeue_block().unwrap();
        assert_eq!(q.complete_block(n, b), Err(QueueError::NotFound(n)));
    }

    #[test]
    fn discard_head_waits_for_in_progress() {
        let (q, _) = queue(8);
        q.enqueue_block(block(1), Status::Todo).unwrap();
        let (n, b) = q.claim_next_todo().unwrap();

        let qc = q.clone();
        let discarder = thread::spawn(move || qc.discard_head().unwrap());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(q.len(), 1, "discard must wait while the block is claimed");
        q.complete_block(n, b).unwrap();
        discarder.join().unwrap();
        assert_eq!(q.len(), 0);
        assert_eq!(q.block_count(), 0);
    }

    #[test]
    fn abort_unblocks_every_waiter_quickly() {
        let (q, abort) = queue(8);
        let started = Instant::now();
        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let qc = q.clone();
                thread::spawn(move || match i {
                    0 => qc.dequeue().err(),
                    1 => qc.claim_next_todo().map(|_| ()).err(),
                    _ => qc.peek_next().map(|_| ()).err(),
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        abort.store(true, Ordering::Relaxed);
        for w in waiters {
            assert_eq!(w.join().unwrap(), Some(QueueError::EndOfQueue));
        }
        assert!(started.elapsed() < Duration::from_secs(2), "cancellation latency bound");
    }

    #[test]
    fn concurrent_pipeline_preserves_fifo_and_backpressure() {
        const BLOCKS: u64 = 200;
        const BLKMAX: usize = 8;
        let (q, _) = queue(BLKMAX);

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..BLOCKS {
                    let mut b = block((i % 251) as u8);
                    b.offset = i;
                    q.enqueue_block(b, Status::Todo).unwrap();
                    if i % 25 == 0 {
                        q.enqueue_header(header()).unwrap();
                    }
                }
                q.close();
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || loop {
                    match q.claim_next_todo() {
                        Ok((n, mut b)) => {
                            b.data.reverse();
                            let _ = q.complete_block(n, b);
                        }
                        Err(QueueError::EndOfQueue) => break,
                        Err(e) => panic!("unexpected: {e}"),
                    }
                })
            })
            .collect();

        let mut last = 0u64;
        let mut blocks_seen = 0u64;
        loop {
            match q.dequeue() {
                Ok((n, item)) => {
                    assert!(n > last, "itemnum order violated: {n} after {last}");
                    last = n;
                    if matches!(item, Item::Block(_)) {
                        blocks_seen += 1;
                    }
                    assert!(
                        q.block_count() <= BLKMAX + 1,
                        "block budget exceeded: {}",
                        q.block_count()
                    );
                }
                Err(QueueError::EndOfQueue) => break,
                Err(e) => panic!("unexpected: {e}"),
            }
        }
        assert_eq!(blocks_seen, BLOCKS);
        assert!(q.is_drained());

        producer.join().unwrap();
        for w in workers {
            w.join().unwrap();
        }
    }
}

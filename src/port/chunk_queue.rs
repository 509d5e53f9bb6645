//! Bounded SPSC queue of chunk references in shared memory
//!
//! One distributor pushes (only one publisher is ever matched per port),
//! one consuming application pops. The producer owns the tail; head is
//! advanced by CAS because under DISCARD_OLDEST the producer also pops to
//! make room. Slots hold packed [`ChunkRef`]s in `AtomicU64`s.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crate::{
    error::{MonetError, Result},
    layout::constants::{MAX_QUEUE_CAPACITY, QUEUE_MAGIC},
    layout::ChunkRef,
};

/// Overflow policy applied when a push meets a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum QueuePolicy {
    /// Pop and release the oldest entry, then push the new one
    DiscardOldest = 0,
    /// Producer spins until the consumer frees a slot; couples producer
    /// throughput to the slowest consumer and must be selected explicitly
    BlockProducer = 1,
}

impl QueuePolicy {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::DiscardOldest),
            1 => Ok(Self::BlockProducer),
            other => Err(MonetError::invalid_parameter(
                "policy",
                format!("unknown queue policy {}", other),
            )),
        }
    }
}

/// Outcome of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The queue was full; the returned chunk was evicted and its
    /// reference must be released by the caller
    PushedEvicted(ChunkRef),
}

/// Queue state resident in shared memory
#[repr(C)]
pub struct ChunkQueueData {
    pub magic: u32,
    /// Power-of-two slot count, at most [`MAX_QUEUE_CAPACITY`]
    pub capacity: u32,
    pub policy: u32,
    /// 1 while wired to a live publisher; cleared on unwire or reap
    pub connected: AtomicU32,
    pub head: AtomicU64,
    pub tail: AtomicU64,
    pub slots: [AtomicU64; MAX_QUEUE_CAPACITY],
}

/// Process-local view of a shared chunk queue
#[derive(Debug, Clone, Copy)]
pub struct ChunkQueue {
    data: NonNull<ChunkQueueData>,
}

impl ChunkQueue {
    /// Initialize queue state in place
    ///
    /// # Safety
    /// `ptr` must point to writable memory of at least
    /// `size_of::<ChunkQueueData>()` bytes not yet visible to any peer.
    pub unsafe fn init(ptr: *mut ChunkQueueData, capacity: u32, policy: QueuePolicy) -> Result<Self> {
        if capacity == 0
            || !capacity.is_power_of_two()
            || capacity as usize > MAX_QUEUE_CAPACITY
        {
            return Err(MonetError::invalid_parameter(
                "capacity",
                format!("capacity must be a power of 2 up to {}", MAX_QUEUE_CAPACITY),
            ));
        }

        std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<ChunkQueueData>());
        let data = &mut *ptr;
        data.magic = QUEUE_MAGIC;
        data.capacity = capacity;
        data.policy = policy as u32;
        for slot in data.slots.iter() {
            slot.store(ChunkRef::NULL_RAW, Ordering::Relaxed);
        }
        Ok(Self {
            data: NonNull::new_unchecked(ptr),
        })
    }

    /// Attach to an initialized queue
    ///
    /// # Safety
    /// `ptr` must point to memory initialized by [`ChunkQueue::init`].
    pub unsafe fn attach(ptr: *mut ChunkQueueData) -> Result<Self> {
        if (*ptr).magic != QUEUE_MAGIC {
            return Err(MonetError::invariant("chunk queue magic mismatch"));
        }
        Ok(Self {
            data: NonNull::new_unchecked(ptr),
        })
    }

    fn data(&self) -> &ChunkQueueData {
        unsafe { self.data.as_ref() }
    }

    pub fn capacity(&self) -> u32 {
        self.data().capacity
    }

    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy::from_u32(self.data().policy).expect("queue holds a valid policy")
    }

    fn mask(&self) -> u64 {
        (self.data().capacity - 1) as u64
    }

    fn slot(&self, position: u64) -> &AtomicU64 {
        &self.data().slots[(position & self.mask()) as usize]
    }

    /// Whether a live publisher is wired to this queue
    pub fn is_connected(&self) -> bool {
        self.data().connected.load(Ordering::Acquire) == 1
    }

    pub fn mark_connected(&self) {
        self.data().connected.store(1, Ordering::Release);
    }

    /// Sever the link; unblocks a producer stuck in BLOCK_PRODUCER and
    /// tells the consumer the publisher is gone
    pub fn mark_disconnected(&self) {
        self.data().connected.store(0, Ordering::Release);
    }

    /// Producer-side push applying this queue's overflow policy
    ///
    /// Under DISCARD_OLDEST the evicted reference is handed back to the
    /// caller, which is responsible for releasing it.
    pub fn try_push(&self, chunk: ChunkRef) -> Result<PushOutcome> {
        let data = self.data();
        let mut evicted = None;

        loop {
            let tail = data.tail.load(Ordering::Relaxed);
            let head = data.head.load(Ordering::Acquire);

            if tail.wrapping_sub(head) >= data.capacity as u64 {
                match self.policy() {
                    QueuePolicy::DiscardOldest => {
                        let raw = self.slot(head).load(Ordering::Acquire);
                        match data.head.compare_exchange(
                            head,
                            head.wrapping_add(1),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                evicted = ChunkRef::from_raw(raw);
                            }
                            Err(_) => {
                                // Consumer claimed the slot first; space
                                // may already be free, re-evaluate.
                                std::hint::spin_loop();
                                continue;
                            }
                        }
                    }
                    QueuePolicy::BlockProducer => {
                        if !self.is_connected() {
                            return Err(MonetError::SubscriberGone);
                        }
                        std::hint::spin_loop();
                        std::thread::sleep(Duration::from_micros(10));
                        continue;
                    }
                }
            }

            // Slot content must be visible before the tail publishes it.
            self.slot(tail).store(chunk.to_raw(), Ordering::Release);
            data.tail.store(tail.wrapping_add(1), Ordering::Release);

            return Ok(match evicted {
                Some(old) => PushOutcome::PushedEvicted(old),
                None => PushOutcome::Pushed,
            });
        }
    }

    /// Consumer-side pop; the caller inherits one reference on the chunk
    pub fn try_pop(&self) -> Option<ChunkRef> {
        let data = self.data();
        loop {
            let head = data.head.load(Ordering::Acquire);
            let tail = data.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            // Read before claiming: the slot cannot be rewritten while the
            // head still points at it.
            let raw = self.slot(head).load(Ordering::Acquire);
            match data.head.compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return ChunkRef::from_raw(raw),
                Err(_) => {
                    std::hint::spin_loop();
                    continue;
                }
            }
        }
    }

    /// Approximate number of queued chunks
    pub fn size_snapshot(&self) -> usize {
        let data = self.data();
        let tail = data.tail.load(Ordering::Acquire);
        let head = data.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    /// Drain every pending chunk, returning the references for release
    pub fn clear(&self) -> Vec<ChunkRef> {
        let mut drained = Vec::new();
        while let Some(chunk) = self.try_pop() {
            drained.push(chunk);
        }
        drained
    }

    /// Block the consumer until a chunk arrives or the timeout elapses
    ///
    /// Returns `Ok(None)` on timeout and [`MonetError::PublisherGone`] once
    /// the queue is disconnected and drained.
    pub fn wait_for_chunk(&self, timeout: Duration) -> Result<Option<ChunkRef>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(chunk) = self.try_pop() {
                return Ok(Some(chunk));
            }
            if !self.is_connected() {
                return Err(MonetError::PublisherGone);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::hint::spin_loop();
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

unsafe impl Send for ChunkQueue {}
unsafe impl Sync for ChunkQueue {}

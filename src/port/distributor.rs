//! Chunk distributor: publisher-side fan-out with history for late joiners
//!
//! The distributor keeps a bounded set of subscriber queue references and a
//! bounded FIFO history ring, both in shared memory. `deliver` is called
//! only by the single matched publisher; `add_subscriber` and
//! `remove_subscriber` are called by the daemon wiring thread, so the slot
//! array uses atomic compare-and-swap rather than assuming one writer.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    error::{MonetError, Result},
    layout::constants::{MAX_HISTORY_CAPACITY, MAX_SUBSCRIBERS_PER_PUBLISHER},
    layout::{ChunkRef, RelativePointer, SegmentTable},
    memory::{acquire_chunk, release_chunk},
};

use super::chunk_queue::{ChunkQueue, ChunkQueueData, PushOutcome};

/// Distributor state resident in shared memory
#[repr(C)]
pub struct ChunkDistributorData {
    /// Packed [`RelativePointer`]s to subscriber queues; `NULL_RAW` when empty
    pub subscribers: [AtomicU64; MAX_SUBSCRIBERS_PER_PUBLISHER],
    /// Fixed history capacity chosen at port creation (may be 0)
    pub history_capacity: u32,
    _pad: u32,
    /// Monotonic count of chunks ever pushed into history
    pub history_count: AtomicU64,
    /// History ring of packed [`ChunkRef`]s
    pub history: [AtomicU64; MAX_HISTORY_CAPACITY],
}

/// Publisher-side view of a shared distributor
#[derive(Debug)]
pub struct ChunkDistributor {
    data: NonNull<ChunkDistributorData>,
    table: Arc<SegmentTable>,
}

impl ChunkDistributor {
    /// Initialize distributor state in place
    ///
    /// # Safety
    /// `ptr` must point to writable memory of at least
    /// `size_of::<ChunkDistributorData>()` bytes not yet shared.
    pub unsafe fn init(
        ptr: *mut ChunkDistributorData,
        history_capacity: u32,
        table: Arc<SegmentTable>,
    ) -> Result<Self> {
        if history_capacity as usize > MAX_HISTORY_CAPACITY {
            return Err(MonetError::invalid_parameter(
                "history_capacity",
                format!("history capacity is bounded by {}", MAX_HISTORY_CAPACITY),
            ));
        }

        std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<ChunkDistributorData>());
        let data = &mut *ptr;
        data.history_capacity = history_capacity;
        for slot in data.subscribers.iter() {
            slot.store(RelativePointer::NULL_RAW, Ordering::Relaxed);
        }
        for slot in data.history.iter() {
            slot.store(ChunkRef::NULL_RAW, Ordering::Relaxed);
        }
        Ok(Self {
            data: NonNull::new_unchecked(ptr),
            table,
        })
    }

    /// Attach to initialized distributor state
    ///
    /// # Safety
    /// `ptr` must point to memory initialized by [`ChunkDistributor::init`].
    pub unsafe fn attach(ptr: *mut ChunkDistributorData, table: Arc<SegmentTable>) -> Self {
        Self {
            data: NonNull::new_unchecked(ptr),
            table,
        }
    }

    fn data(&self) -> &ChunkDistributorData {
        unsafe { self.data.as_ref() }
    }

    fn queue_at(&self, queue_ref: RelativePointer) -> Result<ChunkQueue> {
        let ptr = self.table.resolve(queue_ref)? as *mut ChunkQueueData;
        unsafe { ChunkQueue::attach(ptr) }
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.data()
            .subscribers
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != RelativePointer::NULL_RAW)
            .count()
    }

    pub fn history_capacity(&self) -> u32 {
        self.data().history_capacity
    }

    /// Chunks currently retained in the history ring
    pub fn history_len(&self) -> u32 {
        let count = self.data().history_count.load(Ordering::Acquire);
        count.min(self.data().history_capacity as u64) as u32
    }

    /// Attach a subscriber queue and replay recent history into it
    ///
    /// Up to `min(history_len, history_request)` entries are delivered,
    /// oldest first, before the slot is installed; chunks published while
    /// the replay runs are not duplicated. Idempotent for an already
    /// attached queue. Fails with `TooManySubscribers` when the set is full.
    pub fn add_subscriber(&self, queue_ref: RelativePointer, history_request: u32) -> Result<()> {
        let data = self.data();
        let raw = queue_ref.to_raw();

        for slot in data.subscribers.iter() {
            if slot.load(Ordering::Acquire) == raw {
                return Ok(());
            }
        }

        let queue = self.queue_at(queue_ref)?;
        self.replay_history(&queue, history_request)?;
        queue.mark_connected();

        for slot in data.subscribers.iter() {
            if slot
                .compare_exchange(
                    RelativePointer::NULL_RAW,
                    raw,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }

        queue.mark_disconnected();
        Err(MonetError::TooManySubscribers {
            capacity: MAX_SUBSCRIBERS_PER_PUBLISHER,
        })
    }

    fn replay_history(&self, queue: &ChunkQueue, history_request: u32) -> Result<()> {
        let data = self.data();
        let capacity = data.history_capacity as u64;
        if capacity == 0 || history_request == 0 {
            return Ok(());
        }

        let count = data.history_count.load(Ordering::Acquire);
        let available = count.min(capacity);
        let wanted = available.min(history_request as u64);

        for position in (count - wanted)..count {
            let raw = data.history[(position % capacity) as usize].load(Ordering::Acquire);
            let Some(chunk) = ChunkRef::from_raw(raw) else {
                continue;
            };
            acquire_chunk(&self.table, chunk)?;
            match queue.try_push(chunk)? {
                PushOutcome::Pushed => {}
                PushOutcome::PushedEvicted(old) => {
                    release_chunk(&self.table, old)?;
                }
            }
        }
        Ok(())
    }

    /// Detach a subscriber queue by reference equality; idempotent
    ///
    /// After this returns, no further deliveries target the queue; pushes
    /// already in flight may still land and must be drained by the consumer.
    pub fn remove_subscriber(&self, queue_ref: RelativePointer) -> Result<()> {
        let data = self.data();
        let raw = queue_ref.to_raw();

        for slot in data.subscribers.iter() {
            if slot
                .compare_exchange(raw, RelativePointer::NULL_RAW, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.queue_at(queue_ref)?.mark_disconnected();
                return Ok(());
            }
        }
        Ok(())
    }

    /// Fan a chunk out to every attached subscriber, then park it in history
    ///
    /// Consumes the caller's reference: it either moves into the history
    /// ring or is released when the ring has no capacity. Each subscriber
    /// queue takes its own reference.
    pub fn deliver(&self, chunk: ChunkRef) -> Result<()> {
        let data = self.data();

        for slot in data.subscribers.iter() {
            let raw = slot.load(Ordering::Acquire);
            let Some(queue_ref) = RelativePointer::from_raw(raw) else {
                continue;
            };
            let queue = self.queue_at(queue_ref)?;

            acquire_chunk(&self.table, chunk)?;
            match queue.try_push(chunk) {
                Ok(PushOutcome::Pushed) => {}
                Ok(PushOutcome::PushedEvicted(old)) => {
                    release_chunk(&self.table, old)?;
                }
                Err(MonetError::SubscriberGone) => {
                    // Blocked push cancelled by a disconnection; the queue
                    // never took the reference.
                    release_chunk(&self.table, chunk)?;
                }
                Err(e) => return Err(e),
            }
        }

        self.push_history(chunk)
    }

    fn push_history(&self, chunk: ChunkRef) -> Result<()> {
        let data = self.data();
        let capacity = data.history_capacity as u64;
        if capacity == 0 {
            release_chunk(&self.table, chunk)?;
            return Ok(());
        }

        let count = data.history_count.load(Ordering::Acquire);
        let old = data.history[(count % capacity) as usize].swap(chunk.to_raw(), Ordering::AcqRel);
        data.history_count.store(count + 1, Ordering::Release);

        if let Some(evicted) = ChunkRef::from_raw(old) {
            release_chunk(&self.table, evicted)?;
        }
        Ok(())
    }

    /// Release every history reference; used when the publisher stops
    /// offering or its process is reaped
    pub fn release_history(&self) -> Result<()> {
        let data = self.data();
        for slot in data.history.iter() {
            let raw = slot.swap(ChunkRef::NULL_RAW, Ordering::AcqRel);
            if let Some(chunk) = ChunkRef::from_raw(raw) {
                release_chunk(&self.table, chunk)?;
            }
        }
        data.history_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Disconnect every subscriber queue and empty the slot set
    pub fn detach_all(&self) -> Result<()> {
        let data = self.data();
        for slot in data.subscribers.iter() {
            let raw = slot.swap(RelativePointer::NULL_RAW, Ordering::AcqRel);
            if let Some(queue_ref) = RelativePointer::from_raw(raw) {
                self.queue_at(queue_ref)?.mark_disconnected();
            }
        }
        Ok(())
    }
}

unsafe impl Send for ChunkDistributor {}
unsafe impl Sync for ChunkDistributor {}

//! Publisher port: chunk loaning, publication, and offer state

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    error::{MonetError, Result},
    layout::constants::PUBLISHER_PORT_MAGIC,
    layout::{ChunkRef, SegmentId, SegmentTable},
    memory::{mempool::mempool_for_payload, MemPool},
};

use super::distributor::{ChunkDistributor, ChunkDistributorData};

const STATE_UNOFFERED: u32 = 0;
const STATE_OFFERED: u32 = 1;

/// Publisher port state resident in shared memory
#[repr(C)]
pub struct PublisherPortData {
    pub magic: u32,
    /// `STATE_OFFERED` while the owning process is alive; cleared by the
    /// daemon when the process is reaped
    pub state: AtomicU32,
    /// Cap on chunks loaned but not yet published or released
    pub allocation_budget: u32,
    pub in_flight: AtomicU32,
    /// Monotonic publication sequence, stamped into every chunk
    pub sequence: AtomicU64,
    pub distributor: ChunkDistributorData,
}

/// Process-local handle to a publisher port
#[derive(Debug)]
pub struct PublisherPort {
    data: NonNull<PublisherPortData>,
    table: Arc<SegmentTable>,
    /// Segment this publisher's chunks are allocated from
    data_segment: SegmentId,
}

impl PublisherPort {
    /// Initialize port state in place and mark it offered
    ///
    /// # Safety
    /// `ptr` must point to writable memory of at least
    /// `size_of::<PublisherPortData>()` bytes not yet shared.
    pub unsafe fn init(
        ptr: *mut PublisherPortData,
        history_capacity: u32,
        allocation_budget: u32,
        data_segment: SegmentId,
        table: Arc<SegmentTable>,
    ) -> Result<Self> {
        let data = &mut *ptr;
        data.magic = PUBLISHER_PORT_MAGIC;
        data.state = AtomicU32::new(STATE_OFFERED);
        data.allocation_budget = allocation_budget;
        data.in_flight = AtomicU32::new(0);
        data.sequence = AtomicU64::new(0);
        ChunkDistributor::init(&mut data.distributor as *mut _, history_capacity, table.clone())?;

        Ok(Self {
            data: NonNull::new_unchecked(ptr),
            table,
            data_segment,
        })
    }

    /// Attach to an initialized publisher port
    ///
    /// # Safety
    /// `ptr` must point to memory initialized by [`PublisherPort::init`].
    pub unsafe fn attach(
        ptr: *mut PublisherPortData,
        data_segment: SegmentId,
        table: Arc<SegmentTable>,
    ) -> Result<Self> {
        if (*ptr).magic != PUBLISHER_PORT_MAGIC {
            return Err(MonetError::invariant("publisher port magic mismatch"));
        }
        Ok(Self {
            data: NonNull::new_unchecked(ptr),
            table,
            data_segment,
        })
    }

    fn data(&self) -> &PublisherPortData {
        unsafe { self.data.as_ref() }
    }

    /// Distributor view over this port's embedded fan-out state
    pub fn distributor(&self) -> ChunkDistributor {
        let data = unsafe { &mut (*self.data.as_ptr()).distributor };
        unsafe { ChunkDistributor::attach(data as *mut _, self.table.clone()) }
    }

    pub fn is_offered(&self) -> bool {
        self.data().state.load(Ordering::Acquire) == STATE_OFFERED
    }

    /// Terminal state set by the daemon while reaping the owning process
    pub fn mark_unoffered(&self) {
        self.data().state.store(STATE_UNOFFERED, Ordering::Release);
    }

    pub fn allocation_budget(&self) -> u32 {
        self.data().allocation_budget
    }

    /// Chunks loaned and not yet published or released
    pub fn in_flight(&self) -> u32 {
        self.data().in_flight.load(Ordering::Acquire)
    }

    /// Borrow a chunk sized for `payload_size` bytes from the shared pools
    ///
    /// Fails with `AllocationBudgetExceeded` when the port already holds
    /// its full budget of unpublished chunks, or `PoolEmpty` when the
    /// fitting pool is exhausted.
    pub fn loan(&self, payload_size: usize) -> Result<SampleMut<'_>> {
        let data = self.data();
        loop {
            let current = data.in_flight.load(Ordering::Acquire);
            if current >= data.allocation_budget {
                return Err(MonetError::AllocationBudgetExceeded {
                    budget: data.allocation_budget,
                });
            }
            if data
                .in_flight
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let pool = match mempool_for_payload(&self.table, self.data_segment, payload_size) {
            Ok(pool) => pool,
            Err(e) => {
                data.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        let chunk = match pool.allocate() {
            Ok(chunk) => chunk,
            Err(e) => {
                data.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        pool.chunk_header_mut(chunk.chunk_index()).payload_size = payload_size as u32;

        Ok(SampleMut {
            port: self,
            pool,
            chunk,
            payload_len: payload_size,
            published: false,
        })
    }

    /// Stamp the next sequence number and fan the sample out
    ///
    /// The loaned reference moves into the distributor (history or
    /// release); each subscriber queue acquires its own.
    pub fn publish(&self, mut sample: SampleMut<'_>) -> Result<u64> {
        if !self.is_offered() {
            return Err(MonetError::PublisherGone);
        }

        let data = self.data();
        let sequence = data.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        sample.pool.chunk_header_mut(sample.chunk.chunk_index()).sequence = sequence;

        sample.published = true;
        data.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.distributor().deliver(sample.chunk)?;
        Ok(sequence)
    }
}

unsafe impl Send for PublisherPort {}
unsafe impl Sync for PublisherPort {}

/// A loaned chunk with exclusive write access to its payload
///
/// Dropping an unpublished sample releases the chunk and returns the
/// loan to the port's budget.
#[derive(Debug)]
pub struct SampleMut<'a> {
    port: &'a PublisherPort,
    pool: MemPool,
    chunk: ChunkRef,
    payload_len: usize,
    published: bool,
}

impl<'a> SampleMut<'a> {
    /// Writable payload region
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.payload_ptr(self.chunk.chunk_index()), self.payload_len)
        }
    }

    /// Copy `bytes` into the payload; `bytes` must fit the loaned size
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.payload_len {
            return Err(MonetError::invalid_parameter(
                "payload",
                format!("{} bytes exceed loaned {}", bytes.len(), self.payload_len),
            ));
        }
        self.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn chunk_ref(&self) -> ChunkRef {
        self.chunk
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

impl Drop for SampleMut<'_> {
    fn drop(&mut self) {
        if !self.published {
            let _ = self.pool.release(self.chunk.chunk_index());
            self.port.data().in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

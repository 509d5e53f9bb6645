//! Subscriber port: taking samples and observing publisher liveness

use std::{
    ptr::NonNull,
    sync::Arc,
    time::Duration,
};

use crate::{
    error::{MonetError, Result},
    layout::constants::SUBSCRIBER_PORT_MAGIC,
    layout::{ChunkRef, SegmentTable},
    memory::{pool_of, release_chunk},
};

use super::chunk_queue::{ChunkQueue, ChunkQueueData, QueuePolicy};

/// Subscriber port state resident in shared memory
#[repr(C)]
pub struct SubscriberPortData {
    pub magic: u32,
    _pad: u32,
    pub queue: ChunkQueueData,
}

impl SubscriberPortData {
    /// Offset of the embedded queue, used by the daemon to hand the
    /// distributor a relative pointer straight to it
    pub const QUEUE_OFFSET: usize = std::mem::offset_of!(SubscriberPortData, queue);
}

/// Process-local handle to a subscriber port
#[derive(Debug)]
pub struct SubscriberPort {
    data: NonNull<SubscriberPortData>,
    table: Arc<SegmentTable>,
}

impl SubscriberPort {
    /// Initialize port state in place
    ///
    /// # Safety
    /// `ptr` must point to writable memory of at least
    /// `size_of::<SubscriberPortData>()` bytes not yet shared.
    pub unsafe fn init(
        ptr: *mut SubscriberPortData,
        queue_capacity: u32,
        policy: QueuePolicy,
        table: Arc<SegmentTable>,
    ) -> Result<Self> {
        (*ptr).magic = SUBSCRIBER_PORT_MAGIC;
        ChunkQueue::init(&mut (*ptr).queue as *mut _, queue_capacity, policy)?;
        Ok(Self {
            data: NonNull::new_unchecked(ptr),
            table,
        })
    }

    /// Attach to an initialized subscriber port
    ///
    /// # Safety
    /// `ptr` must point to memory initialized by [`SubscriberPort::init`].
    pub unsafe fn attach(ptr: *mut SubscriberPortData, table: Arc<SegmentTable>) -> Result<Self> {
        if (*ptr).magic != SUBSCRIBER_PORT_MAGIC {
            return Err(MonetError::invariant("subscriber port magic mismatch"));
        }
        Ok(Self {
            data: NonNull::new_unchecked(ptr),
            table,
        })
    }

    /// View of the embedded chunk queue
    pub fn queue(&self) -> ChunkQueue {
        let queue = unsafe { &mut (*self.data.as_ptr()).queue };
        unsafe { ChunkQueue::attach(queue as *mut _).expect("own queue is initialized") }
    }

    /// Whether the matched publisher is still offering
    pub fn is_publisher_connected(&self) -> bool {
        self.queue().is_connected()
    }

    /// Approximate number of queued samples
    pub fn size_snapshot(&self) -> usize {
        self.queue().size_snapshot()
    }

    /// Pop the next sample; the sample owns one reference until dropped
    pub fn take(&self) -> Result<Sample> {
        match self.queue().try_pop() {
            Some(chunk) => Sample::from_chunk(chunk, self.table.clone()),
            None => Err(MonetError::NoChunkAvailable),
        }
    }

    /// Block until a sample arrives, the timeout elapses, or the
    /// publisher disappears
    pub fn wait_for_sample(&self, timeout: Duration) -> Result<Sample> {
        match self.queue().wait_for_chunk(timeout)? {
            Some(chunk) => Sample::from_chunk(chunk, self.table.clone()),
            None => Err(MonetError::NoChunkAvailable),
        }
    }

    /// Drain the queue, releasing every pending reference
    pub fn clear(&self) -> Result<usize> {
        let drained = self.queue().clear();
        let count = drained.len();
        for chunk in drained {
            release_chunk(&self.table, chunk)?;
        }
        Ok(count)
    }
}

unsafe impl Send for SubscriberPort {}
unsafe impl Sync for SubscriberPort {}

/// A received sample holding one reference on its chunk
///
/// The reference is released when the sample is dropped; payload access
/// is zero-copy into the shared segment.
#[derive(Debug)]
pub struct Sample {
    chunk: ChunkRef,
    table: Arc<SegmentTable>,
    payload_ptr: *const u8,
    payload_len: usize,
    sequence: u64,
}

impl Sample {
    fn from_chunk(chunk: ChunkRef, table: Arc<SegmentTable>) -> Result<Self> {
        let pool = pool_of(&table, chunk)?;
        let header = pool.chunk_header(chunk.chunk_index());
        header.validate_live()?;
        Ok(Self {
            payload_ptr: pool.payload_ptr(chunk.chunk_index()),
            payload_len: header.payload_size as usize,
            sequence: header.sequence,
            chunk,
            table,
        })
    }

    /// Zero-copy view of the payload in shared memory
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr, self.payload_len) }
    }

    /// Publisher sequence number of this sample
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn chunk_ref(&self) -> ChunkRef {
        self.chunk
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        let _ = release_chunk(&self.table, self.chunk);
    }
}

unsafe impl Send for Sample {}

//! Port manager: the pre-sized port pool, descriptor matching, and wiring
//!
//! Port structures live in a daemon-owned management segment so both the
//! daemon and applications can reach them through relative pointers. At
//! most one publisher exists per descriptor; subscribers attach to it when
//! either side appears, late joiners receiving the publisher's history.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, warn};

use crate::{
    error::{MonetError, Result},
    layout::constants::{
        MAX_PROCESSES, MAX_PUBLISHERS, MAX_SUBSCRIBERS, MAX_SUBSCRIBERS_PER_PUBLISHER, MAX_TOPICS,
        MGMT_BLOCK_MAGIC,
    },
    layout::{RelativePointer, SegmentId, SegmentTable},
    memory::{BackingType, SegmentManager},
    port::{
        PublisherPort, PublisherPortData, QueuePolicy, ServiceDescriptor, SubscriberPort,
        SubscriberPortData,
    },
};

use super::protocol::{
    is_subscriber_port, port_slot, publisher_port_id, subscriber_port_id, PortId, PortInfo,
};

/// Per-process management block handed out at registration
#[repr(C)]
pub struct ManagementBlock {
    pub magic: u32,
    _pad: u32,
    pub session_id: u64,
    pub registered_at_ms: u64,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone)]
struct PublisherRecord {
    id: PortId,
    owner: String,
    location: RelativePointer,
    data_segment: SegmentId,
}

#[derive(Debug, Clone)]
struct SubscriberRecord {
    id: PortId,
    owner: String,
    location: RelativePointer,
    queue_ref: RelativePointer,
    history_request: u32,
}

#[derive(Debug, Default)]
struct TopicEntry {
    publisher: Option<PublisherRecord>,
    subscribers: Vec<SubscriberRecord>,
}

/// Owner of the management segment and the descriptor index
#[derive(Debug)]
pub struct PortManager {
    table: Arc<SegmentTable>,
    segment: SegmentId,
    mgmt_base: u32,
    mgmt_stride: u32,
    publisher_base: u32,
    publisher_stride: u32,
    subscriber_base: u32,
    subscriber_stride: u32,
    mgmt_used: Mutex<Vec<bool>>,
    publisher_used: Mutex<Vec<bool>>,
    subscriber_used: Mutex<Vec<bool>>,
    topics: RwLock<BTreeMap<ServiceDescriptor, TopicEntry>>,
}

impl PortManager {
    /// Create the management segment and carve out the port pool
    pub fn new(segment_manager: &SegmentManager, backing: BackingType) -> Result<Self> {
        let header_area = 4096usize;
        let mgmt_stride = align_up(std::mem::size_of::<ManagementBlock>(), 64);
        let publisher_stride = align_up(std::mem::size_of::<PublisherPortData>(), 64);
        let subscriber_stride = align_up(std::mem::size_of::<SubscriberPortData>(), 64);

        let mgmt_base = header_area;
        let publisher_base = mgmt_base + mgmt_stride * MAX_PROCESSES;
        let subscriber_base = publisher_base + publisher_stride * MAX_PUBLISHERS;
        let total = subscriber_base + subscriber_stride * MAX_SUBSCRIBERS;

        let segment = segment_manager.create_raw_segment("mgmt", total, backing)?;

        Ok(Self {
            table: segment_manager.table().clone(),
            segment,
            mgmt_base: mgmt_base as u32,
            mgmt_stride: mgmt_stride as u32,
            publisher_base: publisher_base as u32,
            publisher_stride: publisher_stride as u32,
            subscriber_base: subscriber_base as u32,
            subscriber_stride: subscriber_stride as u32,
            mgmt_used: Mutex::new(vec![false; MAX_PROCESSES]),
            publisher_used: Mutex::new(vec![false; MAX_PUBLISHERS]),
            subscriber_used: Mutex::new(vec![false; MAX_SUBSCRIBERS]),
            topics: RwLock::new(BTreeMap::new()),
        })
    }

    /// Segment holding all port structures
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    fn alloc_slot(used: &Mutex<Vec<bool>>) -> Option<u32> {
        let mut used = used.lock().unwrap();
        for (index, taken) in used.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return Some(index as u32);
            }
        }
        None
    }

    fn free_slot(used: &Mutex<Vec<bool>>, slot: u32) {
        let mut used = used.lock().unwrap();
        if let Some(entry) = used.get_mut(slot as usize) {
            *entry = false;
        }
    }

    fn publisher_location(&self, slot: u32) -> RelativePointer {
        RelativePointer::new(self.segment, self.publisher_base + slot * self.publisher_stride)
    }

    fn subscriber_location(&self, slot: u32) -> RelativePointer {
        RelativePointer::new(self.segment, self.subscriber_base + slot * self.subscriber_stride)
    }

    fn attach_publisher(&self, record: &PublisherRecord) -> Result<PublisherPort> {
        let ptr = self.table.resolve(record.location)? as *mut PublisherPortData;
        unsafe { PublisherPort::attach(ptr, record.data_segment, self.table.clone()) }
    }

    fn attach_subscriber(&self, location: RelativePointer) -> Result<SubscriberPort> {
        let ptr = self.table.resolve(location)? as *mut SubscriberPortData;
        unsafe { SubscriberPort::attach(ptr, self.table.clone()) }
    }

    /// Allocate and initialize a per-process management block
    pub fn alloc_management_block(&self, session_id: u64, now_ms: u64) -> Result<RelativePointer> {
        let slot = Self::alloc_slot(&self.mgmt_used).ok_or(MonetError::OutOfPorts {
            kind: "management block",
        })?;
        let location = RelativePointer::new(self.segment, self.mgmt_base + slot * self.mgmt_stride);
        let ptr = self.table.resolve(location)? as *mut ManagementBlock;
        unsafe {
            std::ptr::write(
                ptr,
                ManagementBlock {
                    magic: MGMT_BLOCK_MAGIC,
                    _pad: 0,
                    session_id,
                    registered_at_ms: now_ms,
                },
            );
        }
        Ok(location)
    }

    /// Release a management block back to the pool
    pub fn free_management_block(&self, location: RelativePointer) -> Result<()> {
        let ptr = self.table.resolve(location)? as *mut ManagementBlock;
        unsafe { (*ptr).magic = 0 };
        let slot = (location.offset - self.mgmt_base) / self.mgmt_stride;
        Self::free_slot(&self.mgmt_used, slot);
        Ok(())
    }

    /// Create a publisher port and wire every waiting subscriber to it
    pub fn create_publisher(
        &self,
        owner: &str,
        descriptor: ServiceDescriptor,
        history_capacity: u32,
        allocation_budget: u32,
        data_segment: SegmentId,
    ) -> Result<(PortId, RelativePointer)> {
        let mut topics = self.topics.write().unwrap();
        if !topics.contains_key(&descriptor) && topics.len() >= MAX_TOPICS {
            return Err(MonetError::DescriptorQuotaExceeded { limit: MAX_TOPICS });
        }
        let entry = topics.entry(descriptor.clone()).or_default();
        if entry.publisher.is_some() {
            return Err(MonetError::PublisherAlreadyExists {
                descriptor: descriptor.to_string(),
            });
        }

        let slot = Self::alloc_slot(&self.publisher_used)
            .ok_or(MonetError::OutOfPorts { kind: "publisher" })?;
        let location = self.publisher_location(slot);

        let port = match self.table.resolve(location) {
            Ok(ptr) => unsafe {
                PublisherPort::init(
                    ptr as *mut PublisherPortData,
                    history_capacity,
                    allocation_budget,
                    data_segment,
                    self.table.clone(),
                )
            },
            Err(e) => Err(e),
        };
        let port = match port {
            Ok(port) => port,
            Err(e) => {
                Self::free_slot(&self.publisher_used, slot);
                return Err(e);
            }
        };

        // Subscribers created before the publisher attach now, in their
        // creation order.
        let distributor = port.distributor();
        for subscriber in &entry.subscribers {
            if let Err(e) = distributor.add_subscriber(subscriber.queue_ref, subscriber.history_request)
            {
                warn!(
                    "wiring subscriber {} to {} failed: {}",
                    subscriber.id, descriptor, e
                );
            }
        }

        let id = publisher_port_id(slot);
        entry.publisher = Some(PublisherRecord {
            id,
            owner: owner.to_string(),
            location,
            data_segment,
        });
        debug!("publisher {} created for {} by {}", id, descriptor, owner);
        Ok((id, location))
    }

    /// Create a subscriber port, attaching to a present publisher
    pub fn create_subscriber(
        &self,
        owner: &str,
        descriptor: ServiceDescriptor,
        queue_capacity: u32,
        policy: QueuePolicy,
        history_request: u32,
    ) -> Result<(PortId, RelativePointer)> {
        let mut topics = self.topics.write().unwrap();
        if !topics.contains_key(&descriptor) && topics.len() >= MAX_TOPICS {
            return Err(MonetError::DescriptorQuotaExceeded { limit: MAX_TOPICS });
        }
        let entry = topics.entry(descriptor.clone()).or_default();
        if entry.subscribers.len() >= MAX_SUBSCRIBERS_PER_PUBLISHER {
            return Err(MonetError::TooManySubscribers {
                capacity: MAX_SUBSCRIBERS_PER_PUBLISHER,
            });
        }

        let slot = Self::alloc_slot(&self.subscriber_used)
            .ok_or(MonetError::OutOfPorts { kind: "subscriber" })?;
        let location = self.subscriber_location(slot);

        let init_result = match self.table.resolve(location) {
            Ok(ptr) => unsafe {
                SubscriberPort::init(
                    ptr as *mut SubscriberPortData,
                    queue_capacity,
                    policy,
                    self.table.clone(),
                )
            },
            Err(e) => Err(e),
        };
        if let Err(e) = init_result {
            Self::free_slot(&self.subscriber_used, slot);
            return Err(e);
        }

        let queue_ref = RelativePointer::new(
            location.segment,
            location.offset + SubscriberPortData::QUEUE_OFFSET as u32,
        );

        if let Some(publisher) = &entry.publisher {
            let port = self.attach_publisher(publisher)?;
            if let Err(e) = port.distributor().add_subscriber(queue_ref, history_request) {
                Self::free_slot(&self.subscriber_used, slot);
                return Err(e);
            }
        }

        let id = subscriber_port_id(slot);
        entry.subscribers.push(SubscriberRecord {
            id,
            owner: owner.to_string(),
            location,
            queue_ref,
            history_request,
        });
        debug!("subscriber {} created for {} by {}", id, descriptor, owner);
        Ok((id, location))
    }

    fn dismantle_publisher(&self, record: &PublisherRecord) -> Result<()> {
        let port = self.attach_publisher(record)?;
        let distributor = port.distributor();
        // Order matters: detach subscribers so they observe the terminal
        // state, drop the history refcounts, then mark the port.
        distributor.detach_all()?;
        distributor.release_history()?;
        port.mark_unoffered();
        Self::free_slot(&self.publisher_used, port_slot(record.id));
        Ok(())
    }

    fn dismantle_subscriber(
        &self,
        record: &SubscriberRecord,
        publisher: Option<&PublisherRecord>,
    ) -> Result<()> {
        if let Some(publisher) = publisher {
            let port = self.attach_publisher(publisher)?;
            port.distributor().remove_subscriber(record.queue_ref)?;
        }
        let port = self.attach_subscriber(record.location)?;
        port.clear()?;
        Self::free_slot(&self.subscriber_used, port_slot(record.id));
        Ok(())
    }

    /// Destroy one port owned by `owner`
    pub fn destroy_port(&self, owner: &str, id: PortId) -> Result<()> {
        let mut topics = self.topics.write().unwrap();

        let mut touched: Option<ServiceDescriptor> = None;
        for (descriptor, entry) in topics.iter_mut() {
            if !is_subscriber_port(id) {
                if let Some(record) = entry.publisher.clone() {
                    if record.id == id {
                        if record.owner != owner {
                            return Err(MonetError::UnknownPort { port: id });
                        }
                        self.dismantle_publisher(&record)?;
                        entry.publisher = None;
                        debug!("publisher {} for {} destroyed", id, descriptor);
                        touched = Some(descriptor.clone());
                        break;
                    }
                }
            } else if let Some(index) = entry.subscribers.iter().position(|s| s.id == id) {
                if entry.subscribers[index].owner != owner {
                    return Err(MonetError::UnknownPort { port: id });
                }
                let record = entry.subscribers.remove(index);
                self.dismantle_subscriber(&record, entry.publisher.as_ref())?;
                debug!("subscriber {} for {} destroyed", id, descriptor);
                touched = Some(descriptor.clone());
                break;
            }
        }

        match touched {
            Some(descriptor) => {
                // Empty entries free their descriptor quota slot.
                let drained = topics
                    .get(&descriptor)
                    .map(|e| e.publisher.is_none() && e.subscribers.is_empty())
                    .unwrap_or(false);
                if drained {
                    topics.remove(&descriptor);
                }
                Ok(())
            }
            None => Err(MonetError::UnknownPort { port: id }),
        }
    }

    /// Dismantle every port owned by a dead or unregistering process
    ///
    /// Publisher ports go first so remaining subscribers observe the
    /// terminal state before their own queues are touched.
    pub fn release_ports_of(&self, owner: &str) -> Result<usize> {
        let mut topics = self.topics.write().unwrap();
        let mut released = 0;

        for entry in topics.values_mut() {
            if let Some(record) = entry.publisher.clone() {
                if record.owner == owner {
                    self.dismantle_publisher(&record)?;
                    entry.publisher = None;
                    released += 1;
                }
            }
        }

        for entry in topics.values_mut() {
            let owned: Vec<usize> = entry
                .subscribers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.owner == owner)
                .map(|(i, _)| i)
                .collect();
            for index in owned.into_iter().rev() {
                let record = entry.subscribers.remove(index);
                self.dismantle_subscriber(&record, entry.publisher.as_ref())?;
                released += 1;
            }
        }

        topics.retain(|_, entry| entry.publisher.is_some() || !entry.subscribers.is_empty());
        Ok(released)
    }

    /// Introspection view of the given ports
    pub fn port_infos(&self, ports: &[PortId]) -> Vec<PortInfo> {
        let topics = self.topics.read().unwrap();
        let mut infos = Vec::new();

        for (descriptor, entry) in topics.iter() {
            if let Some(publisher) = &entry.publisher {
                if ports.contains(&publisher.id) {
                    infos.push(PortInfo {
                        port: publisher.id,
                        descriptor: descriptor.to_string(),
                        queue_depth: None,
                    });
                }
            }
            for subscriber in &entry.subscribers {
                if ports.contains(&subscriber.id) {
                    let depth = self
                        .attach_subscriber(subscriber.location)
                        .map(|p| p.size_snapshot())
                        .ok();
                    infos.push(PortInfo {
                        port: subscriber.id,
                        descriptor: descriptor.to_string(),
                        queue_depth: depth,
                    });
                }
            }
        }
        infos
    }

    /// Number of topics with at least one live port
    pub fn topic_count(&self) -> usize {
        self.topics.read().unwrap().len()
    }
}

//! Ports: the lock-free exchange of chunk references between one
//! publisher and its subscribers

pub mod chunk_queue;
pub mod descriptor;
pub mod distributor;
pub mod publisher;
pub mod subscriber;

pub use chunk_queue::{ChunkQueue, ChunkQueueData, PushOutcome, QueuePolicy};
pub use descriptor::ServiceDescriptor;
pub use distributor::{ChunkDistributor, ChunkDistributorData};
pub use publisher::{PublisherPort, PublisherPortData, SampleMut};
pub use subscriber::{Sample, SubscriberPort, SubscriberPortData};

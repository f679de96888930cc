//! Event sources
//!
//! - [`resolver`]: owner discovery
//! - [`bucket`]: what one owner's consumer reads
//! - [`broker`]: consumer seam and the in-process broker
//! - `kafka`: librdkafka consumers (feature `kafka`)
//! - [`topology`]: one consumer per owner, kept in line with the resolver

pub mod broker;
pub mod bucket;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod resolver;
pub mod topology;

pub use broker::{BrokerMessage, ConsumerFactory, MemoryBroker, MessageConsumer};
pub use bucket::{Bucket, TopicSelector};
#[cfg(feature = "kafka")]
pub use kafka::KafkaConsumerFactory;
pub use resolver::{
    BrokerInfo, NamedOwner, OwnerInfo, Owners, Resolver, ResolverError, SchedulerInfo,
    StaticResolver,
};
pub use topology::{ReconcileReport, TopologySource};

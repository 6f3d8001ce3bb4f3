//! Port implementations that live entirely in process.
//!
//! These back the test suites and single-node deployments without a bus.
//! Networked adapters live in the server crate.

pub mod memory;

pub use memory::{
    ChannelSubscriber, InMemoryEntityRepository, InMemoryEventBus, InMemoryMetadataSource,
    InMemorySubscriberRegistry,
};

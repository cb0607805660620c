//! Publishers: the three downstream sinks.
//!
//! Constructed once at startup, shared by reference across every camera
//! worker, internally synchronised. Each publisher guards its own state
//! with a mutex; any number of workers may call `put_event` concurrently.

pub mod client;
pub mod ddb;
pub mod kds;
pub mod s3;

pub use client::{
    AttrValue, InMemoryObjectStore, InMemoryStreamClient, InMemoryTableClient, ObjectStore,
    ObjectStoreError, PlannedResponse, PutRecordsOutput, RecordResult, StoredObject, StreamClient,
    StreamClientError, StreamRecord, TableClient, TableClientError, TableItem,
};
pub use ddb::{DdbConfig, MetadataPublisher, TableMetrics, MAX_BATCH_ITEMS};
pub use kds::{EventStreamPublisher, KdsConfig, StreamPublisherMetrics, MAX_BATCH_SIZE};
pub use s3::{S3Config, SnapshotMetrics, SnapshotPublisher};

/// The shared set of sinks a worker publishes into. Sinks disabled in
/// configuration are simply absent.
#[derive(Default)]
pub struct Publishers {
    pub events: Option<EventStreamPublisher>,
    pub snapshots: Option<SnapshotPublisher>,
    pub metadata: Option<MetadataPublisher>,
}

impl Publishers {
    /// Drain every configured sink. Called once at shutdown, after all
    /// workers have stopped.
    pub fn flush_all(&self) {
        if let Some(events) = &self.events {
            if !events.flush() {
                log::warn!("event stream flush reported failures at shutdown");
            }
        }
        if let Some(snapshots) = &self.snapshots {
            snapshots.flush();
        }
        if let Some(metadata) = &self.metadata {
            metadata.flush();
        }
    }
}

//! kvs-infer: multi-camera video inference pipeline.
//!
//! For each configured camera the service pulls live frames from a
//! Kinesis Video Streams HLS session, runs a chain of object detectors
//! (weapon, fire/smoke, license plates) over each frame, temporally
//! confirms and spatially deduplicates the detections, and publishes the
//! resulting events to downstream sinks: a data stream for events, an
//! object store for annotated snapshots, and an optional key-value store
//! for queryable metadata.
//!
//! # Module structure
//!
//! - `time`: clock seam (monotonic, wall ms, sleep) with a stub for tests
//! - `geometry`: IoU, point-in-polygon, ROI acceptance modes
//! - `temporal`: temporal confirmation buffer and spatial dedup ring
//! - `event`: events, envelopes, SHA1 event ids
//! - `frame`: BGR frame buffer, crops, annotation drawing
//! - `frame_source`: HLS session state machine and its control-plane and
//!   decoder seams
//! - `detect`: detector trait, registry, and the three detector types
//! - `publish`: the three sinks and their wire-client seams
//! - `worker`: the per-camera loop
//! - `metrics` / `http` / `logger`: observability surface
//! - `config` / `supervisor`: startup, lifecycle, shutdown

pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod frame_source;
pub mod geometry;
pub mod http;
pub mod logger;
pub mod metrics;
pub mod publish;
pub mod supervisor;
pub mod temporal;
pub mod time;
pub mod worker;

pub use config::AppConfig;
pub use event::{Detection, Event, EventEnvelope, EventType, ExtraValue, Extras};
pub use frame::Frame;
pub use frame_source::{ConnectionState, FrameSource, HlsSourceConfig, KvsHlsSource};
pub use geometry::{iou, point_in_polygon, BBox, Polygon, RoiMode};
pub use metrics::Metrics;
pub use publish::Publishers;
pub use supervisor::Supervisor;
pub use temporal::{DedupRing, TemporalBuffer};
pub use worker::CameraWorker;

//! Event stream publisher: batching, per-record retry, ordering.
//!
//! Records accumulate in a mutex-guarded buffer and are sent when the
//! buffer reaches the batch cap or on `flush`. A partially rejected batch
//! retries only the failed records, in submission order, so records that
//! already succeeded are never re-sent; within a partition key, ordering
//! is whatever the caller submitted.
//!
//! At-most-one-loss semantics: a record is dropped only after
//! `max_retries` rounds, and every drop is counted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::event::{Event, EventEnvelope};
use crate::metrics::Metrics;
use crate::publish::client::{StreamClient, StreamRecord};
use crate::time::Clock;

/// Service-imposed cap on records per `put_records` call.
pub const MAX_BATCH_SIZE: usize = 500;

#[derive(Clone, Debug)]
pub struct KdsConfig {
    pub stream_name: String,
    pub region: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    /// Width of the event-id time bucket.
    pub event_id_bucket_ms: i64,
    pub producer: String,
}

impl Default for KdsConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: "us-east-1".to_string(),
            batch_size: MAX_BATCH_SIZE,
            max_retries: 3,
            base_backoff_ms: 100,
            event_id_bucket_ms: 1000,
            producer: concat!("kvs-infer/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamPublisherMetrics {
    pub published: u64,
    /// Records dropped after exhausting retries (or on permanent errors).
    pub failed: u64,
    /// Records that went through at least one retry round.
    pub retried: u64,
    pub batches_sent: u64,
}

pub struct EventStreamPublisher {
    config: KdsConfig,
    client: Arc<dyn StreamClient>,
    clock: Arc<dyn Clock>,
    buffer: Mutex<Vec<StreamRecord>>,
    metrics: Mutex<StreamPublisherMetrics>,
    prom: Option<Arc<Metrics>>,
}

impl EventStreamPublisher {
    pub fn new(mut config: KdsConfig, client: Arc<dyn StreamClient>, clock: Arc<dyn Clock>) -> Self {
        config.batch_size = config.batch_size.clamp(1, MAX_BATCH_SIZE);
        log::info!(
            "event stream publisher ready: stream={}, batch_size={}, max_retries={}",
            config.stream_name,
            config.batch_size,
            config.max_retries
        );
        Self {
            config,
            client,
            clock,
            buffer: Mutex::new(Vec::new()),
            metrics: Mutex::new(StreamPublisherMetrics::default()),
            prom: None,
        }
    }

    pub fn with_prometheus(mut self, prom: Arc<Metrics>) -> Self {
        self.prom = Some(prom);
        self
    }

    /// Wrap, serialise, and enqueue one event. The buffer is sent when it
    /// reaches the batch cap.
    pub fn put_event(&self, event: &Event, partition_key: &str) -> bool {
        let envelope = EventEnvelope::wrap(
            event.clone(),
            &self.config.producer,
            self.config.event_id_bucket_ms,
        );
        let data = match serde_json::to_string(&envelope) {
            Ok(data) => data,
            Err(err) => {
                log::error!("failed to serialise event envelope: {}", err);
                self.count_dropped(1);
                return false;
            }
        };

        let full_batch = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(StreamRecord {
                data,
                partition_key: partition_key.to_string(),
            });
            if buffer.len() >= self.config.batch_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        match full_batch {
            Some(batch) => self.send_with_retries(batch),
            None => true,
        }
    }

    pub fn put_events(&self, events: &[Event], partition_key: &str) -> bool {
        let mut ok = true;
        for event in events {
            if !self.put_event(event, partition_key) {
                ok = false;
            }
        }
        if !self.flush() {
            ok = false;
        }
        ok
    }

    /// Send whatever is buffered.
    pub fn flush(&self) -> bool {
        let batch = std::mem::take(&mut *self.buffer.lock().unwrap());
        if batch.is_empty() {
            return true;
        }
        self.send_with_retries(batch)
    }

    pub fn get_metrics(&self) -> StreamPublisherMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    fn count_dropped(&self, count: u64) {
        self.metrics.lock().unwrap().failed += count;
        if let Some(prom) = &self.prom {
            prom.record_publisher_failures("kds", count);
        }
    }

    fn backoff(&self, attempt: u32) {
        let backoff_ms = self.config.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        self.clock
            .sleep(Duration::from_millis((backoff_ms as f64 * jitter) as u64));
    }

    fn send_with_retries(&self, batch: Vec<StreamRecord>) -> bool {
        let mut outstanding = batch;
        let mut attempt = 0u32;

        while !outstanding.is_empty() {
            match self.client.put_records(&self.config.stream_name, &outstanding) {
                Ok(output) => {
                    let mut still_failed = Vec::new();
                    for (record, result) in outstanding.iter().zip(output.results.iter()) {
                        if let Some(code) = &result.error_code {
                            log::warn!(
                                "event stream record failed: {} - {}",
                                code,
                                result.error_message.as_deref().unwrap_or("unknown error")
                            );
                            still_failed.push(record.clone());
                        }
                    }

                    let succeeded = (outstanding.len() - still_failed.len()) as u64;
                    self.metrics.lock().unwrap().published += succeeded;

                    if still_failed.is_empty() {
                        let mut metrics = self.metrics.lock().unwrap();
                        metrics.batches_sent += 1;
                        log::debug!(
                            "event stream batch published: {} records, stream={}",
                            outstanding.len(),
                            self.config.stream_name
                        );
                        return true;
                    }
                    outstanding = still_failed;
                }
                Err(err) if err.is_retryable() => {
                    log::warn!(
                        "event stream call failed (retryable): {} ({} records)",
                        err,
                        outstanding.len()
                    );
                }
                Err(err) => {
                    log::error!(
                        "event stream call failed permanently: {} ({} records dropped)",
                        err,
                        outstanding.len()
                    );
                    self.count_dropped(outstanding.len() as u64);
                    return false;
                }
            }

            if attempt >= self.config.max_retries {
                break;
            }
            self.backoff(attempt);
            self.metrics.lock().unwrap().retried += outstanding.len() as u64;
            attempt += 1;
        }

        log::error!(
            "event stream batch failed after {} retries: {} records lost",
            self.config.max_retries,
            outstanding.len()
        );
        self.count_dropped(outstanding.len() as u64);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Extras};
    use crate::geometry::BBox;
    use crate::publish::client::{InMemoryStreamClient, PlannedResponse};
    use crate::time::StubClock;

    fn event(ts_ms: i64) -> Event {
        Event {
            camera_id: "cam-a".to_string(),
            event_type: EventType::Weapon,
            label: "gun".to_string(),
            conf: 0.9,
            bbox: BBox::new(1.0, 1.0, 2.0, 2.0),
            ts_ms,
            extras: Extras::new(),
        }
    }

    fn publisher(batch_size: usize, client: Arc<InMemoryStreamClient>) -> EventStreamPublisher {
        let config = KdsConfig {
            stream_name: "events".to_string(),
            batch_size,
            base_backoff_ms: 1,
            ..KdsConfig::default()
        };
        EventStreamPublisher::new(config, client, Arc::new(StubClock::new()))
    }

    #[test]
    fn buffer_flushes_at_batch_size() {
        let client = Arc::new(InMemoryStreamClient::new());
        let publisher = publisher(2, client.clone());
        assert!(publisher.put_event(&event(1000), "cam-a"));
        assert_eq!(client.call_count(), 0);
        assert!(publisher.put_event(&event(1500), "cam-a"));
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.batches()[0].len(), 2);
        assert_eq!(publisher.pending(), 0);
    }

    #[test]
    fn flush_sends_partial_buffer_once() {
        let client = Arc::new(InMemoryStreamClient::new());
        let publisher = publisher(500, client.clone());
        for i in 0..3 {
            publisher.put_event(&event(1000 + i), "cam-a");
        }
        assert_eq!(client.call_count(), 0);
        assert!(publisher.flush());
        assert_eq!(client.call_count(), 1);
        assert!(publisher.flush(), "empty flush is a no-op success");
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn failed_records_retry_in_order() {
        let client = Arc::new(InMemoryStreamClient::new());
        client.plan(PlannedResponse::RecordErrors(vec![
            (0, "ProvisionedThroughputExceededException".to_string()),
            (2, "ServiceUnavailable".to_string()),
        ]));
        let publisher = publisher(3, client.clone());
        for i in 0..3 {
            publisher.put_event(&event(1000 + i), "cam-a");
        }

        let batches = client.batches();
        assert_eq!(batches.len(), 2);
        // Retry carries exactly the failed records, original order.
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[1][0].data, batches[0][0].data);
        assert_eq!(batches[1][1].data, batches[0][2].data);

        let metrics = publisher.get_metrics();
        assert_eq!(metrics.published, 3);
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.failed, 0);
    }

    #[test]
    fn permanent_error_drops_without_retry() {
        let client = Arc::new(InMemoryStreamClient::new());
        client.plan(PlannedResponse::CallError {
            code: "AccessDeniedException".to_string(),
            message: "no".to_string(),
        });
        let publisher = publisher(1, client.clone());
        assert!(!publisher.put_event(&event(1000), "cam-a"));
        assert_eq!(client.call_count(), 1);
        assert_eq!(publisher.get_metrics().failed, 1);
    }

    #[test]
    fn records_dropped_after_retries_exhausted() {
        let client = Arc::new(InMemoryStreamClient::new());
        let config = KdsConfig {
            stream_name: "events".to_string(),
            batch_size: 1,
            max_retries: 2,
            base_backoff_ms: 1,
            ..KdsConfig::default()
        };
        for _ in 0..3 {
            client.plan(PlannedResponse::RecordErrors(vec![(
                0,
                "ProvisionedThroughputExceededException".to_string(),
            )]));
        }
        let publisher =
            EventStreamPublisher::new(config, client.clone(), Arc::new(StubClock::new()));
        assert!(!publisher.put_event(&event(1000), "cam-a"));
        // Initial call plus two retries.
        assert_eq!(client.call_count(), 3);
        let metrics = publisher.get_metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.published, 0);
    }

    #[test]
    fn envelope_on_the_wire_is_json_with_event_id() {
        let client = Arc::new(InMemoryStreamClient::new());
        let publisher = publisher(1, client.clone());
        publisher.put_event(&event(1234), "cam-a");
        let batches = client.batches();
        let record = &batches[0][0];
        assert_eq!(record.partition_key, "cam-a");
        let envelope: EventEnvelope = serde_json::from_str(&record.data).unwrap();
        assert_eq!(envelope.camera_id, "cam-a");
        assert_eq!(envelope.payload.ts_ms, 1234);
        assert_eq!(envelope.event_id.len(), 40);
    }

    #[test]
    fn put_events_flushes_the_tail() {
        let client = Arc::new(InMemoryStreamClient::new());
        let publisher = publisher(2, client.clone());
        let events: Vec<Event> = (0..5).map(|i| event(1000 + i)).collect();
        assert!(publisher.put_events(&events, "cam-a"));
        // ceil(5 / 2) = 3 batch sends.
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.batches()[2].len(), 1);
    }
}

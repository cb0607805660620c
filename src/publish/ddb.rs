//! Metadata-store publisher.
//!
//! One row per event, keyed `event_id` + `ts_ms`, with the envelope
//! flattened to top-level attributes. The store rejects binary floats, so
//! every float (nested extras included) is normalised to the
//! arbitrary-precision numeric type at this boundary; [`AttrValue`] has no
//! float variant, which makes a leak unrepresentable.

use std::sync::{Arc, Mutex};

use crate::event::{EventEnvelope, ExtraValue};
use crate::metrics::Metrics;
use crate::publish::client::{AttrValue, TableClient, TableItem};
use crate::time::Clock;

/// Service-imposed cap on items per batch write.
pub const MAX_BATCH_ITEMS: usize = 25;

#[derive(Clone, Debug)]
pub struct DdbConfig {
    pub table_name: String,
    pub region: String,
    /// Row TTL in days; `None` disables expiration.
    pub ttl_days: Option<u32>,
}

impl Default for DdbConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            region: "us-east-1".to_string(),
            ttl_days: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableMetrics {
    pub written: u64,
    pub failed: u64,
    pub batches_sent: u64,
}

pub struct MetadataPublisher {
    config: DdbConfig,
    client: Arc<dyn TableClient>,
    clock: Arc<dyn Clock>,
    metrics: Mutex<TableMetrics>,
    prom: Option<Arc<Metrics>>,
}

impl MetadataPublisher {
    pub fn new(config: DdbConfig, client: Arc<dyn TableClient>, clock: Arc<dyn Clock>) -> Self {
        log::info!(
            "metadata publisher ready: table={}, ttl_days={:?}",
            config.table_name,
            config.ttl_days
        );
        Self {
            config,
            client,
            clock,
            metrics: Mutex::new(TableMetrics::default()),
            prom: None,
        }
    }

    pub fn with_prometheus(mut self, prom: Arc<Metrics>) -> Self {
        self.prom = Some(prom);
        self
    }

    pub fn put_event(&self, envelope: &EventEnvelope) -> bool {
        let item = self.prepare_item(envelope);
        match self.client.put_item(&self.config.table_name, &item) {
            Ok(()) => {
                self.metrics.lock().unwrap().written += 1;
                log::debug!(
                    "metadata row written: event_id={}, camera={}",
                    envelope.event_id,
                    envelope.camera_id
                );
                true
            }
            Err(err) => {
                log::error!(
                    "metadata write failed for event {}: {}",
                    envelope.event_id,
                    err
                );
                self.count_failures(1);
                false
            }
        }
    }

    /// Batch write in service-limit chunks.
    pub fn put_events(&self, envelopes: &[EventEnvelope]) -> bool {
        if envelopes.is_empty() {
            return true;
        }
        let mut ok = true;
        for chunk in envelopes.chunks(MAX_BATCH_ITEMS) {
            let items: Vec<TableItem> = chunk.iter().map(|e| self.prepare_item(e)).collect();
            match self.client.batch_put(&self.config.table_name, &items) {
                Ok(()) => {
                    let mut metrics = self.metrics.lock().unwrap();
                    metrics.written += items.len() as u64;
                    metrics.batches_sent += 1;
                }
                Err(err) => {
                    log::error!("metadata batch write failed ({} items): {}", items.len(), err);
                    self.count_failures(items.len() as u64);
                    ok = false;
                }
            }
        }
        ok
    }

    /// Time-range query against the `camera_id` + `ts_ms` secondary index,
    /// most recent first.
    pub fn query_by_camera(
        &self,
        camera_id: &str,
        start_ts_ms: Option<i64>,
        end_ts_ms: Option<i64>,
        limit: usize,
    ) -> Vec<TableItem> {
        match self.client.query_by_camera(
            &self.config.table_name,
            camera_id,
            start_ts_ms,
            end_ts_ms,
            limit,
        ) {
            Ok(items) => items,
            Err(err) => {
                log::error!("metadata query failed for camera {}: {}", camera_id, err);
                Vec::new()
            }
        }
    }

    pub fn get_metrics(&self) -> TableMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Nothing is buffered; see the supervisor's shutdown drain.
    pub fn flush(&self) -> bool {
        true
    }

    fn count_failures(&self, count: u64) {
        self.metrics.lock().unwrap().failed += count;
        if let Some(prom) = &self.prom {
            prom.record_publisher_failures("ddb", count);
        }
    }

    /// Flatten the envelope into a table item.
    fn prepare_item(&self, envelope: &EventEnvelope) -> TableItem {
        let payload = &envelope.payload;
        let mut item = TableItem::new();
        item.insert("event_id".to_string(), AttrValue::S(envelope.event_id.clone()));
        item.insert("camera_id".to_string(), AttrValue::S(envelope.camera_id.clone()));
        item.insert("producer".to_string(), AttrValue::S(envelope.producer.clone()));
        item.insert("ts_ms".to_string(), AttrValue::N(payload.ts_ms.to_string()));
        item.insert(
            "type".to_string(),
            AttrValue::S(payload.event_type.as_str().to_string()),
        );
        item.insert("label".to_string(), AttrValue::S(payload.label.clone()));
        item.insert("conf".to_string(), number(payload.conf));
        item.insert(
            "bbox".to_string(),
            AttrValue::L(
                <[f32; 4]>::from(payload.bbox)
                    .iter()
                    .map(|v| number(*v))
                    .collect(),
            ),
        );

        let extras = payload
            .extras
            .iter()
            .map(|(k, v)| (k.clone(), extra_to_attr(v)))
            .collect();
        item.insert("extras".to_string(), AttrValue::M(extras));

        if let Some(ttl_days) = self.config.ttl_days {
            let now_s = self.clock.wall_ms() / 1000;
            let ttl = now_s + i64::from(ttl_days) * 86_400;
            item.insert("ttl".to_string(), AttrValue::N(ttl.to_string()));
        }
        item
    }
}

/// Numbers become decimal strings; the store has no binary float type.
fn number<T: std::fmt::Display>(value: T) -> AttrValue {
    AttrValue::N(value.to_string())
}

fn extra_to_attr(value: &ExtraValue) -> AttrValue {
    match value {
        ExtraValue::Bool(v) => AttrValue::Bool(*v),
        ExtraValue::Int(v) => number(v),
        ExtraValue::Float(v) => number(v),
        ExtraValue::Str(v) => AttrValue::S(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType, Extras};
    use crate::geometry::BBox;
    use crate::publish::client::InMemoryTableClient;
    use crate::time::StubClock;

    fn envelope(ts_ms: i64) -> EventEnvelope {
        let mut extras = Extras::new();
        extras.insert("ocr_conf".to_string(), ExtraValue::Float(0.87));
        extras.insert("frame_index".to_string(), ExtraValue::Int(12));
        extras.insert("text".to_string(), ExtraValue::Str("AB1234".to_string()));
        let event = Event {
            camera_id: "cam-a".to_string(),
            event_type: EventType::Alpr,
            label: "plate".to_string(),
            conf: 0.91,
            bbox: BBox::new(1.5, 2.0, 3.5, 4.0),
            ts_ms,
            extras,
        };
        EventEnvelope::wrap(event, "kvs-infer/0.2", 1000)
    }

    fn publisher(
        ttl_days: Option<u32>,
        client: Arc<InMemoryTableClient>,
    ) -> (MetadataPublisher, Arc<StubClock>) {
        let clock = Arc::new(StubClock::new());
        clock.set_wall_ms(1_000_000_000);
        let config = DdbConfig {
            table_name: "events".to_string(),
            ttl_days,
            ..DdbConfig::default()
        };
        (MetadataPublisher::new(config, client, clock.clone()), clock)
    }

    #[test]
    fn item_flattens_envelope_and_normalises_floats() {
        let client = Arc::new(InMemoryTableClient::new());
        let (publisher, _clock) = publisher(None, client.clone());
        assert!(publisher.put_event(&envelope(1234)));

        let items = client.items();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.get("camera_id").unwrap().as_s(), Some("cam-a"));
        assert_eq!(item.get("type").unwrap().as_s(), Some("alpr"));
        assert_eq!(item.get("ts_ms").unwrap().as_n(), Some("1234"));
        assert_eq!(item.get("conf").unwrap().as_n(), Some("0.91"));

        // bbox floats arrive as numeric strings.
        let AttrValue::L(bbox) = item.get("bbox").unwrap() else {
            panic!("bbox not a list");
        };
        assert!(bbox.iter().all(|v| matches!(v, AttrValue::N(_))));

        // Nested extras too.
        let AttrValue::M(extras) = item.get("extras").unwrap() else {
            panic!("extras not a map");
        };
        assert_eq!(extras.get("ocr_conf").unwrap().as_n(), Some("0.87"));
        assert_eq!(extras.get("frame_index").unwrap().as_n(), Some("12"));
        assert_eq!(extras.get("text").unwrap().as_s(), Some("AB1234"));
    }

    #[test]
    fn ttl_is_now_plus_days() {
        let client = Arc::new(InMemoryTableClient::new());
        let (publisher, _clock) = publisher(Some(30), client.clone());
        publisher.put_event(&envelope(1234));
        let items = client.items();
        let ttl: i64 = items[0].get("ttl").unwrap().as_n().unwrap().parse().unwrap();
        assert_eq!(ttl, 1_000_000 + 30 * 86_400);
    }

    #[test]
    fn batch_writes_chunk_at_service_limit() {
        let client = Arc::new(InMemoryTableClient::new());
        let (publisher, _clock) = publisher(None, client.clone());
        let envelopes: Vec<EventEnvelope> = (0..60).map(|i| envelope(1000 + i)).collect();
        assert!(publisher.put_events(&envelopes));
        assert_eq!(client.batch_calls(), 3); // 25 + 25 + 10
        assert_eq!(client.items().len(), 60);
        assert_eq!(publisher.get_metrics().batches_sent, 3);
    }

    #[test]
    fn failed_write_counts_and_returns_false() {
        let client = Arc::new(InMemoryTableClient::new());
        client.fail_next_call();
        let (publisher, _clock) = publisher(None, client);
        assert!(!publisher.put_event(&envelope(1)));
        assert_eq!(publisher.get_metrics().failed, 1);
    }
}

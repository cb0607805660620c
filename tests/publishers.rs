//! Publisher guarantees: batching, retry, ordering, numeric
//! normalisation, and event-id stability.

use std::sync::Arc;

use kvs_infer::detect::infer::ScriptedBackend;
use kvs_infer::detect::weapon::{WeaponConfig, WeaponDetector};
use kvs_infer::detect::{Detector, DetectorContext};
use kvs_infer::event::{event_id, Detection, Event, EventEnvelope, EventType, Extras};
use kvs_infer::frame::Frame;
use kvs_infer::geometry::BBox;
use kvs_infer::publish::{
    AttrValue, DdbConfig, EventStreamPublisher, InMemoryStreamClient, InMemoryTableClient,
    KdsConfig, MetadataPublisher, PlannedResponse,
};
use kvs_infer::time::StubClock;

fn sample_event(ts_ms: i64) -> Event {
    Event {
        camera_id: "cam-a".to_string(),
        event_type: EventType::Weapon,
        label: "gun".to_string(),
        conf: 0.88,
        bbox: BBox::new(10.0, 20.0, 110.0, 200.0),
        ts_ms,
        extras: Extras::new(),
    }
}

fn stream_publisher(batch_size: usize, client: Arc<InMemoryStreamClient>) -> EventStreamPublisher {
    EventStreamPublisher::new(
        KdsConfig {
            stream_name: "events".to_string(),
            batch_size,
            base_backoff_ms: 1,
            ..KdsConfig::default()
        },
        client,
        Arc::new(StubClock::new()),
    )
}

/// A run of events that fits the batch cap goes out as one send.
#[test]
fn events_below_batch_size_send_once() {
    let client = Arc::new(InMemoryStreamClient::new());
    let publisher = stream_publisher(10, client.clone());
    let events: Vec<Event> = (0..7).map(|i| sample_event(1000 + i)).collect();
    assert!(publisher.put_events(&events, "cam-a"));
    assert_eq!(client.call_count(), 1);
    assert_eq!(client.batches()[0].len(), 7);
}

/// More events than the cap go out in ceil(N / batch_size) sends.
#[test]
fn events_above_batch_size_send_in_ceil_batches() {
    let client = Arc::new(InMemoryStreamClient::new());
    let publisher = stream_publisher(4, client.clone());
    let events: Vec<Event> = (0..10).map(|i| sample_event(1000 + i)).collect();
    assert!(publisher.put_events(&events, "cam-a"));
    assert_eq!(client.call_count(), 3); // 4 + 4 + 2
    assert_eq!(client.batches()[2].len(), 2);
}

/// A partially rejected batch retries exactly the failed records, in
/// submission order.
#[test]
fn partial_failure_retries_only_failed_records_in_order() {
    let client = Arc::new(InMemoryStreamClient::new());
    client.plan(PlannedResponse::RecordErrors(vec![
        (1, "ProvisionedThroughputExceededException".to_string()),
        (3, "ServiceUnavailable".to_string()),
    ]));
    let publisher = stream_publisher(5, client.clone());
    let events: Vec<Event> = (0..5).map(|i| sample_event(1000 + i)).collect();
    assert!(publisher.put_events(&events, "cam-a"));

    let batches = client.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].len(), 2);
    assert_eq!(batches[1][0].data, batches[0][1].data);
    assert_eq!(batches[1][1].data, batches[0][3].data);
}

/// Three confirmed detections on one camera with batch_size=2 produce
/// two ordered batch sends, all records under partition key `cam-a`.
#[test]
fn detector_to_stream_ordering_under_partition_key() {
    let config = WeaponConfig {
        classes: vec!["gun".to_string()],
        temporal_min_conf: 1,
        dedup_window: 1,
        ..WeaponConfig::default()
    };
    let script = (0..3)
        .map(|_| vec![Detection::new("gun", 0.9, BBox::new(5.0, 5.0, 55.0, 55.0))])
        .collect();
    let mut detector =
        WeaponDetector::with_backend(config, Box::new(ScriptedBackend::with_script(script)))
            .unwrap();

    let client = Arc::new(InMemoryStreamClient::new());
    let publisher = stream_publisher(2, client.clone());

    let frame = Frame::filled(640, 480, [0, 0, 0]);
    let polygons = Vec::new();
    let ctx = DetectorContext {
        camera_id: "cam-a",
        frame_width: 640,
        frame_height: 480,
        roi_polygons: &polygons,
        min_box_area: None,
    };

    for ts_ms in [1000, 1500, 2000] {
        for event in detector.process(&frame, ts_ms, &ctx).unwrap() {
            publisher.put_event(&event, "cam-a");
        }
    }
    publisher.flush();

    let batches = client.batches();
    assert_eq!(batches.len(), 2);

    let ts_of = |record: &kvs_infer::publish::StreamRecord| {
        serde_json::from_str::<EventEnvelope>(&record.data)
            .unwrap()
            .payload
            .ts_ms
    };
    assert_eq!(batches[0].iter().map(&ts_of).collect::<Vec<_>>(), vec![1000, 1500]);
    assert_eq!(batches[1].iter().map(&ts_of).collect::<Vec<_>>(), vec![2000]);
    assert!(batches
        .iter()
        .flatten()
        .all(|record| record.partition_key == "cam-a"));
}

/// Event ids collapse within the one-second bucket and split across it.
#[test]
fn event_id_bucket_stability() {
    let a = event_id("cam-a", EventType::Weapon, "gun", 1234, 1000);
    let b = event_id("cam-a", EventType::Weapon, "gun", 1876, 1000);
    let c = event_id("cam-a", EventType::Weapon, "gun", 2001, 1000);
    assert_eq!(a, b, "same 1s bucket must share an event id");
    assert_ne!(a, c, "bucket 2 must differ from bucket 1");
}

/// No raw float ever reaches the metadata store.
#[test]
fn metadata_floats_are_arbitrary_precision_numbers() {
    let client = Arc::new(InMemoryTableClient::new());
    let publisher = MetadataPublisher::new(
        DdbConfig {
            table_name: "events".to_string(),
            ..DdbConfig::default()
        },
        client.clone(),
        Arc::new(StubClock::new()),
    );

    let mut event = sample_event(4321);
    event
        .extras
        .insert("ocr_conf".to_string(), kvs_infer::event::ExtraValue::Float(0.75));
    event.extras.insert(
        "nested_note".to_string(),
        kvs_infer::event::ExtraValue::Str("x".to_string()),
    );
    let envelope = EventEnvelope::wrap(event, "kvs-infer/test", 1000);
    assert!(publisher.put_event(&envelope));

    fn assert_no_floats(value: &AttrValue) {
        match value {
            AttrValue::S(_) | AttrValue::Bool(_) => {}
            AttrValue::N(n) => {
                assert!(n.parse::<f64>().is_ok(), "N '{}' is not numeric text", n);
            }
            AttrValue::L(list) => list.iter().for_each(assert_no_floats),
            AttrValue::M(map) => map.values().for_each(assert_no_floats),
        }
    }

    let items = client.items();
    assert_eq!(items.len(), 1);
    for value in items[0].values() {
        assert_no_floats(value);
    }
    assert_eq!(items[0].get("conf").unwrap().as_n(), Some("0.88"));
}

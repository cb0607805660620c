//! Wire-client seams for the three sinks.
//!
//! The cloud data planes are external collaborators; each trait carries
//! exactly the operations the publishers invoke plus the error taxonomy
//! the retry logic needs. The in-memory implementations back the test
//! suite and the demo wiring when no cloud transport is compiled in.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use thiserror::Error;

// -------------------- event stream --------------------

/// One record bound for the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub data: String,
    pub partition_key: String,
}

/// Per-record result of a `put_records` call, in submission order.
#[derive(Clone, Debug, Default)]
pub struct RecordResult {
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PutRecordsOutput {
    pub results: Vec<RecordResult>,
}

impl PutRecordsOutput {
    pub fn success(count: usize) -> Self {
        Self {
            results: vec![RecordResult::default(); count],
        }
    }

    pub fn failed_record_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.error_code.is_some())
            .count()
    }
}

#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Whole-call service error with a service error code.
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    #[error("stream transport error: {0}")]
    Transport(String),
}

impl StreamClientError {
    /// Throttling and availability errors retry the whole batch; other
    /// client errors fail it permanently.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamClientError::Service { code, .. } => {
                code == "ProvisionedThroughputExceededException" || code == "ServiceUnavailable"
            }
            StreamClientError::Transport(_) => false,
        }
    }
}

/// `put_records` is the only data-plane operation the event publisher uses.
pub trait StreamClient: Send + Sync {
    fn put_records(
        &self,
        stream_name: &str,
        records: &[StreamRecord],
    ) -> Result<PutRecordsOutput, StreamClientError>;
}

/// Scripted response for the in-memory stream client.
pub enum PlannedResponse {
    /// Every record succeeds.
    Success,
    /// Records at these (submission-order) indices fail with the code.
    RecordErrors(Vec<(usize, String)>),
    /// The whole call errors.
    CallError { code: String, message: String },
}

/// In-memory stream client recording every batch it was handed.
pub struct InMemoryStreamClient {
    state: Mutex<StreamClientState>,
}

struct StreamClientState {
    batches: Vec<Vec<StreamRecord>>,
    script: VecDeque<PlannedResponse>,
}

impl InMemoryStreamClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamClientState {
                batches: Vec::new(),
                script: VecDeque::new(),
            }),
        }
    }

    /// Queue a response for the next call; unscripted calls succeed.
    pub fn plan(&self, response: PlannedResponse) {
        self.state.lock().unwrap().script.push_back(response);
    }

    pub fn batches(&self) -> Vec<Vec<StreamRecord>> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().batches.len()
    }
}

impl Default for InMemoryStreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClient for InMemoryStreamClient {
    fn put_records(
        &self,
        _stream_name: &str,
        records: &[StreamRecord],
    ) -> Result<PutRecordsOutput, StreamClientError> {
        let mut state = self.state.lock().unwrap();
        state.batches.push(records.to_vec());
        match state.script.pop_front() {
            None | Some(PlannedResponse::Success) => Ok(PutRecordsOutput::success(records.len())),
            Some(PlannedResponse::RecordErrors(failures)) => {
                let mut output = PutRecordsOutput::success(records.len());
                for (index, code) in failures {
                    if let Some(result) = output.results.get_mut(index) {
                        result.error_code = Some(code);
                        result.error_message = Some("planned failure".to_string());
                    }
                }
                Ok(output)
            }
            Some(PlannedResponse::CallError { code, message }) => {
                Err(StreamClientError::Service { code, message })
            }
        }
    }
}

// -------------------- object store --------------------

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    #[error("object store transport error: {0}")]
    Transport(String),
}

/// `put_object` is the only operation the snapshot publisher uses.
pub trait ObjectStore: Send + Sync {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError>;
}

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

pub struct InMemoryObjectStore {
    state: Mutex<ObjectStoreState>,
}

struct ObjectStoreState {
    objects: Vec<StoredObject>,
    fail_next: bool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ObjectStoreState {
                objects: Vec::new(),
                fail_next: false,
            }),
        }
    }

    pub fn fail_next_put(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.state.lock().unwrap().objects.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .map(|o| o.key.clone())
            .collect()
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next {
            state.fail_next = false;
            return Err(ObjectStoreError::Service {
                code: "AccessDenied".to_string(),
                message: "planned failure".to_string(),
            });
        }
        state.objects.push(StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body,
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        });
        Ok(())
    }
}

// -------------------- metadata table --------------------

/// Attribute value as the metadata store accepts it. There is no float
/// variant: every number travels as an arbitrary-precision decimal string.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    S(String),
    N(String),
    Bool(bool),
    L(Vec<AttrValue>),
    M(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    pub fn as_n(&self) -> Option<&str> {
        match self {
            AttrValue::N(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }
}

pub type TableItem = BTreeMap<String, AttrValue>;

#[derive(Debug, Error)]
pub enum TableClientError {
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    #[error("table transport error: {0}")]
    Transport(String),
}

/// Operations the metadata publisher uses: single put, chunked batch put,
/// and the camera/time-range query over the secondary index.
pub trait TableClient: Send + Sync {
    fn put_item(&self, table: &str, item: &TableItem) -> Result<(), TableClientError>;

    fn batch_put(&self, table: &str, items: &[TableItem]) -> Result<(), TableClientError>;

    fn query_by_camera(
        &self,
        table: &str,
        camera_id: &str,
        start_ts_ms: Option<i64>,
        end_ts_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TableItem>, TableClientError>;
}

pub struct InMemoryTableClient {
    state: Mutex<TableState>,
}

struct TableState {
    items: Vec<TableItem>,
    batch_calls: usize,
    fail_next: bool,
}

impl InMemoryTableClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                items: Vec::new(),
                batch_calls: 0,
                fail_next: false,
            }),
        }
    }

    pub fn fail_next_call(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    pub fn items(&self) -> Vec<TableItem> {
        self.state.lock().unwrap().items.clone()
    }

    pub fn batch_calls(&self) -> usize {
        self.state.lock().unwrap().batch_calls
    }

    fn check_fail(state: &mut TableState) -> Result<(), TableClientError> {
        if state.fail_next {
            state.fail_next = false;
            return Err(TableClientError::Service {
                code: "AccessDeniedException".to_string(),
                message: "planned failure".to_string(),
            });
        }
        Ok(())
    }

    fn item_ts_ms(item: &TableItem) -> Option<i64> {
        item.get("ts_ms").and_then(|v| v.as_n()).and_then(|n| n.parse().ok())
    }
}

impl Default for InMemoryTableClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TableClient for InMemoryTableClient {
    fn put_item(&self, _table: &str, item: &TableItem) -> Result<(), TableClientError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state)?;
        state.items.push(item.clone());
        Ok(())
    }

    fn batch_put(&self, _table: &str, items: &[TableItem]) -> Result<(), TableClientError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state)?;
        state.batch_calls += 1;
        state.items.extend(items.iter().cloned());
        Ok(())
    }

    fn query_by_camera(
        &self,
        _table: &str,
        camera_id: &str,
        start_ts_ms: Option<i64>,
        end_ts_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TableItem>, TableClientError> {
        let state = self.state.lock().unwrap();
        let mut matches: Vec<TableItem> = state
            .items
            .iter()
            .filter(|item| item.get("camera_id").and_then(|v| v.as_s()) == Some(camera_id))
            .filter(|item| match Self::item_ts_ms(item) {
                Some(ts) => {
                    start_ts_ms.map_or(true, |start| ts >= start)
                        && end_ts_ms.map_or(true, |end| ts <= end)
                }
                None => false,
            })
            .cloned()
            .collect();
        // Most recent first, like the secondary-index query.
        matches.sort_by_key(|item| std::cmp::Reverse(Self::item_ts_ms(item).unwrap_or(0)));
        matches.truncate(limit);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes_are_throttling_and_unavailable() {
        let throttled = StreamClientError::Service {
            code: "ProvisionedThroughputExceededException".to_string(),
            message: String::new(),
        };
        assert!(throttled.is_retryable());
        let denied = StreamClientError::Service {
            code: "AccessDeniedException".to_string(),
            message: String::new(),
        };
        assert!(!denied.is_retryable());
        assert!(!StreamClientError::Transport("boom".to_string()).is_retryable());
    }

    #[test]
    fn in_memory_stream_client_replays_planned_failures() {
        let client = InMemoryStreamClient::new();
        client.plan(PlannedResponse::RecordErrors(vec![(
            1,
            "ProvisionedThroughputExceededException".to_string(),
        )]));
        let records = vec![
            StreamRecord {
                data: "a".to_string(),
                partition_key: "k".to_string(),
            },
            StreamRecord {
                data: "b".to_string(),
                partition_key: "k".to_string(),
            },
        ];
        let output = client.put_records("s", &records).unwrap();
        assert_eq!(output.failed_record_count(), 1);
        assert!(output.results[0].error_code.is_none());
        assert!(output.results[1].error_code.is_some());
        // Unscripted second call succeeds.
        let output = client.put_records("s", &records).unwrap();
        assert_eq!(output.failed_record_count(), 0);
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn table_query_filters_by_camera_and_range() {
        let client = InMemoryTableClient::new();
        for (camera, ts) in [("cam-a", 1000), ("cam-a", 2000), ("cam-b", 1500)] {
            let mut item = TableItem::new();
            item.insert("camera_id".to_string(), AttrValue::S(camera.to_string()));
            item.insert("ts_ms".to_string(), AttrValue::N(ts.to_string()));
            client.put_item("t", &item).unwrap();
        }
        let rows = client
            .query_by_camera("t", "cam-a", Some(1500), None, 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("ts_ms").unwrap().as_n(), Some("2000"));
        let rows = client.query_by_camera("t", "cam-a", None, None, 10).unwrap();
        assert_eq!(rows.len(), 2);
        // Most recent first.
        assert_eq!(rows[0].get("ts_ms").unwrap().as_n(), Some("2000"));
    }
}

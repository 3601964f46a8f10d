#![allow(dead_code)]
//! Shared fixtures: delta logs written into an in-memory store.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow_json::ReaderBuilder;
use arrow_schema::{DataType, Field, Fields, Schema};
use bytes::Bytes;
use dashmap::DashMap;
use deltaread_core::kernel::Snapshot;
use deltaread_core::logstore::commit_uri_from_version;
use deltaread_core::{DeltaTable, DeltaTableBuilder};
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult, Result as ObjectStoreResult,
};
use parquet::arrow::ArrowWriter;
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};

pub const SCHEMA_STRING: &str = r#"{"type":"struct","fields":[{"name":"id","type":"long","nullable":true,"metadata":{}},{"name":"part","type":"string","nullable":true,"metadata":{}}]}"#;

pub fn protocol(min_reader_version: i32, min_writer_version: i32) -> Value {
    json!({"protocol": {
        "minReaderVersion": min_reader_version,
        "minWriterVersion": min_writer_version,
    }})
}

pub fn metadata(name: &str) -> Value {
    json!({"metaData": {
        "id": "5fba94ed-9794-4965-ba6e-6ee3c0d22af9",
        "name": name,
        "format": {"provider": "parquet", "options": {}},
        "schemaString": SCHEMA_STRING,
        "partitionColumns": ["part"],
        "configuration": {"delta.appendOnly": "false"},
        "createdTime": 1587968585495i64,
    }})
}

pub fn add(path: &str, size: i64) -> Value {
    json!({"add": {
        "path": path,
        "partitionValues": {"part": "a"},
        "size": size,
        "modificationTime": 1587968586000i64,
        "dataChange": true,
    }})
}

pub fn remove(path: &str) -> Value {
    json!({"remove": {
        "path": path,
        "deletionTimestamp": 1587968596250i64,
        "dataChange": true,
    }})
}

pub fn txn(app_id: &str, version: i64) -> Value {
    json!({"txn": {"appId": app_id, "version": version}})
}

pub fn commit_info(operation: &str) -> Value {
    json!({"commitInfo": {"timestamp": 1587968586154i64, "operation": operation}})
}

/// Write the commit file for `version`, one action per line
pub async fn write_commit(store: &dyn ObjectStore, version: i64, actions: &[Value]) {
    let body = actions
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    store
        .put(&commit_uri_from_version(version), PutPayload::from(body))
        .await
        .unwrap();
}

pub async fn put(store: &dyn ObjectStore, path: &str, body: impl Into<Bytes>) {
    store
        .put(&Path::from(path), PutPayload::from(body.into()))
        .await
        .unwrap();
}

/// A table over `store`, not loaded yet
pub fn table(store: Arc<dyn ObjectStore>) -> DeltaTable {
    DeltaTableBuilder::from_uri("memory:///")
        .unwrap()
        .with_storage_backend(store)
        .build()
        .unwrap()
}

fn string_map() -> DataType {
    DataType::Map(
        Arc::new(Field::new(
            "key_value",
            DataType::Struct(Fields::from(vec![
                Field::new("key", DataType::Utf8, false),
                Field::new("value", DataType::Utf8, true),
            ])),
            false,
        )),
        false,
    )
}

fn checkpoint_schema() -> Schema {
    let string_list = DataType::new_list(DataType::Utf8, true);
    Schema::new(vec![
        Field::new(
            "txn",
            DataType::Struct(Fields::from(vec![
                Field::new("appId", DataType::Utf8, true),
                Field::new("version", DataType::Int64, true),
                Field::new("lastUpdated", DataType::Int64, true),
            ])),
            true,
        ),
        Field::new(
            "add",
            DataType::Struct(Fields::from(vec![
                Field::new("path", DataType::Utf8, true),
                Field::new("partitionValues", string_map(), true),
                Field::new("size", DataType::Int64, true),
                Field::new("modificationTime", DataType::Int64, true),
                Field::new("dataChange", DataType::Boolean, true),
                Field::new("stats", DataType::Utf8, true),
            ])),
            true,
        ),
        Field::new(
            "remove",
            DataType::Struct(Fields::from(vec![
                Field::new("path", DataType::Utf8, true),
                Field::new("deletionTimestamp", DataType::Int64, true),
                Field::new("dataChange", DataType::Boolean, true),
            ])),
            true,
        ),
        Field::new(
            "metaData",
            DataType::Struct(Fields::from(vec![
                Field::new("id", DataType::Utf8, true),
                Field::new("name", DataType::Utf8, true),
                Field::new("description", DataType::Utf8, true),
                Field::new(
                    "format",
                    DataType::Struct(Fields::from(vec![
                        Field::new("provider", DataType::Utf8, true),
                        Field::new("options", string_map(), true),
                    ])),
                    true,
                ),
                Field::new("schemaString", DataType::Utf8, true),
                Field::new("partitionColumns", string_list.clone(), true),
                Field::new("configuration", string_map(), true),
                Field::new("createdTime", DataType::Int64, true),
            ])),
            true,
        ),
        Field::new(
            "protocol",
            DataType::Struct(Fields::from(vec![
                Field::new("minReaderVersion", DataType::Int32, true),
                Field::new("minWriterVersion", DataType::Int32, true),
                Field::new("readerFeatures", string_list.clone(), true),
                Field::new("writerFeatures", string_list, true),
            ])),
            true,
        ),
    ])
}

/// Encode actions as a parquet checkpoint file
pub fn checkpoint_parquet(actions: &[Value]) -> Bytes {
    let schema = Arc::new(checkpoint_schema());
    let lines = actions
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    let mut reader = ReaderBuilder::new(schema.clone())
        .build(Cursor::new(lines.into_bytes()))
        .unwrap();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
    for batch in reader.by_ref() {
        writer.write(&batch.unwrap()).unwrap();
    }
    writer.close().unwrap();
    Bytes::from(buffer)
}

/// The state of `snapshot` as checkpoint actions
pub fn checkpoint_actions(snapshot: &Snapshot) -> Vec<Value> {
    let mut actions = vec![
        json!({"protocol": snapshot.protocol()}),
        json!({"metaData": snapshot.metadata()}),
    ];
    actions.extend(
        snapshot
            .transactions()
            .values()
            .map(|txn| json!({"txn": txn})),
    );
    let mut adds: Vec<_> = snapshot.file_actions_iter().unwrap().collect();
    adds.sort_by(|a, b| a.path.cmp(&b.path));
    actions.extend(adds.into_iter().map(|add| json!({"add": add})));
    actions
}

/// In-memory store whose reads can be held back or slowed down per path
#[derive(Debug, Default)]
pub struct GatedStore {
    inner: InMemory,
    gates: DashMap<Path, Arc<Semaphore>>,
    delays: DashMap<Path, Duration>,
    entered: Notify,
    gets: DashMap<Path, usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedStore {
    /// Block reads of `path` until [`GatedStore::open`] is called
    pub fn close(&self, path: Path) {
        self.gates.insert(path, Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self, path: &Path) {
        if let Some((_, gate)) = self.gates.remove(path) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn delay(&self, path: Path, delay: Duration) {
        self.delays.insert(path, delay);
    }

    /// Resolves once a read is waiting at a closed gate
    pub async fn blocked(&self) {
        self.entered.notified().await
    }

    pub fn get_count(&self, path: &Path) -> usize {
        self.gets.get(path).map(|c| *c.value()).unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for GatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GatedStore({} gates)", self.gates.len())
    }
}

#[async_trait::async_trait]
impl ObjectStore for GatedStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        options: PutOptions,
    ) -> ObjectStoreResult<PutResult> {
        self.inner.put_opts(location, payload, options).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        options: PutMultipartOpts,
    ) -> ObjectStoreResult<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, options).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> ObjectStoreResult<GetResult> {
        *self.gets.entry(location.clone()).or_insert(0) += 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let gate = self.gates.get(location).map(|g| g.value().clone());
        if let Some(gate) = gate {
            self.entered.notify_one();
            let _permit = gate.acquire().await;
        }
        let delay = self.delays.get(location).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.inner.get_opts(location, options).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, location: &Path) -> ObjectStoreResult<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, ObjectStoreResult<ObjectMeta>> {
        self.inner.list(prefix)
    }

    fn list_with_offset(
        &self,
        prefix: Option<&Path>,
        offset: &Path,
    ) -> BoxStream<'static, ObjectStoreResult<ObjectMeta>> {
        self.inner.list_with_offset(prefix, offset)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> ObjectStoreResult<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> ObjectStoreResult<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> ObjectStoreResult<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

//! Helpers writing delta logs into an in-memory store

use std::sync::Arc;

use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde_json::{json, Value};

use crate::logstore::{commit_uri_from_version, logstore_with, LogStoreRef, StorageConfig};
use crate::storage::TableLocation;
use crate::{DeltaTable, DeltaTableConfig};

pub const SCHEMA_STRING: &str = r#"{"type":"struct","fields":[{"name":"id","type":"long","nullable":true,"metadata":{}},{"name":"part","type":"string","nullable":true,"metadata":{}}]}"#;

/// A table log backed by [`InMemory`]
pub struct TestLog {
    store: Arc<InMemory>,
}

impl TestLog {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    pub fn store(&self) -> Arc<InMemory> {
        self.store.clone()
    }

    /// Write the commit file for `version`, one action per line
    pub async fn commit(&self, version: i64, actions: &[Value]) {
        let body = actions
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        self.put(commit_uri_from_version(version), body).await;
    }

    pub async fn put(&self, path: Path, body: impl Into<String>) {
        self.store
            .put(&path, PutPayload::from(body.into()))
            .await
            .unwrap();
    }

    pub fn log_store(&self) -> LogStoreRef {
        logstore_with(
            self.store.clone(),
            TableLocation::parse("memory:///").unwrap(),
            StorageConfig::default(),
        )
    }

    pub fn table(&self) -> DeltaTable {
        DeltaTable::new(self.log_store(), DeltaTableConfig::default())
    }
}

pub fn protocol(min_reader_version: i32, min_writer_version: i32) -> Value {
    json!({"protocol": {
        "minReaderVersion": min_reader_version,
        "minWriterVersion": min_writer_version,
    }})
}

pub fn metadata(partition_columns: &[&str]) -> Value {
    json!({"metaData": {
        "id": "5fba94ed-9794-4965-ba6e-6ee3c0d22af9",
        "format": {"provider": "parquet", "options": {}},
        "schemaString": SCHEMA_STRING,
        "partitionColumns": partition_columns,
        "configuration": {},
        "createdTime": 1587968585495i64,
    }})
}

pub fn add(path: &str, size: i64) -> Value {
    json!({"add": {
        "path": path,
        "partitionValues": {},
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

pub fn commit_info(operation: &str) -> Value {
    json!({"commitInfo": {
        "timestamp": 1587968586154i64,
        "operation": operation,
        "operationParameters": {},
    }})
}

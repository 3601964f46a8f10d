//! Decoding of actions from parquet checkpoint rows.
//!
//! Every checkpoint row holds exactly one non-null top level struct column, named after the
//! action it carries (`add`, `remove`, `metaData`, ...).
use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, ListAccessor, MapAccessor, Row, RowAccessor};
use tracing::debug;

use crate::kernel::models::actions::serde_path::decode_path;
use crate::kernel::{
    Action, Add, CheckpointMetadata, DomainMetadata, Format, Metadata, Protocol, ReaderFeatures,
    Remove, Sidecar, Transaction,
};
use crate::protocol::ProtocolError;
use crate::{DeltaResult, DeltaTableError};

/// Read all actions of a parquet checkpoint (or sidecar) file for table `version`.
pub(crate) fn read_actions(version: i64, bytes: Bytes) -> DeltaResult<Vec<Action>> {
    let reader = SerializedFileReader::new(bytes)?;
    let num_rows = reader.metadata().file_metadata().num_rows();
    debug!("decoding {num_rows} checkpoint rows for version {version}");

    let mut actions = Vec::with_capacity(num_rows.max(0) as usize);
    for row in reader.get_row_iter(None)? {
        let row = row?;
        match Action::from_parquet_record(&row) {
            Ok(Some(action)) => actions.push(action),
            Ok(None) => {}
            Err(err) => {
                return Err(DeltaTableError::corrupt_entry(version, row.to_string(), err))
            }
        }
    }
    Ok(actions)
}

/// Decode a parquet `map<string,string>` column. `None` when the column is null.
fn parse_string_map(
    record: &Row,
    i: usize,
    action: &str,
    field: &str,
) -> Result<Option<HashMap<String, Option<String>>>, ProtocolError> {
    let Ok(pmap) = record.get_map(i) else {
        return Ok(None);
    };
    let (keys, values) = (pmap.get_keys(), pmap.get_values());
    let mut map = HashMap::with_capacity(pmap.len());
    for j in 0..pmap.len() {
        let key = keys.get_string(j).map_err(|_| {
            ProtocolError::InvalidField(format!("{action}.{field} has a non string key"))
        })?;
        map.entry(key.clone())
            .or_insert_with(|| values.get_string(j).ok().cloned());
    }
    Ok(Some(map))
}

fn string_list(field: &Field) -> Option<Vec<String>> {
    match field {
        Field::ListInternal(list) => Some(
            list.elements()
                .iter()
                .filter_map(|f| match f {
                    Field::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    }
}

fn type_error(action: &str, field: &str, expected: &str) -> ProtocolError {
    ProtocolError::InvalidField(format!("{action}.{field} should be a {expected}"))
}

fn required_path(record: &Row, i: usize, action: &str) -> Result<String, ProtocolError> {
    let raw = record
        .get_string(i)
        .map_err(|_| type_error(action, "path", "string"))?;
    Ok(decode_path(raw)?)
}

impl Add {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self {
            size: -1,
            modification_time: -1,
            data_change: true,
            ..Default::default()
        };

        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "path" => re.path = required_path(record, i, "add")?,
                "size" => {
                    re.size = record
                        .get_long(i)
                        .map_err(|_| type_error("add", "size", "long"))?;
                }
                "modificationTime" => {
                    re.modification_time = record
                        .get_long(i)
                        .map_err(|_| type_error("add", "modificationTime", "long"))?;
                }
                "dataChange" => {
                    re.data_change = record
                        .get_bool(i)
                        .map_err(|_| type_error("add", "dataChange", "bool"))?;
                }
                "partitionValues" => {
                    re.partition_values =
                        parse_string_map(record, i, "add", "partitionValues")?.unwrap_or_default();
                }
                "stats" => re.stats = record.get_string(i).ok().cloned(),
                // not tracked; parsed statistics come from the json `stats` column
                "tags" | "deletionVector" | "baseRowId" | "defaultRowCommitVersion"
                | "clusteringProvider" | "stats_parsed" | "partitionValues_parsed" => {}
                _ => debug!("Unexpected field name `{name}` for add action"),
            }
        }

        if re.path.is_empty() {
            return Err(ProtocolError::InvalidRow("add action without a path".into()));
        }
        Ok(re)
    }
}

impl Remove {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self {
            data_change: true,
            ..Default::default()
        };

        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "path" => re.path = required_path(record, i, "remove")?,
                "dataChange" => {
                    re.data_change = record
                        .get_bool(i)
                        .map_err(|_| type_error("remove", "dataChange", "bool"))?;
                }
                "deletionTimestamp" => re.deletion_timestamp = record.get_long(i).ok(),
                "extendedFileMetadata" | "partitionValues" | "size" | "tags"
                | "deletionVector" => {}
                _ => debug!("Unexpected field name `{name}` for remove action"),
            }
        }

        if re.path.is_empty() {
            return Err(ProtocolError::InvalidRow(
                "remove action without a path".into(),
            ));
        }
        Ok(re)
    }
}

impl Metadata {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::default();

        for (i, (name, field)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "id" => {
                    re.id = record
                        .get_string(i)
                        .map_err(|_| type_error("metaData", "id", "string"))?
                        .clone();
                }
                "name" => re.name = record.get_string(i).ok().cloned(),
                "description" => re.description = record.get_string(i).ok().cloned(),
                "partitionColumns" => {
                    re.partition_columns = string_list(field).ok_or_else(|| {
                        type_error("metaData", "partitionColumns", "list")
                    })?;
                }
                "schemaString" => {
                    re.schema_string = record
                        .get_string(i)
                        .map_err(|_| type_error("metaData", "schemaString", "string"))?
                        .clone();
                }
                "createdTime" => re.created_time = record.get_long(i).ok(),
                "configuration" => {
                    re.configuration = parse_string_map(record, i, "metaData", "configuration")?
                        .unwrap_or_default();
                }
                "format" => {
                    let format_record = record
                        .get_group(i)
                        .map_err(|_| type_error("metaData", "format", "struct"))?;
                    re.format = Format::from_parquet_record(format_record)?;
                }
                _ => debug!("Unexpected field name `{name}` for metaData action"),
            }
        }

        Ok(re)
    }
}

impl Format {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::default();
        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "provider" => {
                    re.provider = record
                        .get_string(i)
                        .map_err(|_| {
                            type_error("metaData", "format.provider", "string")
                        })?
                        .clone();
                }
                "options" => {
                    re.options = parse_string_map(record, i, "metaData", "format.options")?
                        .unwrap_or_default();
                }
                _ => debug!("Unexpected field name `{name}` for metaData.format"),
            }
        }
        Ok(re)
    }
}

impl Protocol {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::new(-1, -1);

        for (i, (name, field)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "minReaderVersion" => {
                    re.min_reader_version = record.get_int(i).map_err(|_| {
                        type_error("protocol", "minReaderVersion", "int")
                    })?;
                }
                "minWriterVersion" => {
                    re.min_writer_version = record.get_int(i).map_err(|_| {
                        type_error("protocol", "minWriterVersion", "int")
                    })?;
                }
                "readerFeatures" => {
                    re.reader_features = string_list(field).map(|features| {
                        features
                            .into_iter()
                            .map(ReaderFeatures::from)
                            .collect::<HashSet<_>>()
                    });
                }
                "writerFeatures" => {
                    re.writer_features =
                        string_list(field).map(|features| features.into_iter().collect());
                }
                _ => debug!("Unexpected field name `{name}` for protocol action"),
            }
        }

        if re.min_reader_version < 0 {
            return Err(ProtocolError::InvalidRow(
                "protocol action without minReaderVersion".into(),
            ));
        }
        Ok(re)
    }
}

impl Transaction {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::default();

        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "appId" => {
                    re.app_id = record
                        .get_string(i)
                        .map_err(|_| type_error("txn", "appId", "string"))?
                        .clone();
                }
                "version" => {
                    re.version = record
                        .get_long(i)
                        .map_err(|_| type_error("txn", "version", "long"))?;
                }
                "lastUpdated" => re.last_updated = record.get_long(i).ok(),
                _ => debug!("Unexpected field name `{name}` for txn action"),
            }
        }

        Ok(re)
    }
}

impl DomainMetadata {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::default();
        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "domain" => {
                    re.domain = record
                        .get_string(i)
                        .map_err(|_| type_error("domainMetadata", "domain", "string"))?
                        .clone();
                }
                "configuration" => {
                    re.configuration = record.get_string(i).cloned().unwrap_or_default()
                }
                "removed" => re.removed = record.get_bool(i).unwrap_or_default(),
                _ => debug!("Unexpected field name `{name}` for domainMetadata action"),
            }
        }
        Ok(re)
    }
}

impl CheckpointMetadata {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::default();
        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "version" => {
                    re.version = record.get_long(i).map_err(|_| {
                        type_error("checkpointMetadata", "version", "long")
                    })?;
                }
                "tags" => {}
                _ => debug!("Unexpected field name `{name}` for checkpointMetadata action"),
            }
        }
        Ok(re)
    }
}

impl Sidecar {
    fn from_parquet_record(record: &Row) -> Result<Self, ProtocolError> {
        let mut re = Self::default();
        for (i, (name, _)) in record.get_column_iter().enumerate() {
            match name.as_str() {
                "path" => re.file_name = required_path(record, i, "sidecar")?,
                "sizeInBytes" => re.size_in_bytes = record.get_long(i).unwrap_or_default(),
                "modificationTime" => {
                    re.modification_time = record.get_long(i).unwrap_or_default()
                }
                "tags" => {}
                _ => debug!("Unexpected field name `{name}` for sidecar action"),
            }
        }
        Ok(re)
    }
}

impl Action {
    /// Returns the action held by a parquet checkpoint row.
    ///
    /// `None` for rows carrying an action this crate does not read from checkpoints.
    pub fn from_parquet_record(record: &Row) -> Result<Option<Self>, ProtocolError> {
        let Some((name, col_data)) = record.get_column_iter().find_map(|(name, field)| match field {
            Field::Group(group) => Some((name.as_str(), group)),
            _ => None,
        }) else {
            return Err(ProtocolError::InvalidRow(
                "Parquet action row only contains null columns".to_string(),
            ));
        };

        Ok(Some(match name {
            "add" => Action::Add(Add::from_parquet_record(col_data)?),
            "remove" => Action::Remove(Remove::from_parquet_record(col_data)?),
            "metaData" => Action::Metadata(Metadata::from_parquet_record(col_data)?),
            "protocol" => Action::Protocol(Protocol::from_parquet_record(col_data)?),
            "txn" => Action::Txn(Transaction::from_parquet_record(col_data)?),
            "domainMetadata" => {
                Action::DomainMetadata(DomainMetadata::from_parquet_record(col_data)?)
            }
            "checkpointMetadata" => {
                Action::CheckpointMetadata(CheckpointMetadata::from_parquet_record(col_data)?)
            }
            "sidecar" => Action::Sidecar(Sidecar::from_parquet_record(col_data)?),
            other => {
                debug!("ignoring `{other}` action in checkpoint");
                return Ok(None);
            }
        }))
    }
}

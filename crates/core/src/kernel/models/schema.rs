//! Delta table schema
//!
//! Schemas are stored as JSON in the `schemaString` of the table metadata.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Type alias for a top level schema
pub type Schema = StructType;
/// Schema reference type
pub type SchemaRef = Arc<StructType>;

/// A struct, used for the table schema and nested records
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    #[serde(rename = "type")]
    type_name: String,
    fields: Vec<StructField>,
}

impl StructType {
    #[allow(missing_docs)]
    pub fn new(fields: impl IntoIterator<Item = StructField>) -> Self {
        Self {
            type_name: "struct".to_string(),
            fields: fields.into_iter().collect(),
        }
    }

    /// Fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = &StructField> {
        self.fields.iter()
    }

    /// Top level field called `name`
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[allow(missing_docs)]
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// A named field of a [`StructType`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    /// Name of this (possibly nested) column
    pub name: String,
    /// The data type of this field
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Denotes whether this Field can be null
    pub nullable: bool,
    /// A JSON map containing information about this column, e.g. column mapping ids
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StructField {
    /// Field without column metadata
    pub fn new(name: impl Into<String>, data_type: impl Into<DataType>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            metadata: HashMap::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Physical name when column mapping is enabled
    pub fn physical_name(&self) -> &str {
        match self.metadata.get("delta.columnMapping.physicalName") {
            Some(serde_json::Value::String(name)) => name,
            _ => &self.name,
        }
    }
}

/// A list column
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArrayType {
    #[serde(rename = "type")]
    type_name: String,
    #[allow(missing_docs)]
    pub element_type: DataType,
    /// Whether elements may be null
    pub contains_null: bool,
}

/// A map column. Keys are never null.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct MapType {
    #[serde(rename = "type")]
    type_name: String,
    pub key_type: DataType,
    pub value_type: DataType,
    pub value_contains_null: bool,
}

/// Type of a column, nested types boxed
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum DataType {
    Primitive(PrimitiveType),
    Struct(Box<StructType>),
    Array(Box<ArrayType>),
    Map(Box<MapType>),
}

impl From<PrimitiveType> for DataType {
    fn from(value: PrimitiveType) -> Self {
        Self::Primitive(value)
    }
}

impl From<StructType> for DataType {
    fn from(value: StructType) -> Self {
        Self::Struct(Box::new(value))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{p}"),
            Self::Struct(s) => {
                write!(f, "struct<")?;
                for (i, field) in s.fields().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, ">")
            }
            Self::Array(a) => write!(f, "array<{}>", a.element_type),
            Self::Map(m) => write!(f, "map<{}, {}>", m.key_type, m.value_type),
        }
    }
}

/// Leaf types, serialized by name, e.g. `"long"` or `"decimal(10,2)"`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
#[allow(missing_docs)]
pub enum PrimitiveType {
    String,
    Long,
    Integer,
    Short,
    Byte,
    Float,
    Double,
    Boolean,
    Binary,
    Date,
    Timestamp,
    TimestampNtz,
    /// Precision and scale
    Decimal(u8, u8),
}

impl TryFrom<String> for PrimitiveType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(match value.as_str() {
            "string" => Self::String,
            "long" => Self::Long,
            "integer" => Self::Integer,
            "short" => Self::Short,
            "byte" => Self::Byte,
            "float" => Self::Float,
            "double" => Self::Double,
            "boolean" => Self::Boolean,
            "binary" => Self::Binary,
            "date" => Self::Date,
            "timestamp" => Self::Timestamp,
            "timestamp_ntz" => Self::TimestampNtz,
            other => {
                let invalid = || format!("unknown primitive type: {other}");
                let (precision, scale) = other
                    .strip_prefix("decimal(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|args| args.split_once(','))
                    .ok_or_else(invalid)?;
                Self::Decimal(
                    precision.trim().parse().map_err(|_| invalid())?,
                    scale.trim().parse().map_err(|_| invalid())?,
                )
            }
        })
    }
}

impl From<PrimitiveType> for String {
    fn from(value: PrimitiveType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Long => f.write_str("long"),
            Self::Integer => f.write_str("integer"),
            Self::Short => f.write_str("short"),
            Self::Byte => f.write_str("byte"),
            Self::Float => f.write_str("float"),
            Self::Double => f.write_str("double"),
            Self::Boolean => f.write_str("boolean"),
            Self::Binary => f.write_str("binary"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::TimestampNtz => f.write_str("timestamp_ntz"),
            Self::Decimal(precision, scale) => write!(f, "decimal({precision},{scale})"),
        }
    }
}

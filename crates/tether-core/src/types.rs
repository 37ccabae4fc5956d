use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataValue {
    Null,
    Int64(i64),
    Float64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    Null,
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
}

impl DataValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DataValue::Null => DataType::Null,
            DataValue::Int64(_) => DataType::Integer,
            DataValue::Float64(_) => DataType::Float,
            DataValue::Bool(_) => DataType::Boolean,
            DataValue::String(_) => DataType::Text,
            DataValue::Bytes(_) => DataType::Binary,
        }
    }

    /// Text spliced into a statement when the value is used as a token.
    pub fn to_literal(&self) -> String {
        match self {
            DataValue::Null => "NULL".to_string(),
            DataValue::Int64(v) => v.to_string(),
            DataValue::Float64(v) => v.to_string(),
            DataValue::Bool(v) => v.to_string(),
            DataValue::String(v) => v.clone(),
            DataValue::Bytes(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Null => "NULL",
            DataType::Integer => "BIGINT",
            DataType::Float => "DOUBLE",
            DataType::Boolean => "BOOLEAN",
            DataType::Text => "TEXT",
            DataType::Binary => "BYTEA",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRow {
    pub values: Vec<DataValue>,
}

/// Tabular value returned by select statements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<DataRow>,
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

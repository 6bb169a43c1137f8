//! Query result types for the adapter layer.
//!
//! Defines the structures used to represent query results, execution
//! options, and streamed row batches across all dialects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Options applied to a single query execution.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Per-query timeout; adapters fall back to their own default when
    /// unset.
    pub timeout: Option<Duration>,
    /// Maximum rows to materialize before truncating.
    pub max_rows: Option<usize>,
    /// When true the adapter rejects mutating SQL even if the connection
    /// itself is writable.
    pub read_only: bool,
}

impl QueryOptions {
    /// Options for a bounded read.
    pub fn read(max_rows: usize) -> Self {
        Self {
            timeout: None,
            max_rows: Some(max_rows),
            read_only: true,
        }
    }
}

/// Represents the result of executing a SQL statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column metadata for the result set.
    pub columns: Vec<ColumnInfo>,

    /// Rows of data.
    pub rows: Vec<Row>,

    /// Rows affected for DML statements (0 for reads).
    pub rows_affected: u64,

    /// Whether the result was truncated at the row cap.
    #[serde(default)]
    pub truncated: bool,

    /// Time taken to execute the statement.
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
}

impl ResultSet {
    /// Creates a result with the given columns and rows.
    pub fn with_data(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
            truncated: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Creates a rows-affected result for DML.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    /// Sets the elapsed time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Returns true if the result set has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One batch from a streamed query. Columns are repeated on every batch so
/// consumers can process batches independently.
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type, as the driver reports it.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value for display and for JSON-friendly tool output.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }

    /// Converts to a JSON value for function responses.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// Serde support for Duration (not natively supported by serde).
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_display_string(), "NULL");
        assert_eq!(Value::Bool(true).to_display_string(), "true");
        assert_eq!(Value::Int(42).to_display_string(), "42");
        assert_eq!(Value::Float(2.71).to_display_string(), "2.71");
        assert_eq!(Value::String("hi".into()).to_display_string(), "hi");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).to_display_string(), "<3 bytes>");
    }

    #[test]
    fn test_value_from_conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from(42i64), Value::Int(42));
        assert_eq!(Value::from(2.71f64), Value::Float(2.71));
        assert_eq!(Value::from("hi"), Value::String("hi".into()));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(42i32)), Value::Int(42));
    }

    #[test]
    fn test_value_to_json() {
        assert_eq!(Value::Int(7).to_json(), serde_json::json!(7));
        assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
        assert_eq!(
            Value::String("x".into()).to_json(),
            serde_json::json!("x")
        );
    }

    #[test]
    fn test_result_set_constructors() {
        let rs = ResultSet::with_data(
            vec![ColumnInfo::new("id", "integer")],
            vec![vec![Value::Int(1)]],
        );
        assert!(!rs.is_empty());
        assert_eq!(rs.rows_affected, 0);
        assert!(!rs.truncated);

        let dml = ResultSet::affected(3);
        assert!(dml.is_empty());
        assert_eq!(dml.rows_affected, 3);
    }

    #[test]
    fn test_result_set_serde_round_trip() {
        let rs = ResultSet::with_data(
            vec![ColumnInfo::new("a", "text")],
            vec![vec![Value::String("x".into())]],
        )
        .with_elapsed(Duration::from_millis(12));
        let json = serde_json::to_string(&rs).unwrap();
        let back: ResultSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.elapsed, Duration::from_millis(12));
        assert_eq!(back.rows, rs.rows);
    }
}

//! Default result-row mapper.

use crate::core::traits::RowMapper;
use crate::core::value::{ResultRow, TableRow, Value};
use crate::error::Result;

/// Maps each column label to its value.
///
/// By default temporal values are rendered as text in the canonical
/// warehouse formats (`YYYY-MM-DD HH:MM:SS.ffffff`, with a ` UTC` suffix for
/// instants); [`LabelRowMapper::typed`] keeps them as typed values.
#[derive(Debug, Clone, Copy)]
pub struct LabelRowMapper {
    temporal_as_text: bool,
}

impl Default for LabelRowMapper {
    fn default() -> Self {
        Self {
            temporal_as_text: true,
        }
    }
}

impl LabelRowMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mapper that passes every value through unchanged.
    pub fn typed() -> Self {
        Self {
            temporal_as_text: false,
        }
    }

    fn convert(&self, value: &Value) -> Value {
        if !self.temporal_as_text {
            return value.clone();
        }
        match value {
            Value::Timestamp(ts) => {
                Value::String(ts.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string())
            }
            Value::DateTime(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            Value::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Value::String(t.format("%H:%M:%S%.6f").to_string()),
            other => other.clone(),
        }
    }
}

impl RowMapper for LabelRowMapper {
    fn map_row(&self, row: &ResultRow) -> Result<TableRow> {
        let mut out = TableRow::with_capacity(row.columns().len());
        for (column, value) in row.iter() {
            out.set(column.label.as_str(), self.convert(value));
        }
        Ok(out)
    }
}

//! Target table schema descriptors.
//!
//! The schema is mostly opaque to the extract core: it is validated when the
//! catalog loads and then passed through to the sink, which creates the
//! target table from it and conforms rows to it.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Column type of a target field.
///
/// Unrecognized type names deserialize to [`FieldType::Unknown`] so that
/// catalog validation can report them together with other issues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    BigNumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    DateTime,
    Geography,
    Json,
    Record,
    Unknown(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "STRING",
            FieldType::Bytes => "BYTES",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Numeric => "NUMERIC",
            FieldType::BigNumeric => "BIGNUMERIC",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Geography => "GEOGRAPHY",
            FieldType::Json => "JSON",
            FieldType::Record => "RECORD",
            FieldType::Unknown(s) => s,
        }
    }
}

impl From<String> for FieldType {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => FieldType::String,
            "BYTES" => FieldType::Bytes,
            "INTEGER" | "INT64" => FieldType::Integer,
            "FLOAT" | "FLOAT64" => FieldType::Float,
            "NUMERIC" | "DECIMAL" => FieldType::Numeric,
            "BIGNUMERIC" | "BIGDECIMAL" => FieldType::BigNumeric,
            "BOOLEAN" | "BOOL" => FieldType::Boolean,
            "TIMESTAMP" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "TIME" => FieldType::Time,
            "DATETIME" => FieldType::DateTime,
            "GEOGRAPHY" => FieldType::Geography,
            "JSON" => FieldType::Json,
            "RECORD" | "STRUCT" => FieldType::Record,
            _ => FieldType::Unknown(s),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field mode. Missing mode means NULLABLE.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
    Unknown(String),
}

impl FieldMode {
    pub fn as_str(&self) -> &str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
            FieldMode::Unknown(s) => s,
        }
    }
}

impl From<String> for FieldMode {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "NULLABLE" => FieldMode::Nullable,
            "REQUIRED" => FieldMode::Required,
            "REPEATED" => FieldMode::Repeated,
            _ => FieldMode::Unknown(s),
        }
    }
}

impl From<FieldMode> for String {
    fn from(m: FieldMode) -> Self {
        m.as_str().to_string()
    }
}

/// One (name, type, mode) column of a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub mode: FieldMode,

    /// Nested fields for RECORD columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
            description: None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Vec<FieldSchema>) -> Self {
        self.fields = fields;
        self
    }

    pub fn is_required(&self) -> bool {
        self.mode == FieldMode::Required
    }
}

/// Ordered sequence of target fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in schema order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Find a field by name, ignoring ASCII case.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Structural problems with this schema. Empty means well-formed.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.fields.is_empty() {
            problems.push("schema has no fields".to_string());
        }
        collect_field_problems(&self.fields, "", &mut problems);
        problems
    }
}

fn collect_field_problems(fields: &[FieldSchema], prefix: &str, problems: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for (idx, field) in fields.iter().enumerate() {
        let path = if field.name.is_empty() {
            format!("{}#{}", prefix, idx)
        } else {
            format!("{}{}", prefix, field.name)
        };

        if field.name.trim().is_empty() {
            problems.push(format!("field {} has an empty name", path));
        } else if !is_valid_field_name(&field.name) {
            problems.push(format!("field name '{}' is not a valid column name", path));
        } else if !seen.insert(field.name.to_ascii_lowercase()) {
            problems.push(format!("duplicate field name '{}'", path));
        }

        if let FieldType::Unknown(t) = &field.field_type {
            problems.push(format!("field '{}' has unknown type '{}'", path, t));
        }
        if let FieldMode::Unknown(m) = &field.mode {
            problems.push(format!("field '{}' has unknown mode '{}'", path, m));
        }

        match (&field.field_type, field.fields.is_empty()) {
            (FieldType::Record, true) => {
                problems.push(format!("RECORD field '{}' declares no nested fields", path))
            }
            (FieldType::Record, false) => {
                collect_field_problems(&field.fields, &format!("{}.", path), problems)
            }
            (_, false) => problems.push(format!(
                "field '{}' of type {} cannot declare nested fields",
                path, field.field_type
            )),
            (_, true) => {}
        }
    }
}

/// Column names: a letter or underscore, then letters, digits or underscores.
fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 300 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

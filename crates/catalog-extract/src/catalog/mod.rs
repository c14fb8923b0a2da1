//! Catalog of extract definitions.
//!
//! A catalog is an ordered list of `{ query, output_table_name, table_schema }`
//! entries loaded once per job. Loading validates every entry and reports
//! all problems together, before anything is executed.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::schema::TableSchema;
use crate::error::{ExtractError, Result};
use crate::sink::is_valid_table_name;

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractDefinition {
    /// SQL executed against the source.
    pub query: String,

    /// Target table name, unique within the catalog.
    pub output_table_name: String,

    /// Target table schema.
    pub table_schema: TableSchema,
}

impl ExtractDefinition {
    pub fn new(
        query: impl Into<String>,
        output_table_name: impl Into<String>,
        table_schema: TableSchema,
    ) -> Self {
        Self {
            query: query.into(),
            output_table_name: output_table_name.into(),
            table_schema,
        }
    }
}

/// A single catalog validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIssue {
    /// Zero-based entry index.
    pub index: usize,
    /// Output table name of the entry, when it has one.
    pub table: Option<String>,
    pub message: String,
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "entry {} ({}): {}", self.index, table, self.message),
            None => write!(f, "entry {}: {}", self.index, self.message),
        }
    }
}

/// Ordered, immutable sequence of extract definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    entries: Vec<ExtractDefinition>,
}

impl Catalog {
    /// Build a catalog, validating every entry.
    pub fn new(entries: Vec<ExtractDefinition>) -> Result<Self> {
        let catalog = Self { entries };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse and validate a YAML schema-array document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let entries: Vec<ExtractDefinition> = serde_yaml::from_str(yaml)?;
        Self::new(entries)
    }

    /// Load and validate a catalog file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ExtractError::Config(format!(
                "Failed to read catalog {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn entries(&self) -> &[ExtractDefinition] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtractDefinition> {
        self.entries.iter()
    }

    /// Collect every problem in the catalog.
    pub fn issues(&self) -> Vec<CatalogIssue> {
        let mut issues = Vec::new();
        let mut first_seen: HashMap<&str, usize> = HashMap::new();

        for (index, entry) in self.entries.iter().enumerate() {
            let name = entry.output_table_name.trim();
            let table = (!name.is_empty()).then(|| name.to_string());
            let mut push = |message: String| {
                issues.push(CatalogIssue {
                    index,
                    table: table.clone(),
                    message,
                })
            };

            if entry.query.trim().is_empty() {
                push("query is empty".to_string());
            }

            if name.is_empty() {
                push("output_table_name is empty".to_string());
            } else if !is_valid_table_name(name) {
                push(format!(
                    "output_table_name '{}' may only contain letters, digits, underscores and hyphens",
                    name
                ));
            } else if let Some(first) = first_seen.get(name) {
                push(format!(
                    "duplicate output_table_name '{}' (first used by entry {})",
                    name, first
                ));
            } else {
                first_seen.insert(name, index);
            }

            for problem in entry.table_schema.problems() {
                push(format!("table_schema: {}", problem));
            }
        }

        issues
    }

    /// Fail with every issue found, or succeed if there are none.
    pub fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ExtractError::CatalogValidation(issues))
        }
    }

    /// SHA-256 of the normalized catalog, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            hasher.update(entry.output_table_name.trim().as_bytes());
            hasher.update([0]);
            hasher.update(entry.query.trim().as_bytes());
            hasher.update([0]);
            if let Ok(schema) = serde_json::to_vec(&entry.table_schema) {
                hasher.update(&schema);
            }
            hasher.update([0xff]);
        }
        format!("{:x}", hasher.finalize())
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a ExtractDefinition;
    type IntoIter = std::slice::Iter<'a, ExtractDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{FieldSchema, FieldType};

    const CATALOG: &str = r#"
- query: SELECT id, name FROM users
  output_table_name: users
  table_schema:
    fields:
      - name: id
        type: INTEGER
        mode: REQUIRED
      - name: name
        type: STRING
- query: SELECT id, total FROM orders
  output_table_name: orders
  table_schema:
    fields:
      - name: id
        type: INTEGER
      - name: total
        type: NUMERIC
"#;

    fn schema() -> TableSchema {
        TableSchema::new(vec![FieldSchema::new("id", FieldType::Integer)])
    }

    #[test]
    fn test_parse_catalog_preserves_order() {
        let catalog = Catalog::from_yaml(CATALOG).unwrap();
        let names: Vec<_> = catalog.iter().map(|e| e.output_table_name.as_str()).collect();
        assert_eq!(names, vec!["users", "orders"]);
        assert_eq!(catalog.entries()[0].table_schema.len(), 2);
    }

    #[test]
    fn test_duplicate_output_table_name_rejected() {
        let result = Catalog::new(vec![
            ExtractDefinition::new("SELECT 1", "users", schema()),
            ExtractDefinition::new("SELECT 2", "users", schema()),
        ]);
        match result {
            Err(ExtractError::CatalogValidation(issues)) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].index, 1);
                assert!(issues[0].message.contains("duplicate output_table_name 'users'"));
            }
            other => panic!("expected CatalogValidation, got {:?}", other),
        }
    }

    #[test]
    fn test_all_issues_reported_together() {
        let catalog = Catalog {
            entries: vec![
                ExtractDefinition::new("  ", "a", schema()),
                ExtractDefinition::new("SELECT 1", "bad name", schema()),
                ExtractDefinition::new("SELECT 1", "c", TableSchema::default()),
            ],
        };
        let issues = catalog.issues();
        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].to_string(), "entry 0 (a): query is empty");
        assert_eq!(issues[1].index, 1);
        assert!(issues[2].message.contains("schema has no fields"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_order_sensitive() {
        let a = Catalog::from_yaml(CATALOG).unwrap();
        let b = Catalog::from_yaml(CATALOG).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let mut reversed = a.entries().to_vec();
        reversed.reverse();
        assert_ne!(Catalog::new(reversed).unwrap().fingerprint(), a.fingerprint());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Catalog::load("/nonexistent/catalog.yaml").unwrap_err();
        assert!(matches!(err, ExtractError::Config(_)));
    }
}

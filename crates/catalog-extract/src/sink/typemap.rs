//! Warehouse field types to PostgreSQL column types.

use crate::core::schema::{FieldMode, FieldSchema, FieldType};

/// PostgreSQL type for a schema field, without nullability.
///
/// Names are spelled the way `format_type` reports them, so an existing
/// table's columns can be compared against a schema. REPEATED fields and
/// RECORDs are stored as `jsonb`.
pub fn postgres_type(field: &FieldSchema) -> &'static str {
    if field.mode == FieldMode::Repeated {
        return "jsonb";
    }
    match field.field_type {
        FieldType::String => "text",
        FieldType::Bytes => "bytea",
        FieldType::Integer => "bigint",
        FieldType::Float => "double precision",
        FieldType::Numeric => "numeric(38,9)",
        FieldType::BigNumeric => "numeric",
        FieldType::Boolean => "boolean",
        FieldType::Timestamp => "timestamp with time zone",
        FieldType::Date => "date",
        FieldType::Time => "time without time zone",
        FieldType::DateTime => "timestamp without time zone",
        FieldType::Geography => "text",
        FieldType::Json | FieldType::Record => "jsonb",
        FieldType::Unknown(_) => "text",
    }
}

/// Column definition for `CREATE TABLE`.
pub fn column_definition(field: &FieldSchema) -> String {
    let mut def = format!("{} {}", quote_ident(&field.name), postgres_type(field));
    if field.is_required() {
        def.push_str(" NOT NULL");
    }
    def
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_types() {
        assert_eq!(postgres_type(&FieldSchema::new("a", FieldType::Integer)), "bigint");
        assert_eq!(
            postgres_type(&FieldSchema::new("a", FieldType::Timestamp)),
            "timestamp with time zone"
        );
        assert_eq!(
            postgres_type(&FieldSchema::new("a", FieldType::DateTime)),
            "timestamp without time zone"
        );
        assert_eq!(
            postgres_type(&FieldSchema::new("a", FieldType::Time)),
            "time without time zone"
        );
        assert_eq!(postgres_type(&FieldSchema::new("a", FieldType::Numeric)), "numeric(38,9)");
    }

    #[test]
    fn test_repeated_and_record_are_jsonb() {
        let repeated = FieldSchema::new("tags", FieldType::String).with_mode(FieldMode::Repeated);
        assert_eq!(postgres_type(&repeated), "jsonb");
        assert_eq!(postgres_type(&FieldSchema::new("r", FieldType::Record)), "jsonb");
    }

    #[test]
    fn test_column_definition() {
        let id = FieldSchema::new("id", FieldType::Integer).with_mode(FieldMode::Required);
        assert_eq!(column_definition(&id), "\"id\" bigint NOT NULL");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}

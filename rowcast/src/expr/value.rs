use std::collections::BTreeMap;

use rowcast_postgres::types::{ColumnDescriptor, FieldType, TableDescriptor};

/// A runtime value produced by decoding a row or evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// An opaque structured value carried through untyped.
    Json(serde_json::Value),
    /// A decoded row or the `events` binding.
    Map(BTreeMap<String, Value>),
    /// A reference to a declared event of a conditional rule.
    EventRef(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "dyn",
            Value::Map(_) => "record",
            Value::EventRef(_) => "event",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null) || matches!(self, Value::Json(serde_json::Value::Null))
    }

    /// Converts the value into plain JSON for the properties map.
    ///
    /// Bytes become lowercase hex; non-finite floats become null since JSON
    /// cannot carry them.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => serde_json::Value::Bool(value),
            Value::Int(value) => serde_json::Value::from(value),
            Value::Float(value) => serde_json::Number::from_f64(value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(value) => serde_json::Value::String(value),
            Value::Bytes(bytes) => serde_json::Value::String(encode_hex(&bytes)),
            Value::Json(value) => value,
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, value.into_json()))
                    .collect(),
            ),
            Value::EventRef(name) => serde_json::Value::String(name),
        }
    }
}

/// Decodes a raw row payload against a table descriptor (strict mode).
///
/// Every descriptor column becomes a field; columns missing from the payload
/// decode to null, and payload keys outside the descriptor (ignored columns)
/// are dropped. A value that contradicts its column's logical type is an
/// error, which surfaces as a per-row transformation failure.
pub fn decode_row(table: &TableDescriptor, row: &serde_json::Value) -> Result<Value, String> {
    let Some(object) = row.as_object() else {
        return Err(format!(
            "row payload for table `{}` is not a json object",
            table.name
        ));
    };

    let mut fields = BTreeMap::new();
    for column in &table.columns {
        let value = match object.get(&column.name) {
            None | Some(serde_json::Value::Null) => Value::Null,
            Some(raw) => decode_field(&table.name, column, raw)?,
        };
        fields.insert(column.name.clone(), value);
    }

    Ok(Value::Map(fields))
}

/// Decodes a raw row payload without a descriptor (lax mode): every field is
/// carried through as an untyped value.
pub fn decode_row_lax(row: &serde_json::Value) -> Result<Value, String> {
    let Some(object) = row.as_object() else {
        return Err("row payload is not a json object".to_string());
    };

    Ok(Value::Map(
        object
            .iter()
            .map(|(name, value)| (name.clone(), Value::Json(value.clone())))
            .collect(),
    ))
}

fn decode_field(
    table: &str,
    column: &ColumnDescriptor,
    raw: &serde_json::Value,
) -> Result<Value, String> {
    let mismatch = || {
        format!(
            "column `{}.{}` holds {} where {:?} was expected",
            table,
            column.name,
            raw,
            column.field_type
        )
    };

    match column.field_type {
        FieldType::I64 => raw.as_i64().map(Value::Int).ok_or_else(mismatch),
        FieldType::F64 => raw.as_f64().map(Value::Float).ok_or_else(mismatch),
        FieldType::Bool => raw.as_bool().map(Value::Bool).ok_or_else(mismatch),
        FieldType::String => raw
            .as_str()
            .map(|s| Value::Str(s.to_string()))
            .ok_or_else(mismatch),
        FieldType::Bytes => raw
            .as_str()
            .and_then(decode_hex_bytea)
            .map(Value::Bytes)
            .ok_or_else(mismatch),
        FieldType::Dynamic => Ok(Value::Json(raw.clone())),
    }
}

/// Decodes Postgres' `\x`-prefixed hex form of bytea.
fn decode_hex_bytea(raw: &str) -> Option<Vec<u8>> {
    let hex = raw.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TableDescriptor {
        TableDescriptor {
            name: "users".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    field_type: FieldType::I64,
                },
                ColumnDescriptor {
                    name: "email".to_string(),
                    field_type: FieldType::String,
                },
                ColumnDescriptor {
                    name: "avatar".to_string(),
                    field_type: FieldType::Bytes,
                },
                ColumnDescriptor {
                    name: "metadata".to_string(),
                    field_type: FieldType::Dynamic,
                },
            ],
        }
    }

    #[test]
    fn strict_decode_types_every_column() {
        let row = json!({
            "id": 7,
            "email": "a@b",
            "avatar": "\\x0a0b",
            "metadata": {"plan": "pro"},
            "ignored_column": "dropped",
        });

        let Value::Map(fields) = decode_row(&table(), &row).unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(fields["id"], Value::Int(7));
        assert_eq!(fields["email"], Value::Str("a@b".to_string()));
        assert_eq!(fields["avatar"], Value::Bytes(vec![0x0a, 0x0b]));
        assert_eq!(fields["metadata"], Value::Json(json!({"plan": "pro"})));
        assert!(!fields.contains_key("ignored_column"));
    }

    #[test]
    fn missing_and_null_columns_decode_to_null() {
        let row = json!({"id": 1, "email": null});
        let Value::Map(fields) = decode_row(&table(), &row).unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(fields["email"], Value::Null);
        assert_eq!(fields["avatar"], Value::Null);
    }

    #[test]
    fn type_mismatches_are_errors() {
        let row = json!({"id": "seven"});
        let err = decode_row(&table(), &row).unwrap_err();
        assert!(err.contains("users.id"));
    }

    #[test]
    fn into_json_canonical_forms() {
        assert_eq!(Value::Int(42).into_json(), json!(42));
        assert_eq!(Value::Float(0.25).into_json(), json!(0.25));
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).into_json(), json!("dead"));
        assert_eq!(Value::Float(f64::NAN).into_json(), serde_json::Value::Null);
        assert_eq!(
            Value::EventRef("upgraded".to_string()).into_json(),
            json!("upgraded")
        );
    }
}

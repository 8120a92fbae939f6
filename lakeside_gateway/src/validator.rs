//! Record-shape validation against a [`SchemaDocument`] (spec §9): dispatch
//! on `(declared_type, actual JSON kind)` rather than modeling records as a
//! richer tagged union, since the wire shape is already JSON.

use lakeside_types::Record;
use thiserror::Error;

use crate::schema::{PrimitiveType, Repetition, SchemaDocument};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field {field} is required but missing")]
    MissingRequiredField { field: String },

    #[error("field {field} declared {declared:?} but value is {actual}")]
    TypeMismatch {
        field: String,
        declared: PrimitiveType,
        actual: &'static str,
    },

    #[error("field {field} is not declared in the schema")]
    UndeclaredField { field: String },
}

/// Validates every declared field against the record, and rejects any
/// field present in the record but absent from the schema.
pub fn validate_record(record: &Record, schema: &SchemaDocument) -> Result<(), ValidationError> {
    for field in &schema.fields {
        match record.get(&field.name) {
            Some(value) => {
                if !matches_kind(field.primitive_type, value) {
                    return Err(ValidationError::TypeMismatch {
                        field: field.name.clone(),
                        declared: field.primitive_type,
                        actual: json_kind_name(value),
                    });
                }
            }
            None if field.repetition == Some(Repetition::Required) || field.repetition.is_none() => {
                return Err(ValidationError::MissingRequiredField {
                    field: field.name.clone(),
                });
            }
            None => {}
        }
    }

    for key in record.keys() {
        if schema.field(key).is_none() {
            return Err(ValidationError::UndeclaredField { field: key.clone() });
        }
    }

    Ok(())
}

fn matches_kind(declared: PrimitiveType, value: &serde_json::Value) -> bool {
    match declared {
        PrimitiveType::Boolean => value.is_boolean(),
        PrimitiveType::Int64 => value.is_i64() || value.is_u64(),
        PrimitiveType::Double => value.is_f64() || value.is_i64() || value.is_u64(),
        PrimitiveType::String => value.is_string(),
    }
}

fn json_kind_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

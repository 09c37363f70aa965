//! Argument validation against declared tool input schemas.
//!
//! Planner output is untrusted external input: every selected invocation
//! is checked here before it reaches a server.  The checks cover required
//! fields, primitive types, and enum membership; unknown extra fields are
//! tolerated.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingRequired(String),
    #[error("field `{field}`: expected {expected}")]
    WrongType { field: String, expected: String },
    #[error("field `{field}`: value not among allowed options")]
    NotInEnum { field: String },
}

pub fn validate_arguments(arguments: &Value, schema: &Value) -> Result<(), SchemaViolation> {
    let Some(args) = arguments.as_object() else {
        return Err(SchemaViolation::NotAnObject);
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(field) || args[field].is_null() {
                return Err(SchemaViolation::MissingRequired(field.to_string()));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (field, value) in args {
        let Some(spec) = properties.get(field) else {
            continue; // unknown fields are tolerated
        };
        if value.is_null() {
            continue;
        }
        if let Some(expected) = spec.get("type").and_then(Value::as_str) {
            if !type_matches(value, expected) {
                return Err(SchemaViolation::WrongType {
                    field: field.clone(),
                    expected: expected.to_string(),
                });
            }
        }
        if let Some(options) = spec.get("enum").and_then(Value::as_array) {
            if !options.contains(value) {
                return Err(SchemaViolation::NotInEnum { field: field.clone() });
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "max_results": {"type": "integer"},
                "category": {"type": "string", "enum": ["Info", "Problem", "Measurement"]},
                "include_replies": {"type": "boolean"}
            },
            "required": ["query"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let args = json!({"query": "beam dump", "max_results": 5, "category": "Problem"});
        assert!(validate_arguments(&args, &schema()).is_ok());
    }

    #[test]
    fn missing_required_field_rejected() {
        let args = json!({"max_results": 5});
        assert_eq!(
            validate_arguments(&args, &schema()),
            Err(SchemaViolation::MissingRequired("query".to_string()))
        );
    }

    #[test]
    fn explicit_null_counts_as_missing() {
        let args = json!({"query": null});
        assert_eq!(
            validate_arguments(&args, &schema()),
            Err(SchemaViolation::MissingRequired("query".to_string()))
        );
    }

    #[test]
    fn wrong_type_rejected() {
        let args = json!({"query": "x", "max_results": "five"});
        assert!(matches!(
            validate_arguments(&args, &schema()),
            Err(SchemaViolation::WrongType { .. })
        ));
    }

    #[test]
    fn illegal_enum_value_rejected() {
        let args = json!({"query": "x", "category": "Gossip"});
        assert!(matches!(
            validate_arguments(&args, &schema()),
            Err(SchemaViolation::NotInEnum { .. })
        ));
    }

    #[test]
    fn unknown_fields_tolerated() {
        let args = json!({"query": "x", "reasoning": "the model explains itself"});
        assert!(validate_arguments(&args, &schema()).is_ok());
    }

    #[test]
    fn non_object_arguments_rejected() {
        assert_eq!(
            validate_arguments(&json!(["not", "an", "object"]), &schema()),
            Err(SchemaViolation::NotAnObject)
        );
    }

    #[test]
    fn integer_accepted_where_number_expected() {
        let schema = json!({
            "properties": {"temperature": {"type": "number"}},
            "required": []
        });
        assert!(validate_arguments(&json!({"temperature": 2}), &schema).is_ok());
        assert!(validate_arguments(&json!({"temperature": 0.7}), &schema).is_ok());
    }
}

//! A local subset of JSON Schema validation: `type`, `properties`,
//! `required`, `additionalProperties`, `items`, `enum`, `minimum`,
//! `maximum`, `anyOf` (spec.md §4.2, translated from
//! `original_source/mi/core/schema_validate.py`).

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub fn validate(schema: &Value, instance: &Value) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_at(schema, instance, "$", &mut errors);
    errors
}

fn validate_at(schema: &Value, instance: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    if let Some(any_of) = schema.get("anyOf").and_then(|v| v.as_array()) {
        let matches_any = any_of.iter().any(|sub| validate(sub, instance).is_empty());
        if !matches_any {
            errors.push(ValidationError {
                path: path.to_string(),
                message: "does not match any schema in anyOf".to_string(),
            });
        }
        return;
    }

    if let Some(type_name) = schema.get("type").and_then(|v| v.as_str()) {
        if !type_matches(type_name, instance) {
            errors.push(ValidationError {
                path: path.to_string(),
                message: format!("expected type {type_name}, got {}", type_name_of(instance)),
            });
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|v| v.as_array()) {
        if !allowed.iter().any(|v| v == instance) {
            errors.push(ValidationError {
                path: path.to_string(),
                message: format!("value not in enum {allowed:?}"),
            });
        }
    }

    if let Some(min) = schema.get("minimum").and_then(|v| v.as_f64()) {
        if let Some(n) = instance.as_f64() {
            if n < min {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: format!("{n} is less than minimum {min}"),
                });
            }
        }
    }

    if let Some(max) = schema.get("maximum").and_then(|v| v.as_f64()) {
        if let Some(n) = instance.as_f64() {
            if n > max {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: format!("{n} is greater than maximum {max}"),
                });
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        if let Some(obj) = instance.as_object() {
            for (key, sub_schema) in properties {
                let child_path = format!("{path}.{key}");
                if let Some(value) = obj.get(key) {
                    validate_at(sub_schema, value, &child_path, errors);
                }
            }
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in obj.keys() {
                    if !properties.contains_key(key) {
                        errors.push(ValidationError {
                            path: format!("{path}.{key}"),
                            message: "additional property not allowed".to_string(),
                        });
                    }
                }
            }
        }
    }

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        if let Some(obj) = instance.as_object() {
            for key in required {
                if let Some(key) = key.as_str() {
                    if !obj.contains_key(key) {
                        errors.push(ValidationError {
                            path: format!("{path}.{key}"),
                            message: "missing required property".to_string(),
                        });
                    }
                }
            }
        }
    }

    if let Some(items_schema) = schema.get("items") {
        if let Some(arr) = instance.as_array() {
            for (i, item) in arr.iter().enumerate() {
                validate_at(items_schema, item, &format!("{path}[{i}]"), errors);
            }
        }
    }
}

fn type_matches(type_name: &str, instance: &Value) -> bool {
    match type_name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => instance.is_i64() || instance.is_u64(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => true,
    }
}

fn type_name_of(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extracts a JSON object from model output: direct parse, falling back to
/// the first `{` .. last `}` slice (spec.md §4.2).
pub fn extract_json_object(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_reports_missing_required_property() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        });
        let errors = validate(&schema, &json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].path.ends_with(".name"));
    }

    #[test]
    fn validate_rejects_additional_properties_when_disallowed() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "additionalProperties": false
        });
        let errors = validate(&schema, &json!({"name": "x", "extra": 1}));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn validate_checks_enum_and_bounds() {
        let schema = json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "enum": ["done", "not_done", "blocked"]},
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
            }
        });
        let ok = validate(&schema, &json!({"status": "done", "confidence": 0.8}));
        assert!(ok.is_empty());

        let bad = validate(&schema, &json!({"status": "maybe", "confidence": 1.5}));
        assert_eq!(bad.len(), 2);
    }

    #[test]
    fn validate_any_of_passes_if_one_branch_matches() {
        let schema = json!({"anyOf": [{"type": "string"}, {"type": "null"}]});
        assert!(validate(&schema, &json!(null)).is_empty());
        assert!(validate(&schema, &json!("x")).is_empty());
        assert!(!validate(&schema, &json!(5)).is_empty());
    }

    #[test]
    fn extract_json_object_handles_surrounding_commentary() {
        let text = "Here is the answer:\n{\"a\": 1}\nThanks.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn validate_items_schema_applies_to_each_array_element() {
        let schema = json!({"type": "array", "items": {"type": "string"}});
        let errors = validate(&schema, &json!(["a", 2, "c"]));
        assert_eq!(errors.len(), 1);
    }
}

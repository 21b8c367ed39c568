//! Step params checked against a template's `paramsSchema`.

use serde_json::Value;

use crate::registry::{ParamsSchema, PropertySchema, PropertyType};

fn type_matches(kind: PropertyType, value: &Value) -> bool {
    match kind {
        PropertyType::String => value.is_string(),
        PropertyType::Number => value.is_number(),
        PropertyType::Integer => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        PropertyType::Boolean => value.is_boolean(),
        PropertyType::Array => value.is_array(),
        PropertyType::Object => value.is_object(),
    }
}

fn check_property(name: &str, schema: &PropertySchema, value: &Value, errors: &mut Vec<String>) {
    if let Some(kind) = schema.kind {
        if !type_matches(kind, value) {
            errors.push(format!("{name}: expected {kind:?}").to_lowercase());
            return;
        }
    }

    let length = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    };
    if let Some(len) = length {
        if let Some(min) = schema.min_length {
            if len < min {
                errors.push(format!("{name}: length {len} is below minimum {min}"));
            }
        }
        if let Some(max) = schema.max_length {
            if len > max {
                errors.push(format!("{name}: length {len} is above maximum {max}"));
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.minimum {
            if n < min {
                errors.push(format!("{name}: {n} is below minimum {min}"));
            }
        }
        if let Some(max) = schema.maximum {
            if n > max {
                errors.push(format!("{name}: {n} is above maximum {max}"));
            }
        }
    }

    if let Some(allowed) = &schema.allowed {
        if !allowed.contains(value) {
            errors.push(format!("{name}: {value} is not one of the allowed values"));
        }
    }
}

/// Every problem with `params`, or `Ok` when there are none. Params not
/// described by the schema are accepted as-is.
pub fn validate_params(schema: Option<&ParamsSchema>, params: &Value) -> Result<(), Vec<String>> {
    let Some(schema) = schema else {
        return Ok(());
    };
    if schema.required.is_empty() && schema.properties.is_empty() {
        return Ok(());
    }
    let Some(object) = params.as_object() else {
        return Err(vec!["params must be an object".to_string()]);
    };

    let mut errors = Vec::new();
    for field in &schema.required {
        if object.get(field).map_or(true, Value::is_null) {
            errors.push(format!("{field}: required"));
        }
    }
    for (name, property) in &schema.properties {
        match object.get(name) {
            Some(Value::Null) | None => {}
            Some(value) => check_property(name, property, value, &mut errors),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamsSchema {
        serde_json::from_value(json!({
            "required": ["title", "rounds"],
            "properties": {
                "title": {"type": "string", "minLength": 3, "maxLength": 20},
                "rounds": {"type": "integer", "minimum": 1, "maximum": 5},
                "mode": {"type": "string", "enum": ["easy", "hard"]},
                "shuffle": {"type": "boolean"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn valid_params_pass() {
        let params = json!({"title": "Fractions", "rounds": 3, "mode": "easy", "extra": 1});
        assert!(validate_params(Some(&schema()), &params).is_ok());
        assert!(validate_params(None, &json!(null)).is_ok());
    }

    #[test]
    fn all_problems_are_collected() {
        let params = json!({"title": "Hi", "rounds": 9, "mode": "nightmare", "shuffle": "yes"});
        let errors = validate_params(Some(&schema()), &params).unwrap_err();
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().any(|e| e.starts_with("title: length 2")));
        assert!(errors.iter().any(|e| e.starts_with("rounds: 9")));
        assert!(errors.iter().any(|e| e.starts_with("mode:")));
        assert!(errors.iter().any(|e| e == "shuffle: expected boolean"));
    }

    #[test]
    fn missing_required_and_wrong_shape() {
        let errors = validate_params(Some(&schema()), &json!({"title": "Long enough"})).unwrap_err();
        assert_eq!(errors, vec!["rounds: required".to_string()]);

        let errors = validate_params(Some(&schema()), &json!([1, 2])).unwrap_err();
        assert_eq!(errors, vec!["params must be an object".to_string()]);
    }

    #[test]
    fn integers_reject_fractions() {
        let errors = validate_params(Some(&schema()), &json!({"title": "abc", "rounds": 2.5}))
            .unwrap_err();
        assert_eq!(errors, vec!["rounds: expected integer".to_string()]);
        assert!(validate_params(Some(&schema()), &json!({"title": "abc", "rounds": 2.0})).is_ok());
    }
}

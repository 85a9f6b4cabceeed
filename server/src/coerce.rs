//! Schema-directed coercion of a raw JSON argument object into the typed
//! map a handler receives.
//!
//! Coercion never mutates its input. Unknown keys are ignored so newer
//! clients can send fields this server does not know about yet.

use crate::metadata::ParameterInfo;
use serde_json::Value;
use thiserror::Error;
use toolbus_protocol::JsonObject;
use toolbus_protocol::JsonSchema;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    #[error("missing required parameter \"{name}\"")]
    MissingRequiredParameter { name: String },

    #[error("parameter \"{name}\" expected {expected}, got {actual}")]
    InvalidArgumentType {
        name: String,
        expected: String,
        /// The offending value rendered as JSON.
        actual: String,
    },
}

fn mismatch(name: &str, expected: impl Into<String>, value: &Value) -> CoercionError {
    CoercionError::InvalidArgumentType {
        name: name.to_string(),
        expected: expected.into(),
        actual: value.to_string(),
    }
}

/// Walk `parameters` in declaration order, producing a new argument map with
/// defaults substituted and every present value checked against its schema.
///
/// An optional parameter with no default that is absent from the input is
/// omitted from the result rather than set to null.
pub fn coerce_arguments(
    parameters: &[ParameterInfo],
    input: &JsonObject,
) -> Result<JsonObject, CoercionError> {
    let mut out = JsonObject::new();
    for param in parameters {
        match input.get(&param.name) {
            Some(value) => {
                let coerced = coerce_value(&param.name, &param.schema, value)?;
                out.insert(param.name.clone(), coerced);
            }
            None => match &param.default_value {
                Some(default) => {
                    out.insert(param.name.clone(), default.clone());
                }
                None if param.required => {
                    return Err(CoercionError::MissingRequiredParameter {
                        name: param.name.clone(),
                    });
                }
                None => {}
            },
        }
    }
    Ok(out)
}

fn coerce_value(path: &str, schema: &JsonSchema, value: &Value) -> Result<Value, CoercionError> {
    match schema {
        JsonSchema::String { enum_values, .. } => {
            let Value::String(s) = value else {
                return Err(mismatch(path, "string", value));
            };
            if let Some(allowed) = enum_values
                && !allowed.iter().any(|v| v == s)
            {
                return Err(mismatch(path, format!("one of {allowed:?}"), value));
            }
            Ok(value.clone())
        }
        JsonSchema::Number {
            minimum,
            maximum,
            integer,
            ..
        } => {
            let Some(n) = value.as_f64() else {
                return Err(mismatch(path, schema.type_label(), value));
            };
            if *integer && n.fract() != 0.0 {
                return Err(mismatch(path, "integer", value));
            }
            if let Some(min) = minimum
                && n < *min
            {
                return Err(mismatch(path, format!("number >= {min}"), value));
            }
            if let Some(max) = maximum
                && n > *max
            {
                return Err(mismatch(path, format!("number <= {max}"), value));
            }
            if *integer {
                // Normalize integral floats like 5.0 to a JSON integer.
                Ok(Value::from(n as i64))
            } else {
                Ok(value.clone())
            }
        }
        JsonSchema::Boolean { .. } => {
            if value.is_boolean() {
                Ok(value.clone())
            } else {
                Err(mismatch(path, "boolean", value))
            }
        }
        JsonSchema::Array { items, .. } => {
            let Value::Array(elements) = value else {
                return Err(mismatch(path, "array", value));
            };
            let coerced = elements
                .iter()
                .enumerate()
                .map(|(i, el)| coerce_value(&format!("{path}[{i}]"), items, el))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(coerced))
        }
        JsonSchema::Object {
            properties,
            required,
            ..
        } => {
            let Value::Object(fields) = value else {
                return Err(mismatch(path, "object", value));
            };
            let mut out = JsonObject::new();
            for (name, prop_schema) in properties {
                let child_path = format!("{path}.{name}");
                match fields.get(name) {
                    Some(field) => {
                        out.insert(name.clone(), coerce_value(&child_path, prop_schema, field)?);
                    }
                    None if required.contains(name) => {
                        return Err(CoercionError::MissingRequiredParameter { name: child_path });
                    }
                    None => {}
                }
            }
            Ok(Value::Object(out))
        }
        JsonSchema::Enum { values, .. } => {
            let Value::String(s) = value else {
                return Err(mismatch(path, format!("one of {values:?}"), value));
            };
            if values.iter().any(|v| v == s) {
                Ok(value.clone())
            } else {
                Err(mismatch(path, format!("one of {values:?}"), value))
            }
        }
    }
}

/// Coerce a value captured from a URI template variable. Captures are always
/// strings on the wire, so numbers and booleans are parsed leniently before
/// the normal schema check applies.
pub fn coerce_uri_value(
    name: &str,
    schema: &JsonSchema,
    raw: &str,
) -> Result<Value, CoercionError> {
    let candidate = match schema {
        JsonSchema::Number { .. } => raw
            .parse::<f64>()
            .ok()
            .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number)),
        JsonSchema::Boolean { .. } => raw.parse::<bool>().ok().map(Value::Bool),
        _ => Some(Value::String(raw.to_string())),
    };
    let candidate = candidate.unwrap_or_else(|| Value::String(raw.to_string()));
    coerce_value(name, schema, &candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ParameterInfo;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn present_values_are_preserved() {
        let params = vec![
            ParameterInfo::required("a", JsonSchema::number()),
            ParameterInfo::required("b", JsonSchema::number()),
        ];
        let coerced = coerce_arguments(&params, &obj(json!({"a": 5, "b": 3, "extra": true})))
            .expect("coercion should succeed");
        assert_eq!(Value::Object(coerced), json!({"a": 5, "b": 3}));
    }

    #[test]
    fn defaults_fill_absent_keys() {
        let params = vec![ParameterInfo::optional(
            "verbose",
            JsonSchema::boolean(),
            Some(json!(false)),
        )];
        let coerced = coerce_arguments(&params, &JsonObject::new()).expect("should succeed");
        assert_eq!(Value::Object(coerced), json!({"verbose": false}));
    }

    #[test]
    fn absent_optional_without_default_is_omitted() {
        let params = vec![ParameterInfo::optional("tag", JsonSchema::string(), None)];
        let coerced = coerce_arguments(&params, &JsonObject::new()).expect("should succeed");
        assert!(coerced.is_empty());
    }

    #[test]
    fn missing_required_parameter_is_named() {
        let params = vec![
            ParameterInfo::required("a", JsonSchema::number()),
            ParameterInfo::required("b", JsonSchema::number()),
        ];
        let err = coerce_arguments(&params, &obj(json!({"a": 5}))).expect_err("must fail");
        assert_eq!(
            err,
            CoercionError::MissingRequiredParameter { name: "b".into() }
        );
    }

    #[test]
    fn type_mismatch_renders_the_offending_value() {
        let params = vec![ParameterInfo::required("a", JsonSchema::number())];
        let err = coerce_arguments(&params, &obj(json!({"a": "five"}))).expect_err("must fail");
        assert_eq!(
            err,
            CoercionError::InvalidArgumentType {
                name: "a".into(),
                expected: "number".into(),
                actual: "\"five\"".into(),
            }
        );
    }

    #[test]
    fn integer_schema_rejects_fractions_and_normalizes_floats() {
        let params = vec![ParameterInfo::required("n", JsonSchema::integer())];
        assert!(coerce_arguments(&params, &obj(json!({"n": 2.5}))).is_err());
        let coerced = coerce_arguments(&params, &obj(json!({"n": 5.0}))).expect("should succeed");
        assert_eq!(coerced["n"], json!(5));
    }

    #[test]
    fn bounds_are_enforced() {
        let schema = JsonSchema::Number {
            description: None,
            minimum: Some(0.0),
            maximum: Some(10.0),
            integer: false,
        };
        let params = vec![ParameterInfo::required("n", schema)];
        assert!(coerce_arguments(&params, &obj(json!({"n": -1}))).is_err());
        assert!(coerce_arguments(&params, &obj(json!({"n": 11}))).is_err());
        assert!(coerce_arguments(&params, &obj(json!({"n": 10}))).is_ok());
    }

    #[test]
    fn string_enums_are_case_sensitive() {
        let schema = JsonSchema::String {
            description: None,
            format: None,
            enum_values: Some(vec!["On".into(), "Off".into()]),
            min_length: None,
            max_length: None,
        };
        let params = vec![ParameterInfo::required("switch", schema)];
        assert!(coerce_arguments(&params, &obj(json!({"switch": "On"}))).is_ok());
        assert!(coerce_arguments(&params, &obj(json!({"switch": "on"}))).is_err());
    }

    #[test]
    fn nested_objects_coerce_recursively() {
        let inner = JsonSchema::object(
            IndexMap::from([("host".to_string(), JsonSchema::string())]),
            vec!["host".into()],
        );
        let params = vec![ParameterInfo::required("target", inner)];

        let ok = coerce_arguments(&params, &obj(json!({"target": {"host": "example.org"}})))
            .expect("should succeed");
        assert_eq!(Value::Object(ok), json!({"target": {"host": "example.org"}}));

        let err = coerce_arguments(&params, &obj(json!({"target": {}}))).expect_err("must fail");
        assert_eq!(
            err,
            CoercionError::MissingRequiredParameter {
                name: "target.host".into()
            }
        );
    }

    #[test]
    fn arrays_coerce_each_element() {
        let params = vec![ParameterInfo::required(
            "xs",
            JsonSchema::array(JsonSchema::integer()),
        )];
        let err = coerce_arguments(&params, &obj(json!({"xs": [1, "two"]}))).expect_err("fail");
        let CoercionError::InvalidArgumentType { name, .. } = err else {
            panic!("wrong error kind");
        };
        assert_eq!(name, "xs[1]");
    }

    #[test]
    fn uri_captures_parse_into_schema_types() {
        assert_eq!(
            coerce_uri_value("id", &JsonSchema::integer(), "42").expect("int"),
            json!(42)
        );
        assert_eq!(
            coerce_uri_value("flag", &JsonSchema::boolean(), "true").expect("bool"),
            json!(true)
        );
        assert!(coerce_uri_value("id", &JsonSchema::integer(), "forty-two").is_err());
    }
}

//! The JSON Schema subset used to describe tool parameters and elicitation
//! shapes.
//!
//! MCP tool schemas only allow `type`, `properties`, `required`, `enum`, and
//! a few per-type keywords, so the model is a closed enum rather than a full
//! draft-07 document. Values round-trip: `decode(encode(s)) == s`.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as _;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
pub enum JsonSchema {
    String {
        description: Option<String>,
        format: Option<String>,
        enum_values: Option<Vec<String>>,
        min_length: Option<u64>,
        max_length: Option<u64>,
    },
    Number {
        description: Option<String>,
        minimum: Option<f64>,
        maximum: Option<f64>,
        /// Encoded as `"type": "integer"` when set.
        integer: bool,
    },
    Boolean {
        description: Option<String>,
        default: Option<bool>,
    },
    Array {
        items: Box<JsonSchema>,
        description: Option<String>,
    },
    Object {
        properties: IndexMap<String, JsonSchema>,
        required: Vec<String>,
        description: Option<String>,
    },
    /// A bare `enum` schema without `"type": "string"`. String-typed enums
    /// decode as [`JsonSchema::String`] with `enum_values`.
    Enum {
        values: Vec<String>,
        r#type: Option<String>,
        description: Option<String>,
    },
}

impl JsonSchema {
    pub fn string() -> Self {
        JsonSchema::String {
            description: None,
            format: None,
            enum_values: None,
            min_length: None,
            max_length: None,
        }
    }

    pub fn number() -> Self {
        JsonSchema::Number {
            description: None,
            minimum: None,
            maximum: None,
            integer: false,
        }
    }

    pub fn integer() -> Self {
        JsonSchema::Number {
            description: None,
            minimum: None,
            maximum: None,
            integer: true,
        }
    }

    pub fn boolean() -> Self {
        JsonSchema::Boolean {
            description: None,
            default: None,
        }
    }

    pub fn array(items: JsonSchema) -> Self {
        JsonSchema::Array {
            items: Box::new(items),
            description: None,
        }
    }

    pub fn object(properties: IndexMap<String, JsonSchema>, required: Vec<String>) -> Self {
        JsonSchema::Object {
            properties,
            required,
            description: None,
        }
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        match &mut self {
            JsonSchema::String { description, .. }
            | JsonSchema::Number { description, .. }
            | JsonSchema::Boolean { description, .. }
            | JsonSchema::Array { description, .. }
            | JsonSchema::Object { description, .. }
            | JsonSchema::Enum { description, .. } => *description = Some(text),
        }
        self
    }

    /// Human-readable label used in coercion error messages.
    pub fn type_label(&self) -> &'static str {
        match self {
            JsonSchema::String { .. } => "string",
            JsonSchema::Number { integer: true, .. } => "integer",
            JsonSchema::Number { .. } => "number",
            JsonSchema::Boolean { .. } => "boolean",
            JsonSchema::Array { .. } => "array",
            JsonSchema::Object { .. } => "object",
            JsonSchema::Enum { .. } => "enum",
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            JsonSchema::String {
                description,
                format,
                enum_values,
                min_length,
                max_length,
            } => {
                map.insert("type".into(), json!("string"));
                insert_opt(&mut map, "description", description.as_deref().map(Value::from));
                insert_opt(&mut map, "format", format.as_deref().map(Value::from));
                insert_opt(&mut map, "enum", enum_values.as_ref().map(|v| json!(v)));
                insert_opt(&mut map, "minLength", min_length.map(Value::from));
                insert_opt(&mut map, "maxLength", max_length.map(Value::from));
            }
            JsonSchema::Number {
                description,
                minimum,
                maximum,
                integer,
            } => {
                map.insert("type".into(), json!(if *integer { "integer" } else { "number" }));
                insert_opt(&mut map, "description", description.as_deref().map(Value::from));
                insert_opt(&mut map, "minimum", minimum.map(Value::from));
                insert_opt(&mut map, "maximum", maximum.map(Value::from));
            }
            JsonSchema::Boolean { description, default } => {
                map.insert("type".into(), json!("boolean"));
                insert_opt(&mut map, "description", description.as_deref().map(Value::from));
                insert_opt(&mut map, "default", default.map(Value::from));
            }
            JsonSchema::Array { items, description } => {
                map.insert("type".into(), json!("array"));
                map.insert("items".into(), items.to_value());
                insert_opt(&mut map, "description", description.as_deref().map(Value::from));
            }
            JsonSchema::Object {
                properties,
                required,
                description,
            } => {
                map.insert("type".into(), json!("object"));
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, schema)| (name.clone(), schema.to_value()))
                    .collect();
                map.insert("properties".into(), Value::Object(props));
                if !required.is_empty() {
                    map.insert("required".into(), json!(required));
                }
                insert_opt(&mut map, "description", description.as_deref().map(Value::from));
            }
            JsonSchema::Enum {
                values,
                r#type,
                description,
            } => {
                insert_opt(&mut map, "type", r#type.as_deref().map(Value::from));
                map.insert("enum".into(), json!(values));
                insert_opt(&mut map, "description", description.as_deref().map(Value::from));
            }
        }
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, SchemaDecodeError> {
        let Value::Object(map) = value else {
            return Err(SchemaDecodeError::NotAnObject(value.clone()));
        };
        let description = str_field(map, "description");
        let type_name = map.get("type").and_then(Value::as_str);

        match type_name {
            Some("string") => Ok(JsonSchema::String {
                description,
                format: str_field(map, "format"),
                enum_values: string_list(map, "enum"),
                min_length: map.get("minLength").and_then(Value::as_u64),
                max_length: map.get("maxLength").and_then(Value::as_u64),
            }),
            Some(t @ ("number" | "integer")) => Ok(JsonSchema::Number {
                description,
                minimum: map.get("minimum").and_then(Value::as_f64),
                maximum: map.get("maximum").and_then(Value::as_f64),
                integer: t == "integer",
            }),
            Some("boolean") => Ok(JsonSchema::Boolean {
                description,
                default: map.get("default").and_then(Value::as_bool),
            }),
            Some("array") => {
                let items = map
                    .get("items")
                    .ok_or(SchemaDecodeError::MissingItems)
                    .and_then(JsonSchema::from_value)?;
                Ok(JsonSchema::Array {
                    items: Box::new(items),
                    description,
                })
            }
            Some("object") => {
                let mut properties = IndexMap::new();
                if let Some(Value::Object(props)) = map.get("properties") {
                    for (name, prop) in props {
                        properties.insert(name.clone(), JsonSchema::from_value(prop)?);
                    }
                }
                let required = string_list(map, "required").unwrap_or_default();
                Ok(JsonSchema::Object {
                    properties,
                    required,
                    description,
                })
            }
            other => {
                let values = string_list(map, "enum")
                    .ok_or_else(|| SchemaDecodeError::UnknownType(other.map(str::to_string)))?;
                Ok(JsonSchema::Enum {
                    values,
                    r#type: other.map(str::to_string),
                    description,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaDecodeError {
    #[error("schema must be a JSON object, got {0}")]
    NotAnObject(Value),
    #[error("array schema is missing `items`")]
    MissingItems,
    #[error("unrecognized schema type {0:?}")]
    UnknownType(Option<String>),
}

impl Serialize for JsonSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonSchema::from_value(&value).map_err(D::Error::custom)
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.into(), value);
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_list(map: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    map.get(key).and_then(Value::as_array).map(|values| {
        values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(schema: JsonSchema) {
        let encoded = schema.to_value();
        let decoded = JsonSchema::from_value(&encoded).expect("decode should succeed");
        assert_eq!(decoded, schema);
    }

    #[test]
    fn every_variant_round_trips() {
        round_trip(JsonSchema::String {
            description: Some("a name".into()),
            format: Some("email".into()),
            enum_values: None,
            min_length: Some(1),
            max_length: Some(64),
        });
        round_trip(JsonSchema::String {
            description: None,
            format: None,
            enum_values: Some(vec!["on".into(), "off".into()]),
            min_length: None,
            max_length: None,
        });
        round_trip(JsonSchema::Number {
            description: Some("count".into()),
            minimum: Some(0.0),
            maximum: Some(10.0),
            integer: true,
        });
        round_trip(JsonSchema::number());
        round_trip(JsonSchema::Boolean {
            description: None,
            default: Some(true),
        });
        round_trip(JsonSchema::array(JsonSchema::string()));
        round_trip(JsonSchema::object(
            IndexMap::from([
                ("a".to_string(), JsonSchema::number()),
                ("b".to_string(), JsonSchema::boolean()),
            ]),
            vec!["a".into()],
        ));
        round_trip(JsonSchema::Enum {
            values: vec!["red".into(), "green".into()],
            r#type: None,
            description: Some("color".into()),
        });
    }

    #[test]
    fn integer_schemas_encode_their_own_type() {
        assert_eq!(
            JsonSchema::integer().to_value(),
            serde_json::json!({"type": "integer"})
        );
    }

    #[test]
    fn object_property_order_is_preserved() {
        let schema = JsonSchema::object(
            IndexMap::from([
                ("zeta".to_string(), JsonSchema::string()),
                ("alpha".to_string(), JsonSchema::string()),
            ]),
            vec![],
        );
        let encoded = serde_json::to_string(&schema).expect("serialize");
        let zeta = encoded.find("zeta").expect("zeta present");
        let alpha = encoded.find("alpha").expect("alpha present");
        assert!(zeta < alpha, "declaration order must survive encoding");
    }
}

//! Declarative metadata hosts register for their tools, resources, and
//! prompts. Hosts construct these with the builder-style constructors at
//! startup; no reflection or code generation is involved.

use crate::uri_template::template_variables;
use serde_json::Value;
use thiserror::Error;
use toolbus_protocol::JsonSchema;
use toolbus_protocol::Prompt;
use toolbus_protocol::PromptArgument;
use toolbus_protocol::Resource;
use toolbus_protocol::ResourceTemplate;
use toolbus_protocol::Tool;
use toolbus_protocol::ToolAnnotations;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("template \"{template}\" binds variable \"{variable}\" with no matching parameter")]
    UnboundTemplateVariable { template: String, variable: String },

    #[error("parameter \"{0}\" is required and cannot carry a default value")]
    RequiredWithDefault(String),
}

/// One declared parameter of a tool, resource, or prompt.
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub name: String,
    pub schema: JsonSchema,
    pub description: Option<String>,
    pub default_value: Option<Value>,
    pub required: bool,
}

impl ParameterInfo {
    pub fn required(name: impl Into<String>, schema: JsonSchema) -> Self {
        ParameterInfo {
            name: name.into(),
            schema,
            description: None,
            default_value: None,
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        schema: JsonSchema,
        default_value: Option<Value>,
    ) -> Self {
        ParameterInfo {
            name: name.into(),
            schema,
            description: None,
            default_value,
            required: false,
        }
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    fn schema_with_description(&self) -> JsonSchema {
        match &self.description {
            Some(text) => self.schema.clone().with_description(text.clone()),
            None => self.schema.clone(),
        }
    }
}

/// Build the canonical `{type: object, properties, required}` input schema
/// for a parameter list.
pub fn input_schema(parameters: &[ParameterInfo]) -> JsonSchema {
    let properties = parameters
        .iter()
        .map(|p| (p.name.clone(), p.schema_with_description()))
        .collect();
    let required = parameters
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.clone())
        .collect();
    JsonSchema::object(properties, required)
}

#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Vec<ParameterInfo>,
    pub return_schema: Option<JsonSchema>,
    pub return_description: Option<String>,
    /// Consequential tools have visible side effects; surfaced to clients as
    /// a destructive hint unless explicit annotations are given.
    pub is_consequential: bool,
    pub annotations: Option<ToolAnnotations>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        ToolMetadata {
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            return_schema: None,
            return_description: None,
            is_consequential: false,
            annotations: None,
        }
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterInfo) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_return_schema(mut self, schema: JsonSchema) -> Self {
        self.return_schema = Some(schema);
        self
    }

    pub fn consequential(mut self) -> Self {
        self.is_consequential = true;
        self
    }

    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Reject parameters that are both required and defaulted.
    pub fn validate(&self) -> Result<(), MetadataError> {
        for p in &self.parameters {
            if p.required && p.default_value.is_some() {
                return Err(MetadataError::RequiredWithDefault(p.name.clone()));
            }
        }
        Ok(())
    }

    pub fn to_tool(&self) -> Tool {
        let annotations = self.annotations.clone().or(if self.is_consequential {
            Some(ToolAnnotations {
                destructive_hint: Some(true),
                ..Default::default()
            })
        } else {
            None
        });
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: input_schema(&self.parameters),
            output_schema: self.return_schema.clone(),
            annotations,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceMetadata {
    /// RFC-6570-style templates this resource answers for. A template with
    /// no variables lists as a concrete resource.
    pub uri_templates: Vec<String>,
    pub name: String,
    pub description: Option<String>,
    pub parameters: Vec<ParameterInfo>,
    pub mime_type: Option<String>,
}

impl ResourceMetadata {
    pub fn new(name: impl Into<String>, uri_templates: Vec<String>) -> Self {
        ResourceMetadata {
            uri_templates,
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            mime_type: None,
        }
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterInfo) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Every variable in every template must name a declared parameter.
    pub fn validate(&self) -> Result<(), MetadataError> {
        for template in &self.uri_templates {
            for variable in template_variables(template) {
                if !self.parameters.iter().any(|p| p.name == variable) {
                    return Err(MetadataError::UnboundTemplateVariable {
                        template: template.clone(),
                        variable,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn concrete_resources(&self) -> Vec<Resource> {
        self.uri_templates
            .iter()
            .filter(|t| template_variables(t).is_empty())
            .map(|t| Resource {
                uri: t.clone(),
                name: self.name.clone(),
                description: self.description.clone(),
                mime_type: self.mime_type.clone(),
            })
            .collect()
    }

    pub fn templates(&self) -> Vec<ResourceTemplate> {
        self.uri_templates
            .iter()
            .filter(|t| !template_variables(t).is_empty())
            .map(|t| ResourceTemplate {
                uri_template: t.clone(),
                name: self.name.clone(),
                description: self.description.clone(),
                mime_type: self.mime_type.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PromptMetadata {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<ParameterInfo>,
}

impl PromptMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        PromptMetadata {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
        }
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn with_argument(mut self, argument: ParameterInfo) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn to_prompt(&self) -> Prompt {
        let arguments = if self.arguments.is_empty() {
            None
        } else {
            Some(
                self.arguments
                    .iter()
                    .map(|a| PromptArgument {
                        name: a.name.clone(),
                        description: a.description.clone(),
                        required: Some(a.required),
                    })
                    .collect(),
            )
        };
        Prompt {
            name: self.name.clone(),
            description: self.description.clone(),
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn input_schema_collects_required_names() {
        let meta = ToolMetadata::new("add")
            .with_parameter(ParameterInfo::required("a", JsonSchema::number()))
            .with_parameter(ParameterInfo::optional(
                "precision",
                JsonSchema::integer(),
                Some(json!(2)),
            ));
        let schema = input_schema(&meta.parameters);
        assert_eq!(
            schema.to_value(),
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "precision": {"type": "integer"},
                },
                "required": ["a"],
            })
        );
    }

    #[test]
    fn unbound_template_variable_is_rejected() {
        let meta = ResourceMetadata::new("user", vec!["app://users/{id}".into()]);
        let err = meta.validate().expect_err("must fail");
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn consequential_tools_hint_destructive() {
        let tool = ToolMetadata::new("rm").consequential().to_tool();
        assert_eq!(
            tool.annotations.and_then(|a| a.destructive_hint),
            Some(true)
        );
    }
}

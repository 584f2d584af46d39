use schemars::Schema;
use serde::Serialize;
use serde_json::{Map, Value, json};
use toolgate_registry::ToolSpec;

/// What a client sees for one tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Schema,
    pub annotations: ToolAnnotations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    pub read_only_hint: bool,
    pub destructive_hint: bool,
    pub requires_confirmation: bool,
    pub interactive: bool,
}

impl From<&ToolSpec> for ToolDescriptor {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            name: spec.name.clone(),
            description: spec.display_description(),
            input_schema: input_schema(spec),
            annotations: ToolAnnotations {
                read_only_hint: spec.read_only,
                destructive_hint: spec.destructive,
                requires_confirmation: spec.requires_confirmation,
                interactive: spec.interactive,
            },
        }
    }
}

/// Object schema for a tool's arguments.
///
/// Always carries a boolean `confirm` property, which is listed in `required` exactly
/// when the tool requires confirmation. Declared parameters follow in order.
#[must_use]
pub fn input_schema(spec: &ToolSpec) -> Schema {
    let mut properties = Map::new();
    properties.insert(
        "confirm".into(),
        json!({
            "type": "boolean",
            "description": "Confirm execution of this tool",
            "default": false,
        }),
    );
    let mut required = Vec::new();
    if spec.requires_confirmation {
        required.push(Value::from("confirm"));
    }

    for param in spec.parameters.iter().filter(|p| p.name != "confirm") {
        let description = if param.description.is_empty() {
            format!("Parameter for {}", spec.name)
        } else {
            param.description.clone()
        };
        properties.insert(
            param.name.clone(),
            json!({
                "type": param.param_type.as_str(),
                "description": description,
            }),
        );
        if param.required {
            required.push(Value::from(param.name.as_str()));
        }
    }

    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));
    schema.insert("required".into(), Value::Array(required));
    Schema::from(schema)
}

use crate::ai_sdk::{FunctionDeclaration, ToolApi};
use crate::platform::Platform;
use crate::protocol::ToolCall;
use schemars::JsonSchema;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

mod silent_action;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Invalid URL provided for open_url: \"{0}\"")]
    InvalidUrl(String),
    #[error("Unknown action type: \"{0}\"")]
    UnknownAction(String),
    #[error("Unknown tool: \"{0}\"")]
    UnknownTool(String),
    #[error("Invalid arguments for \"{tool}\": {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Action \"{action}\" failed.")]
    Failed {
        action: String,
        #[source]
        source: std::io::Error,
    },
}

type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ActionError>> + Send + 'a>>;

type ToolHandler = for<'a> fn(serde_json::Value, &'a dyn Platform) -> ActionFuture<'a>;

pub(crate) struct ToolDefinition {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) input_schema: serde_json::Value,
    pub(crate) handler: ToolHandler,
}

pub(crate) fn get_all_tools() -> Vec<ToolDefinition> {
    vec![silent_action::definition()]
}

/// Tool block sent to the provider with every chat request.
pub(crate) fn provider_tools() -> Vec<ToolApi> {
    let function_declarations = get_all_tools()
        .into_iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.to_string(),
            description: tool.description.to_string(),
            parameters: tool.input_schema,
        })
        .collect();

    vec![ToolApi {
        function_declarations,
    }]
}

/// Runs a model-requested tool locally and returns the human-readable result.
pub async fn execute_tool(call: &ToolCall, platform: &dyn Platform) -> Result<String, ActionError> {
    let tools = get_all_tools();
    let tool = tools
        .iter()
        .find(|t| t.name == call.name)
        .ok_or_else(|| ActionError::UnknownTool(call.name.clone()))?;

    let input = serde_json::to_value(&call.args).map_err(|source| ActionError::InvalidArguments {
        tool: call.name.clone(),
        source,
    })?;

    (tool.handler)(input, platform).await
}

/// Inline, title-less schema in the OpenAPI subset the provider accepts.
fn schema_for_type<T: JsonSchema>() -> serde_json::Value {
    let settings = schemars::generate::SchemaSettings::openapi3().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let generator = schemars::generate::SchemaGenerator::new(settings);
    let mut schema = generator.into_root_schema_for::<T>().to_value();
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("title");
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::RecordingPlatform;
    use std::collections::BTreeMap;

    fn call(name: &str, args: &[(&str, &str)]) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn provider_tools_declare_silent_action() {
        let tools = serde_json::to_value(provider_tools()).unwrap();
        let declaration = &tools[0]["functionDeclarations"][0];

        assert_eq!(declaration["name"], "execute_silent_action");
        let parameters = &declaration["parameters"];
        assert_eq!(parameters["type"], "object");
        assert_eq!(
            parameters["properties"]["action_type"]["enum"],
            serde_json::json!(["copy_text", "open_url"])
        );
        assert_eq!(parameters["properties"]["content"]["type"], "string");
        let mut required: Vec<_> = parameters["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        required.sort();
        assert_eq!(required, vec!["action_type", "content"]);
        assert!(parameters.get("title").is_none());
        assert!(parameters.get("$schema").is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let platform = RecordingPlatform::default();
        let err = execute_tool(&call("delete_everything", &[]), &platform)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnknownTool(name) if name == "delete_everything"));
    }

    #[tokio::test]
    async fn execute_tool_dispatches_by_name() {
        let platform = RecordingPlatform::default();
        let result = execute_tool(
            &call(
                "execute_silent_action",
                &[("action_type", "open_url"), ("content", "https://example.com")],
            ),
            &platform,
        )
        .await
        .unwrap();

        assert_eq!(result, "Opened URL: https://example.com");
        assert_eq!(platform.opened(), vec!["https://example.com"]);
    }
}

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{schema_for_type, ActionError, ActionFuture, ToolDefinition};
use crate::platform::Platform;

const NAME: &str = "execute_silent_action";

/// The type of silent action to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum ActionType {
    CopyText,
    OpenUrl,
}

impl ActionType {
    fn as_str(self) -> &'static str {
        match self {
            ActionType::CopyText => "copy_text",
            ActionType::OpenUrl => "open_url",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct SilentActionInput {
    action_type: ActionType,
    #[schemars(description = "The content or data related to the action (e.g., text to copy, URL to open).")]
    content: String,
}

fn parse_input(input: serde_json::Value) -> Result<SilentActionInput, ActionError> {
    match serde_json::from_value::<SilentActionInput>(input.clone()) {
        Ok(parsed) => Ok(parsed),
        Err(source) => {
            let action = input.get("action_type").and_then(|v| v.as_str());
            match action {
                Some(name) if !matches!(name, "copy_text" | "open_url") => {
                    Err(ActionError::UnknownAction(name.to_string()))
                }
                _ => Err(ActionError::InvalidArguments {
                    tool: NAME.to_string(),
                    source,
                }),
            }
        }
    }
}

fn is_web_url(content: &str) -> bool {
    content.starts_with("http://") || content.starts_with("https://")
}

async fn silent_action_impl(
    input: serde_json::Value,
    platform: &dyn Platform,
) -> Result<String, ActionError> {
    let input = parse_input(input)?;
    tracing::info!(
        action = input.action_type.as_str(),
        content = %input.content,
        "executing silent action"
    );

    let failed = |source: std::io::Error| ActionError::Failed {
        action: input.action_type.as_str().to_string(),
        source,
    };

    match input.action_type {
        ActionType::CopyText => match platform.write_clipboard(&input.content).await {
            Ok(()) => Ok("Text copied to clipboard.".to_string()),
            Err(err) => {
                tracing::debug!(error = %err, "clipboard unavailable, using fallback");
                platform
                    .write_clipboard_fallback(&input.content)
                    .await
                    .map_err(failed)?;
                Ok("Text copied to clipboard (fallback).".to_string())
            }
        },
        ActionType::OpenUrl => {
            if !is_web_url(&input.content) {
                return Err(ActionError::InvalidUrl(input.content));
            }
            platform
                .open_url(&input.content)
                .await
                .map_err(failed)?;
            Ok(format!("Opened URL: {}", input.content))
        }
    }
}

fn handle(input: serde_json::Value, platform: &dyn Platform) -> ActionFuture<'_> {
    Box::pin(silent_action_impl(input, platform))
}

pub(crate) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: NAME,
        description: "Executes a specific action without requiring a verbal response from the AI. Use this when the user explicitly asks for an action like copying text or opening a URL.",
        input_schema: schema_for_type::<SilentActionInput>(),
        handler: handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::RecordingPlatform;
    use serde_json::json;

    #[tokio::test]
    async fn open_url_accepts_https() {
        let platform = RecordingPlatform::default();
        let result = silent_action_impl(
            json!({"action_type": "open_url", "content": "https://example.com"}),
            &platform,
        )
        .await
        .unwrap();

        assert_eq!(result, "Opened URL: https://example.com");
        assert_eq!(platform.opened(), vec!["https://example.com"]);
    }

    #[tokio::test]
    async fn open_url_rejects_javascript_scheme() {
        let platform = RecordingPlatform::default();
        let err = silent_action_impl(
            json!({"action_type": "open_url", "content": "javascript:alert(1)"}),
            &platform,
        )
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Invalid URL provided for open_url: \"javascript:alert(1)\""
        );
        assert!(platform.opened().is_empty());
    }

    #[tokio::test]
    async fn copy_text_uses_clipboard() {
        let platform = RecordingPlatform::default();
        let result = silent_action_impl(
            json!({"action_type": "copy_text", "content": "hello"}),
            &platform,
        )
        .await
        .unwrap();

        assert_eq!(result, "Text copied to clipboard.");
        assert_eq!(platform.copied(), vec!["hello"]);
    }

    #[tokio::test]
    async fn copy_text_falls_back_when_clipboard_fails() {
        let platform = RecordingPlatform::without_clipboard();
        let result = silent_action_impl(
            json!({"action_type": "copy_text", "content": "hello"}),
            &platform,
        )
        .await
        .unwrap();

        assert_eq!(result, "Text copied to clipboard (fallback).");
        assert_eq!(platform.fallback_copied(), vec!["hello"]);
    }

    #[tokio::test]
    async fn unknown_action_type_is_named_in_error() {
        let platform = RecordingPlatform::default();
        let err = silent_action_impl(
            json!({"action_type": "format_disk", "content": "/"}),
            &platform,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "Unknown action type: \"format_disk\"");
    }

    #[tokio::test]
    async fn missing_content_is_invalid_arguments() {
        let platform = RecordingPlatform::default();
        let err = silent_action_impl(json!({"action_type": "copy_text"}), &platform)
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::InvalidArguments { .. }));
    }
}

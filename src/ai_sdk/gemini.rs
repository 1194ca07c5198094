use crate::protocol::{Message, Sender, ToolCall};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub(crate) contents: Vec<Content>,
    pub(crate) tools: Vec<ToolApi>,
    pub(crate) generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    pub(crate) max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) parts: Vec<Part>,
}

impl Content {
    fn new(role: &str, parts: Vec<Part>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

/// A content part. Exactly one field is set on parts we build; parts coming
/// back from the provider may carry fields we do not model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) function_call: Option<FunctionCall>,
}

impl Part {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    fn inline_data(blob: Blob) -> Self {
        Self {
            inline_data: Some(blob),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Blob {
    pub(crate) mime_type: String,
    pub(crate) data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FunctionCall {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: serde_json::Value,
}

impl FunctionCall {
    /// Flattens the arguments into the string map carried on the wire.
    pub(crate) fn to_tool_call(&self) -> ToolCall {
        let args = match &self.args {
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), value)
                })
                .collect(),
            _ => Default::default(),
        };

        ToolCall {
            name: self.name.clone(),
            args,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolApi {
    pub(crate) function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FunctionDeclaration {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub(crate) candidates: Vec<Candidate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Candidate {
    #[serde(default)]
    pub(crate) content: Option<Content>,
}

impl GenerateContentResponse {
    fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| content.parts.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn function_call(&self) -> Option<&FunctionCall> {
        self.parts()
            .iter()
            .find_map(|part| part.function_call.as_ref())
    }

    /// Text of the first part, if that part is text.
    pub(crate) fn text(&self) -> Option<&str> {
        self.parts()
            .first()
            .and_then(|part| part.text.as_deref())
            .filter(|text| !text.is_empty())
    }
}

/// Maps the posted conversation onto provider contents: every message but the
/// last is history, the last is the new user turn.
pub(crate) fn contents_from_messages(messages: &[Message]) -> Vec<Content> {
    let Some((current, history)) = messages.split_last() else {
        return Vec::new();
    };

    // Gemini rejects empty text parts, so blank history entries are skipped.
    let mut contents: Vec<Content> = history
        .iter()
        .filter(|message| !message.text.is_empty())
        .map(|message| {
            let role = match message.sender {
                Sender::User => "user",
                _ => "model",
            };
            Content::new(role, vec![Part::text(message.text.clone())])
        })
        .collect();

    let mut parts = Vec::new();
    if let Some(blob) = current.image.as_deref().and_then(blob_from_data_url) {
        parts.push(Part::inline_data(blob));
    }
    if !current.text.is_empty() || parts.is_empty() {
        parts.push(Part::text(current.text.clone()));
    }
    contents.push(Content::new("user", parts));

    contents
}

fn blob_from_data_url(url: &str) -> Option<Blob> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    if mime_type.is_empty() || data.is_empty() {
        return None;
    }

    Some(Blob {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contents_map_roles_and_split_last_turn() {
        let messages = vec![
            Message::new(0, Sender::User, "hi"),
            Message::new(1, Sender::Ai, "hello"),
            Message::new(2, Sender::System, "Text copied to clipboard."),
            Message::new(3, Sender::User, "open example.com"),
        ];

        let contents = contents_from_messages(&messages);
        let roles: Vec<_> = contents
            .iter()
            .map(|c| c.role.clone().unwrap_or_default())
            .collect();
        assert_eq!(roles, vec!["user", "model", "model", "user"]);
        assert_eq!(contents[3].parts, vec![Part::text("open example.com")]);
    }

    #[test]
    fn image_data_url_becomes_inline_data() {
        let mut message = Message::new(0, Sender::User, "Describe this image.");
        message.image = Some("data:image/png;base64,iVBORw0K".to_string());

        let contents = contents_from_messages(&[message]);
        let value = serde_json::to_value(&contents[0]).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "user",
                "parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0K"}},
                    {"text": "Describe this image."}
                ]
            })
        );
    }

    #[test]
    fn image_only_turn_sends_no_empty_text() {
        let mut current = Message::new(2, Sender::User, "");
        current.image = Some("data:image/jpeg;base64,/9j/4AAQ".to_string());
        let messages = vec![
            Message::new(0, Sender::User, "hi"),
            Message::new(1, Sender::Ai, ""),
            current,
        ];

        let value = serde_json::to_value(contents_from_messages(&messages)).unwrap();
        assert_eq!(
            value,
            json!([
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "user", "parts": [
                    {"inlineData": {"mimeType": "image/jpeg", "data": "/9j/4AAQ"}}
                ]}
            ])
        );
    }

    #[test]
    fn malformed_data_url_is_ignored() {
        assert!(blob_from_data_url("https://example.com/cat.png").is_none());
        assert!(blob_from_data_url("data:image/png,raw").is_none());
    }

    #[test]
    fn response_exposes_function_call_before_text() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Sure."},
                        {"functionCall": {
                            "name": "execute_silent_action",
                            "args": {"action_type": "copy_text", "content": "abc"}
                        }}
                    ]
                }
            }]
        }))
        .unwrap();

        let call = response.function_call().unwrap().to_tool_call();
        assert_eq!(call.name, "execute_silent_action");
        assert_eq!(call.args["content"], "abc");
        assert_eq!(response.text(), Some("Sure."));
    }

    #[test]
    fn empty_response_has_no_text() {
        let response: GenerateContentResponse =
            serde_json::from_value(json!({"candidates": [{"finishReason": "STOP"}]})).unwrap();
        assert!(response.text().is_none());
        assert!(response.function_call().is_none());
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire events for the incremental execution mode. The transport emits
/// exactly one `conversation_id` first and exactly one `done`/`error` last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ConversationId {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    Content {
        text: String,
    },
    ToolUse {
        tool: String,
    },
    ToolExecuting {
        tool: String,
    },
    ToolResult {
        tool: String,
        #[serde(rename = "isError")]
        is_error: bool,
    },
    Done,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tags() {
        let id = Uuid::now_v7();
        let frame = serde_json::to_value(StreamEvent::ConversationId {
            conversation_id: id,
        })
        .unwrap();
        assert_eq!(frame["type"], "conversation_id");
        assert_eq!(frame["conversationId"], id.to_string());

        let frame = serde_json::to_value(StreamEvent::ToolResult {
            tool: "read_file".into(),
            is_error: false,
        })
        .unwrap();
        assert_eq!(frame["type"], "tool_result");
        assert_eq!(frame["isError"], false);

        let frame = serde_json::to_value(StreamEvent::Done).unwrap();
        assert_eq!(frame, serde_json::json!({"type": "done"}));
    }
}

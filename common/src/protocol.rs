use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

pub const MODEL_NOT_FOUND_MESSAGE: &str = "Model not found on device.";
pub const UNKNOWN_CONTROL_EVENT_MESSAGE: &str = "Unknown control event.";

/// 注册请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_id: String,
}

/// 控制事件
///
/// Wire shape is `{"action": "...", ...}`. Unknown fields (the server may tag
/// requests with its own bookkeeping) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlEvent {
    Start,
    Stop,
    Select { network: String },
    GetSelected,
}

impl ControlEvent {
    /// Parses a control body. Anything outside the four known actions is a
    /// protocol error.
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| RelayError::ProtocolError(format!("{}: {}", UNKNOWN_CONTROL_EVENT_MESSAGE, e)))
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlEvent::Start => "start",
            ControlEvent::Stop => "stop",
            ControlEvent::Select { .. } => "select",
            ControlEvent::GetSelected => "get_selected",
        }
    }

    /// Whether the sender expects an answer on the same stream.
    pub fn expects_response(&self) -> bool {
        matches!(self, ControlEvent::Select { .. } | ControlEvent::GetSelected)
    }
}

/// 控制响应
///
/// `Error` is listed first so that `{"error": ...}` never decodes as an empty
/// selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Error { error: String },
    Selected { selected_model: Option<String> },
}

impl ControlResponse {
    pub fn selected(model: Option<String>) -> Self {
        ControlResponse::Selected { selected_model: model }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error { error: message.into() }
    }

    pub fn selected_model(&self) -> Option<&str> {
        match self {
            ControlResponse::Selected { selected_model } => selected_model.as_deref(),
            ControlResponse::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControlResponse::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_event_wire_shape() {
        let select = ControlEvent::Select { network: "mobilenet".to_string() };
        assert_eq!(
            serde_json::to_value(&select).unwrap(),
            json!({"action": "select", "network": "mobilenet"})
        );
        assert_eq!(
            serde_json::to_value(ControlEvent::GetSelected).unwrap(),
            json!({"action": "get_selected"})
        );
    }

    #[test]
    fn test_parse_ignores_extra_fields() {
        let event = ControlEvent::parse(br#"{"action":"get_selected","sid":"abc"}"#).unwrap();
        assert_eq!(event, ControlEvent::GetSelected);
        assert!(event.expects_response());
    }

    #[test]
    fn test_unknown_action_is_protocol_error() {
        let result = ControlEvent::parse(br#"{"action":"reboot"}"#);
        assert!(matches!(result, Err(RelayError::ProtocolError(_))));

        let result = ControlEvent::parse(b"not json");
        assert!(matches!(result, Err(RelayError::ProtocolError(_))));
    }

    #[test]
    fn test_control_response_shapes() {
        assert_eq!(
            serde_json::to_value(ControlResponse::selected(None)).unwrap(),
            json!({"selected_model": null})
        );

        let decoded: ControlResponse =
            serde_json::from_value(json!({"error": MODEL_NOT_FOUND_MESSAGE})).unwrap();
        assert!(decoded.is_error());
        assert_eq!(decoded.selected_model(), None);

        let decoded: ControlResponse =
            serde_json::from_value(json!({"selected_model": "mobilenet"})).unwrap();
        assert_eq!(decoded.selected_model(), Some("mobilenet"));
    }
}

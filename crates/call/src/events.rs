//! Call-control events

use chrono::{DateTime, Utc};
use serde::Serialize;
use voice_bridge_realtime::{EndReason, OrchestratorEvent, OrchestratorState};

/// Something observable happened on a call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEvent {
    pub call_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: CallEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CallEventKind {
    StateChanged(OrchestratorState),
    AgentTranscript { text: String },
    CallerTranscript { text: String },
    /// The caller interrupted the agent
    BargeIn,
    ToolCalled { name: String, success: bool },
    PlayoutFault { consecutive_failures: u32, message: String },
    Ended(EndReason),
}

impl CallEvent {
    pub fn new(call_id: impl Into<String>, kind: CallEventKind) -> Self {
        Self {
            call_id: call_id.into(),
            at: Utc::now(),
            kind,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.kind, CallEventKind::Ended(_))
    }

    /// Single-line JSON for event logs
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<OrchestratorEvent> for CallEventKind {
    fn from(event: OrchestratorEvent) -> Self {
        match event {
            OrchestratorEvent::StateChanged(state) => Self::StateChanged(state),
            OrchestratorEvent::AgentTranscript { text, .. } => Self::AgentTranscript { text },
            OrchestratorEvent::CallerTranscript { text } => Self::CallerTranscript { text },
            OrchestratorEvent::BargeIn { .. } => Self::BargeIn,
            OrchestratorEvent::ToolCalled { name, success } => Self::ToolCalled { name, success },
            OrchestratorEvent::Ended(reason) => Self::Ended(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_value(event: &CallEvent) -> Value {
        serde_json::from_str(&event.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_event_json_shape() {
        let event = CallEvent::new("c-1", CallEventKind::StateChanged(OrchestratorState::Closing));
        let value = as_value(&event);
        assert_eq!(value["call_id"], "c-1");
        assert_eq!(value["type"], "state_changed");
        assert_eq!(value["data"], "closing");
        assert!(value["at"].is_string());

        let value = as_value(&CallEvent::new("c-1", CallEventKind::BargeIn));
        assert_eq!(value["type"], "barge_in");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_ended_event_carries_reason() {
        let event = CallEvent::new(
            "c-2",
            CallEventKind::Ended(EndReason::TransportFault("socket closed".to_string())),
        );
        assert!(event.is_ended());
        assert_eq!(
            as_value(&event)["data"],
            json!({ "reason": "transport-fault", "detail": "socket closed" })
        );
    }

    #[test]
    fn test_orchestrator_events_drop_response_ids() {
        let kind: CallEventKind = OrchestratorEvent::BargeIn {
            response_id: "resp_1".to_string(),
        }
        .into();
        assert_eq!(kind, CallEventKind::BargeIn);
    }
}

//! Business-logic tool dispatch

use async_trait::async_trait;
use serde_json::json;

use crate::events::ToolDeclaration;
use crate::RealtimeError;

/// Handles function calls requested by the agent
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Functions advertised to the speech service
    fn declarations(&self) -> Vec<ToolDeclaration>;

    /// Run a function; the result is returned to the agent as JSON
    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RealtimeError>;
}

/// Handler with no business tools
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

#[async_trait]
impl ToolHandler for NoTools {
    fn declarations(&self) -> Vec<ToolDeclaration> {
        Vec::new()
    }

    async fn call(
        &self,
        name: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RealtimeError> {
        Err(RealtimeError::Tool(format!("unknown tool: {}", name)))
    }
}

/// Declaration of the built-in end-of-call function
pub fn end_call_declaration(name: &str) -> ToolDeclaration {
    ToolDeclaration {
        name: name.to_string(),
        description: "End the phone call after the closing remarks have been spoken.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the call is ending" }
            },
        }),
    }
}

//! Diagnostic name logger

use crate::gemini::{Behavior, FunctionDeclaration};
use serde_json::{json, Value};
use tracing::info;

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "console_log_name".to_string(),
        description: "Log a name to the console for debugging or demonstration purposes"
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "name": {
                    "type": "STRING",
                    "description": "The name to log to the console"
                }
            },
            "required": ["name"]
        }),
        behavior: Some(Behavior::NonBlocking),
    }
}

/// Log `name` and report success.
pub fn log_name(name: &str) -> Value {
    info!("Console tool: name logged - \"{}\"", name);
    json!({
        "status": "success",
        "message": format!("Successfully logged name: {}", name),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

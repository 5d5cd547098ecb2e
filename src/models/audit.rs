use serde::{Deserialize, Serialize};

/// Append-only audit record. Every write path emits one, with
/// `success=false` and `error_message` set on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub user_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Fields supplied by callers when recording an audit event.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub user_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditEvent {
    pub fn ok(action: &str, resource_type: &str, resource_id: impl Into<Option<String>>) -> Self {
        Self {
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(
        action: &str,
        resource_type: &str,
        resource_id: impl Into<Option<String>>,
        error: &str,
    ) -> Self {
        Self {
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.into(),
            success: false,
            error_message: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn timed(mut self, execution_time_ms: i64) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self
    }

    pub fn detail(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    /// Epoch seconds of the last ingestion attempt, when one happened.
    #[serde(rename = "lastAttempt", skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            last_attempt: None,
        }
    }
}

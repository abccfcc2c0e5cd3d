use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Successful response: status code plus decoded JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Terminal result delivered to a request's callback.
pub type Outcome = Result<Payload, ApiError>;

// Serializable error shape used by the CLI output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

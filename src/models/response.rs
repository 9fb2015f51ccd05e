// src/models/response.rs
//! Response envelopes shared by every gateway endpoint.
//!
//! ```text
//! success: {"success": true,  "data": ..., "message": ...}
//! failure: {"success": false, "errorCode": ..., "errorMessage": ..., "retryable": ..., "timestamp": ...}
//! ```

use crate::errors::classifier::ClassifiedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuccessResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> SuccessResponse<T> {
    pub fn data(data: T) -> Self {
        SuccessResponse {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error_code: String,
    pub error_message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ErrorResponse {
            success: false,
            error_code: code.into(),
            error_message: message.into(),
            retryable,
            timestamp: Utc::now(),
        }
    }
}

impl From<&ClassifiedError> for ErrorResponse {
    fn from(err: &ClassifiedError) -> Self {
        ErrorResponse::new(err.code.to_string(), err.message.clone(), err.retryable)
    }
}

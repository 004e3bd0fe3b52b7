use auth_perms::PermsError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Authorization denied
pub const CODE_DENIED: &str = "AUTHZ_3001";
/// Permission store could not answer
pub const CODE_UNAVAILABLE: &str = "STORE_5001";

/// Body of every guard rejection
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayErrorResponse {
    /// Unique error ID for tracking
    pub error_id: String,
    pub error_type: String,
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Why a request was stopped at the guard.
///
/// `Denied` and `Unavailable` stay distinct all the way to the client: a
/// denial is 403, a store failure is 503.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Missing permission: {permission}")]
    Denied { permission: String },

    #[error("Authorization could not be determined")]
    Unavailable(#[from] PermsError),
}

impl GatewayError {
    pub fn denied(permission: impl Into<String>) -> Self {
        Self::Denied {
            permission: permission.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Denied { .. } => StatusCode::FORBIDDEN,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Denied { .. } => "authorization_error",
            GatewayError::Unavailable(_) => "service_unavailable",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Denied { .. } => CODE_DENIED,
            GatewayError::Unavailable(_) => CODE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let error_id = Uuid::new_v4().to_string();
        let status_code = self.status_code();

        match &self {
            GatewayError::Denied { permission } => {
                info!(error_id = %error_id, permission = %permission, "Request denied");
            }
            GatewayError::Unavailable(source) => {
                // Store details stay in the log, never in the body
                error!(
                    error_id = %error_id,
                    status_code = %status_code.as_u16(),
                    error = %source,
                    "Permission store unavailable"
                );
            }
        }

        let body = GatewayErrorResponse {
            error_id,
            error_type: self.error_type().to_string(),
            code: self.code().to_string(),
            message: self.to_string(),
            timestamp: chrono::Utc::now(),
        };

        (status_code, Json(body)).into_response()
    }
}

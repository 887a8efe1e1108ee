use serde::{Deserialize, Serialize};
use tower_api_client::{Error as ApiError, StatusCode};

#[derive(Debug)]
pub enum YnabApiError {
    /// The API answered with a non-2xx status.
    Ynab(StatusCode, ErrorDetail),
    /// The request never produced an API answer (transport, timeout, decoding).
    Internal(ApiError),
}

impl YnabApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            YnabApiError::Ynab(status, _) => Some(status.as_u16()),
            YnabApiError::Internal(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

impl From<ApiError> for YnabApiError {
    fn from(value: ApiError) -> Self {
        match value {
            ApiError::ClientError(status, body) | ApiError::ServerError(status, body) => {
                let detail = match serde_json::from_str::<ErrorResponse>(&body) {
                    Ok(response) => response.error,
                    // Proxies and gateways answer with HTML or plain text
                    Err(_) => ErrorDetail {
                        id: status.as_u16().to_string(),
                        name: "unparsable_error".to_string(),
                        detail: body,
                    },
                };
                YnabApiError::Ynab(status, detail)
            }
            e => YnabApiError::Internal(e),
        }
    }
}

impl std::fmt::Display for YnabApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            YnabApiError::Internal(e) => write!(f, "Internal error: {}", e),
            YnabApiError::Ynab(status, detail) => {
                write!(f, "({}) {}: {}", status, detail.name, detail.detail)
            }
        }
    }
}

impl std::error::Error for YnabApiError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub id: String,
    pub name: String,
    pub detail: String,
}

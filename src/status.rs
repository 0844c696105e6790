//! Hub status codes and the mapping from wire status to typed errors

use serde::Deserialize;
use thiserror::Error;

/// Error reported by the hub for a rejected request
///
/// Every variant carries the numeric wire status and the message extracted
/// from the response body (empty when the body carried none).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// 400
    #[error("bad format: {message}")]
    BadFormat {
        /// Message from the error body
        message: String,
    },
    /// 401
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Message from the error body
        message: String,
    },
    /// 403
    #[error("too many devices: {message}")]
    TooManyDevices {
        /// Message from the error body
        message: String,
    },
    /// 404
    #[error("hub or device not found: {message}")]
    HubNotFound {
        /// Message from the error body
        message: String,
    },
    /// 412
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Message from the error body
        message: String,
    },
    /// 429
    #[error("too many requests: {message}")]
    TooManyRequests {
        /// Message from the error body
        message: String,
    },
    /// 500
    #[error("internal server error: {message}")]
    InternalServerError {
        /// Message from the error body
        message: String,
    },
    /// 503
    #[error("server busy: {message}")]
    ServerBusy {
        /// Message from the error body
        message: String,
    },
    /// Any other status above 300
    #[error("hub error {status}: {message}")]
    Other {
        /// Wire status
        status: u16,
        /// Message from the error body
        message: String,
    },
}

impl HubError {
    /// The wire status this error was mapped from
    pub fn status(&self) -> u16 {
        match self {
            HubError::BadFormat { .. } => 400,
            HubError::Unauthorized { .. } => 401,
            HubError::TooManyDevices { .. } => 403,
            HubError::HubNotFound { .. } => 404,
            HubError::PreconditionFailed { .. } => 412,
            HubError::TooManyRequests { .. } => 429,
            HubError::InternalServerError { .. } => 500,
            HubError::ServerBusy { .. } => 503,
            HubError::Other { status, .. } => *status,
        }
    }

    /// Message extracted from the error body
    pub fn message(&self) -> &str {
        match self {
            HubError::BadFormat { message }
            | HubError::Unauthorized { message }
            | HubError::TooManyDevices { message }
            | HubError::HubNotFound { message }
            | HubError::PreconditionFailed { message }
            | HubError::TooManyRequests { message }
            | HubError::InternalServerError { message }
            | HubError::ServerBusy { message }
            | HubError::Other { message, .. } => message,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "ExceptionMessage")]
    exception_message: Option<String>,
}

fn exception_message(body: Option<&[u8]>) -> String {
    body.and_then(|b| serde_json::from_slice::<ErrorBody>(b).ok())
        .and_then(|e| e.exception_message)
        .unwrap_or_default()
}

/// Map a wire status (and optional error body) to the error it represents
///
/// Statuses up to and including 300 are successes and map to `Ok(())`.
pub fn map_status(status: u16, body: Option<&[u8]>) -> Result<(), HubError> {
    if status <= 300 {
        return Ok(());
    }

    let message = exception_message(body);
    Err(match status {
        400 => HubError::BadFormat { message },
        401 => HubError::Unauthorized { message },
        403 => HubError::TooManyDevices { message },
        404 => HubError::HubNotFound { message },
        412 => HubError::PreconditionFailed { message },
        429 => HubError::TooManyRequests { message },
        500 => HubError::InternalServerError { message },
        503 => HubError::ServerBusy { message },
        status => HubError::Other { status, message },
    })
}

/// Outcome delivered to a send callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IotHubStatusCode {
    /// Accepted by the hub
    Ok,
    /// Accepted, nothing returned
    OkEmpty,
    /// 400
    BadFormat,
    /// 401
    Unauthorized,
    /// 403
    TooManyDevices,
    /// 404
    HubOrDeviceIdNotFound,
    /// 412
    PreconditionFailed,
    /// 413, or a message too large to batch
    RequestEntityTooLarge,
    /// 429
    ThrottlingError,
    /// 500
    InternalServerError,
    /// 503
    ServerBusy,
    /// Transport level failure or unmapped status
    Error,
    /// The message expired before it could be sent
    MessageExpired,
    /// The transport was closed while the message was queued
    MessageCancelledOnClose,
}

impl IotHubStatusCode {
    /// Status for an HTTP response code
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200 => IotHubStatusCode::Ok,
            204 => IotHubStatusCode::OkEmpty,
            413 => IotHubStatusCode::RequestEntityTooLarge,
            s => match map_status(s, None) {
                Ok(()) => IotHubStatusCode::Ok,
                Err(e) => IotHubStatusCode::from(&e),
            },
        }
    }

    /// `true` for `Ok` and `OkEmpty`
    pub fn is_success(self) -> bool {
        matches!(self, IotHubStatusCode::Ok | IotHubStatusCode::OkEmpty)
    }
}

impl From<&HubError> for IotHubStatusCode {
    fn from(e: &HubError) -> Self {
        match e {
            HubError::BadFormat { .. } => IotHubStatusCode::BadFormat,
            HubError::Unauthorized { .. } => IotHubStatusCode::Unauthorized,
            HubError::TooManyDevices { .. } => IotHubStatusCode::TooManyDevices,
            HubError::HubNotFound { .. } => IotHubStatusCode::HubOrDeviceIdNotFound,
            HubError::PreconditionFailed { .. } => IotHubStatusCode::PreconditionFailed,
            HubError::TooManyRequests { .. } => IotHubStatusCode::ThrottlingError,
            HubError::InternalServerError { .. } => IotHubStatusCode::InternalServerError,
            HubError::ServerBusy { .. } => IotHubStatusCode::ServerBusy,
            HubError::Other { status: 413, .. } => IotHubStatusCode::RequestEntityTooLarge,
            HubError::Other { .. } => IotHubStatusCode::Error,
        }
    }
}

impl std::fmt::Display for IotHubStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

//! Error type for batch service calls and its classification.

use thiserror::Error;

/// Errors raised by [`super::BatchService`] implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BatchError {
    /// The service answered with a non-success HTTP status.
    #[error("{operation} failed with status {status}: {message}")]
    Status {
        /// Operation that was attempted (for example `create pool`).
        operation: String,
        /// HTTP status code returned by the service.
        status: u16,
        /// Provider error code such as `PoolExists`, when present.
        code: Option<String>,
        /// Provider error message.
        message: String,
    },
    /// The request never produced a response.
    #[error("{operation} failed: {message}")]
    Transport {
        /// Operation that was attempted.
        operation: String,
        /// Transport error message.
        message: String,
    },
    /// A response body could not be decoded.
    #[error("failed to decode {operation} response: {message}")]
    Decode {
        /// Operation whose response was malformed.
        operation: String,
        /// Decoder error message.
        message: String,
    },
    /// An access token could not be obtained.
    #[error("authentication failed: {message}")]
    Auth {
        /// Description of the failure.
        message: String,
    },
}

impl BatchError {
    /// Shorthand for a [`BatchError::Status`] without a provider code.
    #[must_use]
    pub fn status(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            operation: operation.into(),
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Shorthand for a [`BatchError::Transport`].
    #[must_use]
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Closed set of outcomes the orchestration policies care about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The resource already exists.
    Conflict,
    /// The resource does not exist.
    NotFound,
    /// A retry later may succeed.
    Transient,
    /// Retrying will not help.
    Fatal,
}

/// Classifies an error independently of how the transport reported it.
#[must_use]
pub const fn classify(error: &BatchError) -> ErrorClass {
    match error {
        BatchError::Status { status, .. } => match *status {
            409 => ErrorClass::Conflict,
            404 => ErrorClass::NotFound,
            408 | 429 | 500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        },
        BatchError::Transport { .. } => ErrorClass::Transient,
        BatchError::Decode { .. } | BatchError::Auth { .. } => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(409, ErrorClass::Conflict)]
    #[case(404, ErrorClass::NotFound)]
    #[case(408, ErrorClass::Transient)]
    #[case(429, ErrorClass::Transient)]
    #[case(500, ErrorClass::Transient)]
    #[case(503, ErrorClass::Transient)]
    #[case(400, ErrorClass::Fatal)]
    #[case(403, ErrorClass::Fatal)]
    fn classify_maps_status_codes(#[case] status: u16, #[case] expected: ErrorClass) {
        assert_eq!(classify(&BatchError::status("op", status, "msg")), expected);
    }

    #[rstest]
    fn classify_treats_transport_as_transient() {
        let err = BatchError::transport("get task", "connection reset");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[rstest]
    fn classify_treats_decode_and_auth_as_fatal() {
        let decode = BatchError::Decode {
            operation: String::from("get task"),
            message: String::from("eof"),
        };
        let auth = BatchError::Auth {
            message: String::from("bad secret"),
        };
        assert_eq!(classify(&decode), ErrorClass::Fatal);
        assert_eq!(classify(&auth), ErrorClass::Fatal);
    }

    #[rstest]
    fn status_error_renders_operation_and_code() {
        let err = BatchError::status("create pool", 409, "The specified pool already exists.");
        assert_eq!(
            err.to_string(),
            "create pool failed with status 409: The specified pool already exists."
        );
    }
}

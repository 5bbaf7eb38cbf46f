//! Error types for a3s-jetstream
//!
//! `JetStreamError` is the closed, caller-facing taxonomy. Raw transport
//! failures are mapped into it by [`translate`], which keeps the broker's
//! `err_code` and description on every variant it produces.

use crate::transport::{codes, ApiError, TransportError};
use thiserror::Error;

/// Errors surfaced by streams, consumers, publishing and consuming
#[derive(Debug, Error)]
pub enum JetStreamError {
    /// JetStream is switched off in the local configuration
    #[error("JetStream is disabled in the client configuration")]
    CapabilityDisabled,

    /// The broker reports JetStream as disabled or absent
    #[error("JetStream is not available on the server: {description}")]
    CapabilityUnavailable {
        raw_code: Option<u64>,
        description: String,
    },

    /// The connection is not established or is currently down
    #[error("Connection not ready: {0}")]
    NotReady(String),

    /// Stream, consumer or subject target does not exist
    #[error("{resource} not found: {description}")]
    NotFound {
        resource: String,
        raw_code: Option<u64>,
        description: String,
    },

    /// Existing state is incompatible with the request
    #[error("Conflict on {resource}: {description} (err_code {raw_code})")]
    Conflict {
        resource: String,
        raw_code: u64,
        description: String,
    },

    /// No acknowledgement or reply within the allotted time
    #[error("Operation timed out: {description}")]
    Timeout {
        description: String,
        raw_code: Option<u64>,
    },

    /// Stream, consumer or subject name rejected before any network call
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Payload encoding failure
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything else, with the original status and code preserved
    #[error("JetStream error on {resource}: {description}{}", code_suffix(.status, .raw_code))]
    Unknown {
        resource: String,
        status: Option<u16>,
        raw_code: Option<u64>,
        description: String,
    },
}

fn code_suffix(status: &Option<u16>, raw_code: &Option<u64>) -> String {
    match (*status, *raw_code) {
        (Some(s), Some(c)) => format!(" (status {}, err_code {})", s, c),
        (None, Some(c)) => format!(" (err_code {})", c),
        (Some(s), None) => format!(" (status {})", s),
        (None, None) => String::new(),
    }
}

impl JetStreamError {
    /// Broker error code behind this error, if one was reported
    pub fn raw_code(&self) -> Option<u64> {
        match self {
            JetStreamError::CapabilityUnavailable { raw_code, .. }
            | JetStreamError::NotFound { raw_code, .. }
            | JetStreamError::Timeout { raw_code, .. }
            | JetStreamError::Unknown { raw_code, .. } => *raw_code,
            JetStreamError::Conflict { raw_code, .. } => Some(*raw_code),
            _ => None,
        }
    }

    /// Whether a caller-side retry may succeed without changing the request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JetStreamError::Timeout { .. }
                | JetStreamError::NotReady(_)
                | JetStreamError::Unknown { .. }
        )
    }

    /// Whether the target stream, consumer or subject does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, JetStreamError::NotFound { .. })
    }

    /// Whether existing state rejected the request
    pub fn is_conflict(&self) -> bool {
        matches!(self, JetStreamError::Conflict { .. })
    }
}

/// Result type alias for JetStream operations
pub type Result<T> = std::result::Result<T, JetStreamError>;

/// Where a transport failure surfaced
///
/// The same raw failure means different things at different boundaries:
/// "no responders" on an API subject means JetStream is absent, while on
/// a publish subject it means no stream captures that subject.
#[derive(Debug, Clone, Copy)]
pub enum Boundary<'a> {
    /// A management request about the named resource
    Management(&'a str),
    /// A publish to the given subject
    Publish(&'a str),
    /// A pull request against the named consumer
    Fetch(&'a str),
    /// An acknowledgement of a delivered message
    Ack(&'a str),
}

impl Boundary<'_> {
    fn resource(&self) -> String {
        match self {
            Boundary::Management(r) | Boundary::Fetch(r) => r.to_string(),
            Boundary::Publish(s) => format!("subject '{}'", s),
            Boundary::Ack(s) => format!("ack '{}'", s),
        }
    }
}

/// Map a raw transport failure into the caller-facing taxonomy
pub fn translate(err: TransportError, boundary: Boundary<'_>) -> JetStreamError {
    match err {
        TransportError::Api(api) => translate_api(api, boundary),
        TransportError::TimedOut => JetStreamError::Timeout {
            description: format!("no reply for {}", boundary.resource()),
            raw_code: None,
        },
        TransportError::NoResponders => match boundary {
            Boundary::Management(_) => JetStreamError::CapabilityUnavailable {
                raw_code: None,
                description: "no responders on the JetStream API".to_string(),
            },
            Boundary::Publish(_) => JetStreamError::NotFound {
                resource: boundary.resource(),
                raw_code: None,
                description: "no stream captures this subject".to_string(),
            },
            Boundary::Fetch(_) => JetStreamError::NotFound {
                resource: boundary.resource(),
                raw_code: None,
                description: "consumer is not available".to_string(),
            },
            Boundary::Ack(_) => JetStreamError::Unknown {
                resource: boundary.resource(),
                status: None,
                raw_code: None,
                description: "no responders".to_string(),
            },
        },
        TransportError::Disconnected(reason) => JetStreamError::NotReady(reason),
        TransportError::Io(reason) | TransportError::Decode(reason) => JetStreamError::Unknown {
            resource: boundary.resource(),
            status: None,
            raw_code: None,
            description: reason,
        },
    }
}

fn translate_api(api: ApiError, boundary: Boundary<'_>) -> JetStreamError {
    let resource = boundary.resource();
    match api.err_code {
        codes::NOT_ENABLED | codes::NOT_ENABLED_FOR_ACCOUNT => {
            JetStreamError::CapabilityUnavailable {
                raw_code: Some(api.err_code),
                description: api.description,
            }
        }
        codes::STREAM_NOT_FOUND
        | codes::CONSUMER_NOT_FOUND
        | codes::CONSUMER_DOES_NOT_EXIST
        | codes::NO_MESSAGE_FOUND => JetStreamError::NotFound {
            resource,
            raw_code: Some(api.err_code),
            description: api.description,
        },
        codes::STREAM_NAME_IN_USE
        | codes::STREAM_SUBJECT_OVERLAP
        | codes::STREAM_NOT_MATCH
        | codes::CONSUMER_NAME_EXISTS
        | codes::CONSUMER_ALREADY_EXISTS
        | codes::WRONG_LAST_SEQUENCE
        | codes::WRONG_LAST_MSG_ID => JetStreamError::Conflict {
            resource,
            raw_code: api.err_code,
            description: api.description,
        },
        _ if api.code == 408 => JetStreamError::Timeout {
            description: format!("{}: {}", resource, api.description),
            raw_code: Some(api.err_code).filter(|c| *c != 0),
        },
        _ if api.code == 404 => JetStreamError::NotFound {
            resource,
            raw_code: Some(api.err_code).filter(|c| *c != 0),
            description: api.description,
        },
        _ if api.code == 503 => JetStreamError::CapabilityUnavailable {
            raw_code: Some(api.err_code).filter(|c| *c != 0),
            description: api.description,
        },
        _ => JetStreamError::Unknown {
            resource,
            status: Some(api.code),
            raw_code: Some(api.err_code),
            description: api.description,
        },
    }
}

/// Whether an API error is the "stream exists with a different configuration" signal
///
/// This is the trigger for create-or-update's automatic update path.
pub fn is_stream_config_conflict(err: &JetStreamError) -> bool {
    matches!(
        err,
        JetStreamError::Conflict { raw_code, .. } if *raw_code == codes::STREAM_NAME_IN_USE
    )
}

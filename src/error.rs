//! Error types for the gateway client core

use crate::types::RequestId;

/// Every failure the core can surface to a caller.
///
/// `Clone` so that a single transport failure can be delivered to every
/// outstanding waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the gateway")]
    NotConnected,

    #[error("connection to the gateway was lost")]
    Disconnected,

    #[error("request was cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gateway error {code} for request {request_id}: {message}")]
    Remote {
        request_id: RequestId,
        code: i32,
        message: String,
    },

    #[error("request {0} was already resolved")]
    AlreadyResolved(RequestId),

    #[error("request {0} already has a waiter")]
    AlreadyAwaited(RequestId),

    #[error("outcome of request {0} was already consumed")]
    AlreadyConsumed(RequestId),

    #[error("request {request_id} resolved with an unexpected reply (wanted {expected})")]
    UnexpectedReply {
        request_id: RequestId,
        expected: &'static str,
    },

    #[error("no contract details returned for request {0}")]
    ContractNotFound(RequestId),

    #[error("unknown order {0}")]
    UnknownOrder(RequestId),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

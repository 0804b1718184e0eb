use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable wire-level error codes carried in `__error__` and `ERROR` frames.
///
/// The serialized form is the SCREAMING_SNAKE_CASE name, e.g.
/// `INVALID_CREDENTIALS` — clients match on these strings, so variants must
/// never be renamed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    InvalidChannel,
    InvalidCredentials,
    AccessDenied,
    VhostNotFound,
    ChannelExists,
    ChannelNotFound,
    UserExists,
    UserNotFound,
    Unauthorized,
    Timeout,
    Internal,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("vhost not found: {0}")]
    VhostNotFound(String),

    #[error("vhost already exists: {0}")]
    VhostExists(String),

    #[error("invalid vhost path: {0:?}")]
    InvalidVhostPath(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("channel already exists: {0}")]
    ChannelExists(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("access denied")]
    AccessDenied,

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("authentication timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Map to the stable wire code sent to the offending connection.
    ///
    /// Errors that can only arise from the administrative Context API
    /// (duplicate vhost, malformed vhost path) never cross the wire, but get
    /// a conservative `INTERNAL` mapping in case one ever does.
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::VhostNotFound(_) => ErrorCode::VhostNotFound,
            BrokerError::ChannelExists(_) => ErrorCode::ChannelExists,
            BrokerError::ChannelNotFound(_) => ErrorCode::ChannelNotFound,
            BrokerError::UserExists(_) => ErrorCode::UserExists,
            BrokerError::UserNotFound(_) => ErrorCode::UserNotFound,
            BrokerError::InvalidCredentials => ErrorCode::InvalidCredentials,
            BrokerError::AccessDenied => ErrorCode::AccessDenied,
            BrokerError::Unauthorized => ErrorCode::Unauthorized,
            BrokerError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            BrokerError::InvalidChannel(_) => ErrorCode::InvalidChannel,
            BrokerError::InvalidName(_) => ErrorCode::InvalidPayload,
            BrokerError::Timeout => ErrorCode::Timeout,
            BrokerError::VhostExists(_)
            | BrokerError::InvalidVhostPath(_)
            | BrokerError::Io(_)
            | BrokerError::Internal(_) => ErrorCode::Internal,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

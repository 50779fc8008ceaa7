use thiserror::Error;

use crate::Message;

/// A frame that could not be turned into a [`Message`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownTag(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Rejected login or registration. Non-fatal: the client may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("user not found")]
    UserNotFound,
    #[error("wrong password")]
    WrongPassword,
    #[error("user already online")]
    AlreadyOnline,
    #[error("user already exists")]
    UserExist,
}

/// Rejected invite or accept. Non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("user not found")]
    UserNotFound,
    #[error("user is chatting")]
    UserIsChatting,
    #[error("cannot invite yourself")]
    InviteYourself,
}

impl From<AuthError> for Message {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::UserNotFound => Self::UserNotFound,
            AuthError::WrongPassword => Self::WrongPassword,
            AuthError::AlreadyOnline => Self::AlreadyOnline,
            AuthError::UserExist => Self::UserExist,
        }
    }
}

impl From<PairingError> for Message {
    fn from(err: PairingError) -> Self {
        match err {
            PairingError::UserNotFound => Self::UserNotFound,
            PairingError::UserIsChatting => Self::UserIsChatting,
            PairingError::InviteYourself => Self::InviteYourself,
        }
    }
}

use thiserror::Error;

/// Fatal to a connection attempt; the transport is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("identity must not be empty")]
    MissingIdentity,
}

/// Non-fatal lookup failures. Logged and swallowed by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupMiss {
    #[error("no pending offer from {0}")]
    OfferNotFound(String),
    #[error("identity {0} is not connected")]
    IdentityUnresolved(String),
}

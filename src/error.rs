use thiserror::Error;

/// Failures that callers need to tell apart. They travel inside `anyhow::Error` and can be
///  recovered with `downcast_ref::<XgressError>()`.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum XgressError {
    /// Deliberately coarse: the details are logged locally and never handed to the (possibly
    ///  unauthenticated) caller
    #[error("unexpected failure while authenticating")]
    AuthenticationFailure,
    /// The controller rejected a request, the message is the one it sent back
    #[error("{0}")]
    Rejected(String),
    #[error("timeout while {0}")]
    Timeout(&'static str),
    #[error("binding not found: {0}")]
    BindingNotFound(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

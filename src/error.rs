//! Error kinds and the policy that binds them to process exit codes.
//!
//! Mirrors spec §7 exactly: each variant names one of the seven error
//! kinds, and [`Error::exit_code`] implements the CLI's exit-code table
//! (§6: 0 clean, 1 configuration error, 2 fatal runtime error, 130
//! interrupted).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("salesforce auth error: {0}")]
    Auth(String),

    #[error("source transient error: {0}")]
    SourceTransient(String),

    #[error("source fatal error: {0}")]
    SourceFatal(String),

    #[error("replay store error: {0}")]
    ReplayStore(String),

    #[error("sink network error: {0}")]
    SinkNetwork(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("interrupted")]
    Interrupted,
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Exit code this error should surface as, per spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 1,
            Error::Interrupted => 130,
            Error::Auth(_)
            | Error::SourceTransient(_)
            | Error::SourceFatal(_)
            | Error::ReplayStore(_)
            | Error::SinkNetwork(_)
            | Error::Routing(_) => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

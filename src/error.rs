use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error exposed by every Key/Value operation.
///
/// Validation failures are raised locally before anything is put on the wire;
/// server failures are lifted out of the JetStream API error envelope into
/// the matching variant, with [`Error::Api`] as the catch-all that preserves
/// the server diagnostics.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid Argument - {0}")]
    InvalidArgument(String),

    #[error("Not Found - {0}")]
    NotFound(String),

    #[error("Already Exists - {0}")]
    AlreadyExists(String),

    #[error("Wrong Last Sequence - {0}")]
    WrongLastSequence(String),

    #[error("Bad Request - {0}")]
    BadRequest(String),

    #[error("Request Timeout - {0}")]
    Timeout(String),

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("API Error - code={code} err_code={err_code} {description}")]
    Api {
        code: u16,
        err_code: u64,
        description: String,
    },

    #[error("{0}")]
    Other(String),
}

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the config store, the key file and the API clients.
#[derive(Debug, Error)]
pub enum Error {
    /// The config file could not be read, parsed or written.
    #[error("config error: {0}")]
    Config(String),

    /// No API key could be found in the key file.
    #[error("no API key found at {}", path.display())]
    CredentialMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The API answered with a non-2xx status.
    #[error("API request failed with status {status}: {body}")]
    Request { status: u16, body: String },

    /// The request never produced a response (DNS, TLS, connection reset...).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body did not have the expected JSON shape.
    #[error("failed to parse API response: {0}")]
    ResponseParse(#[from] serde_json::Error),

    #[error("file error at {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown image size '{0}', expected one of: small, medium, large")]
    UnknownImageSize(String),

    #[error("failed to decode image data: {0}")]
    Decode(#[from] base64::DecodeError),

    /// An image entry carried no URL and no inline data, or its data was empty.
    #[error("image entry {0} has no data")]
    MissingImageData(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileIo {
            path: path.into(),
            source,
        }
    }
}

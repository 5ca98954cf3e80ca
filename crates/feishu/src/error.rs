use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credentials/mode for the requested operation.
    /// Fatal to that operation; never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Signature, verification-token, or decryption mismatch on a webhook
    /// callback. Carries no detail: callers must not be able to tell which
    /// secret failed.
    #[error("callback verification failed")]
    Authentication,

    /// The body is not a recognizable platform envelope.
    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },

    /// Streaming transport failure after the reconnect budget is exhausted.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Outbound send or reply-pipeline failure.
    #[error("downstream error: {message}")]
    Downstream { message: String },

    #[error(transparent)]
    Channel(#[from] perch_channels::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl Error {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn downstream(message: impl Into<String>) -> Self {
        Self::Downstream {
            message: message.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

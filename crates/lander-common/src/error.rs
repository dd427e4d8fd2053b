use hyper::StatusCode;
use thiserror::Error;

/// Every failure lander can report, grouped by the boundary that handles it.
#[derive(Error, Debug)]
pub enum LanderError {
    /// Missing or unreadable script (or other invalid settings) at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The script failed while a runtime generation was being built.
    #[error("Build error: {0}")]
    Build(String),

    /// The inbound request could not be turned into a request view.
    #[error("Bad request: {0}")]
    Request(String),

    #[error("No route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The script raised (or returned something unusable) during a call.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LanderError {
    /// HTTP status used when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            LanderError::Request(_) | LanderError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LanderError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message exposed to HTTP clients in the `error` field.
    ///
    /// Unlike `Display`, this omits the category prefix for errors that carry
    /// text produced by the script or the client.
    pub fn client_message(&self) -> String {
        match self {
            LanderError::Request(msg) | LanderError::Handler(msg) => msg.clone(),
            LanderError::RouteNotFound { method, path } => format!("no route for {} {}", method, path),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LanderError>;

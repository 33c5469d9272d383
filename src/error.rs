use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::ParseError;

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Client Error: status={status}, code={code}, message={message}, data={data:?}")]
    ClientError {
        status: StatusCode,
        code: i64,
        message: String,
        data: Option<Value>,
        header: HeaderMap,
    },

    #[error("Server Error: status={status}, code={code}, message={message}")]
    ServerError {
        status: StatusCode,
        code: i64,
        message: String,
        header: HeaderMap,
    },

    #[error("Rate Limited: route={route}, retry_after={retry_after:?}, global={global}")]
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },

    #[error("Invalid Route: '{template}' expects {expected} parameters, received {received}")]
    InvalidRoute {
        template: &'static str,
        expected: usize,
        received: usize,
    },

    #[error("Parameter Value Error: Invalid value '{value}' for parameter '{param}'")]
    ParameterValueError { param: String, value: String },

    #[error("Request was cancelled before it was sent")]
    Cancelled,

    #[error("Request precondition failed; request was not sent")]
    PreconditionFailed,

    #[error("Request was dropped before a result was delivered")]
    RequestAborted,

    #[error("Requester is shutting down")]
    Shutdown,

    #[error("Request timed out")]
    Timeout,

    #[error("WebSocket Error: {0}")]
    WebsocketError(String),

    #[error("Gateway closed: code={code}, reason={reason}")]
    GatewayClosed { code: u16, reason: String },

    #[error("Gateway payload decode error: {0}")]
    DecodeError(String),

    #[error("Gateway decompression error: {0}")]
    Decompress(#[from] flate2::DecompressError),

    #[error("Authentication Error: {0}")]
    AuthenticationError(String),

    #[error("HTTP Request Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Query String Serialization Error: {0}")]
    QueryError(#[from] serde_qs::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("Invalid HTTP Header Value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConnectorError {
    /// Whether the failure happened locally, before anything reached the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConnectorError::InvalidRoute { .. }
                | ConnectorError::ParameterValueError { .. }
                | ConnectorError::Cancelled
                | ConnectorError::PreconditionFailed
                | ConnectorError::Shutdown
        )
    }

    /// HTTP status carried by the error, if it came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ConnectorError::ClientError { status, .. }
            | ConnectorError::ServerError { status, .. } => Some(*status),
            ConnectorError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            ConnectorError::ReqwestError(e) => e.status(),
            _ => None,
        }
    }
}

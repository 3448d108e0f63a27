use serde_json::Value as JsonValue;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Integer error codes understood by the backend.
pub mod codes {
    pub const OTHER_CAUSE: i64 = -1;
    pub const CONNECTION_FAILED: i64 = 100;
    pub const MISSING_OBJECT_ID: i64 = 104;
    pub const INVALID_KEY_NAME: i64 = 105;
    pub const INVALID_JSON: i64 = 107;
    pub const INCORRECT_TYPE: i64 = 111;
    pub const AGGREGATE_ERROR: i64 = 600;
}

/// A single object's failure inside a batch save or destroy.
#[derive(Debug)]
pub struct ObjectFailure {
    pub class_name: String,
    pub object_id: Option<String>,
    pub error: Error,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("invalid merge: {0}")]
    InvalidMerge(String),
    #[error("unsaved reference: {0}")]
    UnsavedReference(String),
    #[error("invalid key name: {0}")]
    InvalidKey(String),
    #[error("invalid ACL: {0}")]
    InvalidAcl(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("missing object id: {0}")]
    MissingObjectId(String),
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("{} object(s) failed in batch", .0.len())]
    Aggregate(Vec<ObjectFailure>),
    #[error("tried to save a batch with a cycle")]
    Cycle,
    #[error("the client owning this object has been dropped")]
    ClientDropped,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Backend error code carried by this error.
    pub fn code(&self) -> i64 {
        match self {
            Error::TypeMismatch(_) | Error::InvalidMerge(_) => codes::INCORRECT_TYPE,
            Error::InvalidKey(_) => codes::INVALID_KEY_NAME,
            Error::MissingObjectId(_) => codes::MISSING_OBJECT_ID,
            Error::InvalidJson(_) | Error::Json(_) => codes::INVALID_JSON,
            Error::Server { code, .. } => *code,
            Error::Aggregate(_) => codes::AGGREGATE_ERROR,
            Error::UnsavedReference(_)
            | Error::InvalidAcl(_)
            | Error::InvalidOperation(_)
            | Error::Cycle
            | Error::ClientDropped => codes::OTHER_CAUSE,
        }
    }

    /// Parse a structured `{"code": .., "error": ..}` payload returned by the backend.
    pub fn from_server_json(json: &JsonValue) -> Self {
        let code = json
            .get("code")
            .and_then(JsonValue::as_i64)
            .unwrap_or(codes::OTHER_CAUSE);
        let message = json
            .get("error")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown server error")
            .to_string();
        Error::Server { code, message }
    }

    pub fn server(code: i64, message: impl Into<String>) -> Self {
        Error::Server {
            code,
            message: message.into(),
        }
    }
}

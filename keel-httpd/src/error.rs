use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors relating to the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The entity was not found.
    #[error("entity not found")]
    NotFound,

    /// The requested service is unknown.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The request was malformed.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// Invalid repository name.
    #[error("invalid repository name: {0}")]
    RepoName(#[from] keel::storage::NameError),

    /// Invalid account address.
    #[error("invalid address: {0}")]
    Address(#[from] keel::chain::AddressError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] keel::storage::Error),

    /// Push pipeline error.
    #[error(transparent)]
    Push(#[from] keel::push::Error),

    /// Chain RPC error.
    #[error(transparent)]
    Chain(#[from] keel::chain::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Storage(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Error::Push(keel::push::Error::Storage(e)) if e.is_not_found() => {
                StatusCode::NOT_FOUND
            }
            Error::UnknownService(_)
            | Error::BadRequest(_)
            | Error::RepoName(_)
            | Error::Address(_) => StatusCode::BAD_REQUEST,
            Error::Chain(keel::chain::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The request field the error relates to, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Error::UnknownService(_) => Some("service"),
            Error::RepoName(_) => Some("repo"),
            Error::Address(_) => Some("address"),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        let body = Json(json!({
            "code": status.as_u16(),
            "msg": self.to_string(),
            "field": self.field(),
        }));

        (status, body).into_response()
    }
}

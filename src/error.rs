//! Matrix JSON error responses and response body helpers

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::http::response::Builder;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::info;

/// Response body type used throughout the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Build a full response body from bytes
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Build an empty response body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Matrix error codes returned by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    /// Unexpected internal failure
    Unknown,
    /// Request body was not valid JSON
    BadJson,
    /// Authentication failed
    Forbidden,
}

impl ErrCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrCode::Unknown => "M_UNKNOWN",
            ErrCode::BadJson => "M_BAD_JSON",
            ErrCode::Forbidden => "M_FORBIDDEN",
        }
    }
}

/// The information needed to make an error response for a Matrix client
/// along with the actual error that caused the failure for logging.
#[derive(Debug)]
pub struct HttpError {
    /// Root cause, logged but never sent to the client
    pub err: anyhow::Error,
    /// HTTP status code to report to the client
    pub status: StatusCode,
    /// Value for the "errcode" field of the JSON response
    pub errcode: ErrCode,
    /// Value for the "error" field of the JSON response
    pub message: &'static str,
}

impl HttpError {
    pub fn new(
        err: impl Into<anyhow::Error>,
        status: StatusCode,
        errcode: ErrCode,
        message: &'static str,
    ) -> Self {
        Self {
            err: err.into(),
            status,
            errcode,
            message,
        }
    }
}

/// JSON error body in the standard Matrix shape
#[derive(Debug, Serialize)]
struct MatrixError<'a> {
    errcode: &'a str,
    error: &'a str,
}

/// Set the "Content-Type" to "application/json" and set CORS headers so
/// that arbitrary sites can use the APIs.
pub fn matrix_headers(builder: Builder) -> Builder {
    builder
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
        .header(
            "Access-Control-Allow-Headers",
            "Origin, X-Requested-With, Content-Type, Accept",
        )
}

/// Log the error and build a JSON formatted Matrix error response.
pub fn log_and_reply_error(http_error: &HttpError) -> Response<ProxyBody> {
    info!(
        error = %http_error.err,
        err_message = http_error.message,
        status_code = http_error.status.as_u16(),
        err_code = http_error.errcode.as_str(),
        "Responding with error"
    );
    reply_error(http_error.status, http_error.errcode.as_str(), http_error.message)
}

/// Build a JSON formatted Matrix error response without logging.
pub fn reply_error(status: StatusCode, errcode: &str, message: &str) -> Response<ProxyBody> {
    let body = serde_json::to_string(&MatrixError {
        errcode,
        error: message,
    })
    .unwrap_or_else(|_| format!(r#"{{"errcode":"{}","error":"{}"}}"#, errcode, message));

    matrix_headers(Response::builder().status(status))
        .body(full_body(body))
        .expect("valid response with static headers")
}

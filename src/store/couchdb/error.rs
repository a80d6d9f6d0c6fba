//! Error types shared by the CouchDB store implementation.

use reqwest::StatusCode;
use thiserror::Error;

use crate::store::error::StoreError;

/// Convenient result alias returning [`CouchStoreError`] failures.
pub type CouchResult<T> = Result<T, CouchStoreError>;

/// Failures that can occur while interacting with CouchDB.
#[derive(Debug, Error)]
pub enum CouchStoreError {
    /// Required environment variable is missing.
    #[error("missing CouchDB environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the missing variable.
        var: &'static str,
    },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build CouchDB client")]
    ClientBuilder {
        /// Builder failure.
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB rejected a GET against the target database.
    #[error("failed to query CouchDB database `{database}`")]
    DatabaseQuery {
        /// Database that was queried.
        database: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB rejected a database creation request.
    #[error("failed to create CouchDB database `{database}`")]
    DatabaseCreate {
        /// Database that was being created.
        database: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB returned an unexpected status code for a database operation.
    #[error("unexpected CouchDB database response status {status} for `{database}`")]
    DatabaseStatus {
        /// Database the operation targeted.
        database: String,
        /// Status code CouchDB answered with.
        status: StatusCode,
    },
    /// A request to a document endpoint could not be sent.
    #[error("failed to send CouchDB request to `{path}`")]
    RequestSend {
        /// Document path the request targeted.
        path: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB returned an unexpected status code for a document endpoint.
    #[error("unexpected CouchDB response status {status} for `{path}`")]
    RequestStatus {
        /// Document path the request targeted.
        path: String,
        /// Status code CouchDB answered with.
        status: StatusCode,
    },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode CouchDB response for `{path}`")]
    DecodeResponse {
        /// Document path the request targeted.
        path: String,
        /// Decoding failure.
        #[source]
        source: reqwest::Error,
    },
}

impl From<CouchStoreError> for StoreError {
    fn from(err: CouchStoreError) -> Self {
        match err {
            CouchStoreError::RequestStatus { ref path, status }
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                StoreError::PermissionDenied { path: path.clone() }
            }
            other => {
                let message = other.to_string();
                StoreError::Unavailable {
                    message,
                    source: Box::new(other),
                }
            }
        }
    }
}

//! Error types for the archive streaming service.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure in the archive pipeline. It implements
//! [`IntoResponse`] so handlers can propagate errors with `?` and still
//! produce the correct HTTP status and body.
//!
//! ## Error Cases
//! - `NotFound`: The identifier does not name an existing archive directory.
//! - `InvalidIdentifier`: The identifier is not a plain directory name
//!   (contains separators, parent references, or other path tricks).
//! - `Spawn`: The compression subprocess could not be started.
//! - `Aborted`: The transfer failed after response headers were committed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the archive streaming service.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested archive directory does not exist.
    #[error("archive {identifier} does not exist or was removed")]
    NotFound { identifier: String },

    /// The identifier is rejected before the filesystem is consulted.
    #[error("invalid archive identifier {identifier:?}")]
    InvalidIdentifier { identifier: String },

    /// The compressor executable could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The stream failed after headers were already on the wire. This can
    /// never become a status code; it travels through the body channel as
    /// the error that makes the transport truncate the download.
    #[error("archive stream aborted: {reason}")]
    Aborted { reason: String },
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            // Invalid identifiers get the same shape as missing ones: an
            // identifier that is not a plain name cannot name an archive,
            // and the body deliberately echoes nothing but the identifier.
            Self::NotFound { identifier } | Self::InvalidIdentifier { identifier } => (
                StatusCode::NOT_FOUND,
                format!("404 Archive {identifier} does not exist or was removed"),
            )
                .into_response(),
            Self::Spawn { .. } => {
                tracing::error!("{self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "500 Failed to start archive stream".to_string(),
                )
                    .into_response()
            }
            Self::Aborted { .. } => {
                // Unreachable from handlers: aborts happen inside the relay
                // task, after the response has been returned.
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
        }
    }
}

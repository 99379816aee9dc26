//! Error and Result module

use std::{io, str};

use actix_web::{http::StatusCode, ResponseError};
use derive_more::{Display, Error, From};

use crate::part::ContentKind;

/// A set of errors that can occur while encoding a form submission.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// Part name is empty or contains a line break.
    #[display("Invalid form part name: {:?}", _0)]
    InvalidName(#[error(not(source))] String),

    /// File name contains a control character, such as a line break.
    #[display("Invalid file name of part `{}`: {:?}", name, file_name)]
    InvalidFileName { name: String, file_name: String },

    /// Boundary is empty, too long, or contains characters not allowed by RFC 2046.
    #[display("Invalid multipart boundary: {:?}", _0)]
    InvalidBoundary(#[error(not(source))] String),

    /// A file or stream source could not be opened or read to completion.
    #[display("Failed to read source of part `{}`: {}", name, source)]
    Io { name: String, source: io::Error },

    /// A structured value could not be serialized.
    #[display("Failed to serialize part `{}` as JSON: {}", name, source)]
    Json {
        name: String,
        source: serde_json::Error,
    },

    /// A plain value could not be serialized as text.
    #[display("Failed to serialize part `{}` as plain text: {}", name, source)]
    Plain {
        name: String,
        source: serde_plain::Error,
    },
}

/// Return `InternalServerError` for `EncodeError`.
impl ResponseError for EncodeError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// A set of errors that can occur while parsing multipart streams or decoding form fields.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Could not find Content-Type header.
    #[display("Could not find Content-Type header")]
    ContentTypeMissing,

    /// Could not parse Content-Type header.
    #[display("Could not parse Content-Type header")]
    ContentTypeParse,

    /// Parsed Content-Type did not have "multipart" top-level media type.
    ///
    /// Also raised when a form decoder is given a `multipart/*` type other than `form-data`.
    #[display("Parsed Content-Type did not have 'multipart' top-level media type")]
    ContentTypeIncompatible,

    /// Multipart boundary is not found.
    #[display("Multipart boundary is not found")]
    BoundaryMissing,

    /// Content-Disposition header was not found or not of disposition type "form-data".
    ///
    /// According to [RFC 7578 §4.2](https://datatracker.ietf.org/doc/html/rfc7578#section-4.2) a
    /// Content-Disposition header must always be present and set to "form-data".
    #[display("Content-Disposition header was not found or not of disposition type 'form-data'")]
    ContentDispositionMissing,

    /// Content-Disposition name parameter was not found.
    #[display("Content-Disposition header had no 'name' parameter")]
    ContentDispositionNameMissing,

    /// Nested multipart is not supported.
    #[display("Nested multipart is not supported")]
    Nested,

    /// Multipart stream is incomplete.
    #[display("Multipart stream is incomplete")]
    Incomplete,

    /// Part headers could not be parsed.
    #[display("Could not parse part headers")]
    Header,

    /// Reading the payload failed.
    #[display("{}", _0)]
    #[from]
    Io(io::Error),

    /// A total, memory, or per-field size limit was exceeded.
    #[display("Size limit exceeded while reading multipart payload")]
    LimitExceeded,

    /// An error from a field reader in a form.
    #[display("An error occurred processing field `{}`: {}", name, source)]
    Field { name: String, source: FieldError },

    /// Duplicate field found (for structure that opted-in to denying duplicate fields).
    #[display("Duplicate field found: {}", _0)]
    DuplicateField(#[error(not(source))] String),

    /// Required field is missing.
    #[display("Required field is missing: {}", _0)]
    MissingField(#[error(not(source))] String),

    /// Unknown field (for structure that opted-in to denying unknown fields).
    #[display("Unknown field: {}", _0)]
    UnknownField(#[error(not(source))] String),
}

impl DecodeError {
    pub(crate) fn field(name: impl Into<String>, source: FieldError) -> Self {
        DecodeError::Field {
            name: name.into(),
            source,
        }
    }
}

/// Return `BadRequest` for `DecodeError`, apart from size and I/O failures.
impl ResponseError for DecodeError {
    fn status_code(&self) -> StatusCode {
        match self {
            DecodeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DecodeError::LimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            DecodeError::Field { source, .. } => source.status_code(),
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Errors raised while converting a single part into its declared shape.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum FieldError {
    /// UTF-8 decoding error.
    #[display("UTF-8 decoding error: {}", _0)]
    Utf8(str::Utf8Error),

    /// Plain text deserialize error.
    #[display("Plain text deserialize error: {}", _0)]
    Text(serde_plain::Error),

    /// Json deserialize error.
    #[display("Json deserialize error: {}", _0)]
    Json(serde_json::Error),

    /// Content type does not match the declared content kind.
    #[display("Content type error, expected {}", _0)]
    ContentType(#[error(not(source))] ContentKind),

    /// Field was decoded into a different shape than the one requested.
    #[display("Field was not decoded as {}", _0)]
    Shape(#[error(not(source))] &'static str),

    /// File I/O Error
    #[display("File I/O error: {}", _0)]
    FileIo(io::Error),
}

impl FieldError {
    fn status_code(&self) -> StatusCode {
        match self {
            FieldError::FileIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error() {
        let resp = DecodeError::BoundaryMissing.error_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = DecodeError::LimitExceeded.error_response();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn field_error_status() {
        let err = DecodeError::field(
            "file",
            FieldError::FileIo(io::Error::new(io::ErrorKind::Other, "disk full")),
        );
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = DecodeError::field("pojo", FieldError::ContentType(ContentKind::Json));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.to_string(),
            "An error occurred processing field `pojo`: Content type error, expected application/json",
        );
    }

    #[test]
    fn io_error_converts() {
        let err: DecodeError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, DecodeError::Io(_)));
    }
}

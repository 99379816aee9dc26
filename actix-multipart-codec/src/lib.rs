//! Schema-driven `multipart/form-data` encoding and decoding.
//!
//! The codec itself is synchronous and works on plain [`std::io::Read`] sources:
//!
//! - [`FormEncoder`] turns an ordered [`FormSubmission`] into a lazily produced body plus its
//!   `Content-Type` header.
//! - [`FormDecoder`] parses a body back into a [`DecodedForm`] according to an explicit
//!   [`FormSchema`].
//!
//! Actix Web integration lives in [`extract`] (server-side extractor), [`client`] (an `awc` based
//! sender) and [`echo`] (a set of echo endpoints exercising every source kind).
//!
//! # Examples
//!
//! ```
//! use actix_multipart_codec::{
//!     ContentKind, FieldSpec, FormDecoder, FormEncoder, FormPart, FormSchema, FormSubmission,
//! };
//!
//! let form = FormSubmission::new()
//!     .part(FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD"))
//!     .part(FormPart::text("fileName", "greeting.txt"));
//!
//! let encoded = FormEncoder::new().encode(form).unwrap();
//! let content_type = encoded.content_type().clone();
//! let body = encoded.into_bytes().unwrap();
//!
//! let schema = FormSchema::new()
//!     .field("file", FieldSpec::bytes(ContentKind::OctetStream))
//!     .field("fileName", FieldSpec::text());
//!
//! let form = FormDecoder::new(schema)
//!     .decode(&content_type, &body[..])
//!     .unwrap();
//!
//! assert_eq!(form.bytes("file").unwrap(), "HELLO WORLD");
//! assert_eq!(form.text("fileName"), Some("greeting.txt"));
//! ```

#![allow(clippy::borrow_interior_mutable_const)]

mod decoder;
mod encoder;
mod error;
mod form;
mod part;
mod payload;
mod schema;
mod server;

pub mod client;
pub mod echo;
pub mod extract;

pub use self::{
    decoder::{DecodeConfig, FormDecoder},
    encoder::{EncodedForm, FormEncoder},
    error::{DecodeError, EncodeError, FieldError},
    form::{DecodedField, DecodedForm, FieldValue, MultipartCollect, TempFile},
    part::{ChunkStream, ContentKind, FormPart, FormSubmission, PartSource},
    schema::{DuplicateField, FieldSpec, FormSchema, Limits, Multiplicity, Shape},
    server::{Field, Multipart},
};

//! Decoded forms and typed form collection.

use std::{
    io::{self, Read as _},
    vec,
};

use actix_web::web::Bytes;
use mime::Mime;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::{
    error::{DecodeError, FieldError},
    part::{ContentKind, FormPart, FormSubmission},
    schema::{FormSchema, Shape},
};

/// A field written to a temporary file on disk.
///
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct TempFile {
    /// The temporary file on disk.
    pub file: NamedTempFile,

    /// The value of the `content-type` header.
    pub content_type: Option<Mime>,

    /// The `filename` value in the `content-disposition` header.
    pub file_name: Option<String>,

    /// The size in bytes of the file.
    pub size: usize,
}

impl TempFile {
    /// Reads the whole file back into memory.
    pub fn read_to_bytes(&self) -> io::Result<Bytes> {
        let mut data = Vec::with_capacity(self.size);
        self.file.reopen()?.read_to_end(&mut data)?;
        Ok(Bytes::from(data))
    }
}

/// Decoded data of one field, in the shape its schema entry asked for.
#[derive(Debug)]
pub enum FieldValue {
    Bytes(Bytes),
    File(TempFile),
    Text(String),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn shape(&self) -> Shape {
        match self {
            FieldValue::Bytes(_) => Shape::Bytes,
            FieldValue::File(_) => Shape::File,
            FieldValue::Text(_) => Shape::Text,
            FieldValue::Json(_) => Shape::Json,
        }
    }
}

/// A single decoded part.
#[derive(Debug)]
pub struct DecodedField {
    /// Form field name.
    pub name: String,

    /// Content kind the field was declared with.
    pub kind: ContentKind,

    /// The value of the `content-type` header.
    pub content_type: Option<Mime>,

    /// The `filename` value in the `content-disposition` header.
    pub file_name: Option<String>,

    pub value: FieldValue,
}

/// The decoded parts of a form, in arrival order.
#[derive(Debug, Default)]
pub struct DecodedForm {
    fields: Vec<DecodedField>,
}

impl DecodedForm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }

    pub(crate) fn push(&mut self, field: DecodedField) {
        self.fields.push(field);
    }

    /// Drops earlier values of the field's name, then appends it.
    pub(crate) fn replace(&mut self, field: DecodedField) {
        self.fields.retain(|existing| existing.name != field.name);
        self.fields.push(field);
    }

    /// Returns all decoded fields in arrival order.
    pub fn fields(&self) -> &[DecodedField] {
        &self.fields
    }

    /// Returns the first field with the given name.
    pub fn get(&self, name: &str) -> Option<&DecodedField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Returns all fields with the given name, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DecodedField> + 'a {
        self.fields.iter().filter(move |field| field.name == name)
    }

    /// Returns the first text value with the given name.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .filter(|field| field.name == name)
            .find_map(|field| match &field.value {
                FieldValue::Text(text) => Some(text.as_str()),
                _ => None,
            })
    }

    /// Returns every text value with the given name, in arrival order.
    pub fn texts(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|field| field.name == name)
            .filter_map(|field| match &field.value {
                FieldValue::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Deserializes the first text value with the given name using `serde_plain`.
    pub fn parse_text<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, DecodeError> {
        let Some(field) = self.get(name) else {
            return Ok(None);
        };

        match &field.value {
            FieldValue::Text(text) => serde_plain::from_str(text)
                .map(Some)
                .map_err(|err| DecodeError::field(name, FieldError::Text(err))),
            _ => Err(DecodeError::field(name, FieldError::Shape(Shape::Text.as_str()))),
        }
    }

    /// Deserializes the first JSON value with the given name.
    pub fn json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, DecodeError> {
        let Some(field) = self.get(name) else {
            return Ok(None);
        };

        match &field.value {
            FieldValue::Json(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| DecodeError::field(name, FieldError::Json(err))),
            _ => Err(DecodeError::field(name, FieldError::Shape(Shape::Json.as_str()))),
        }
    }

    /// Returns the first in-memory byte value with the given name.
    pub fn bytes(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .filter(|field| field.name == name)
            .find_map(|field| match &field.value {
                FieldValue::Bytes(bytes) => Some(bytes),
                _ => None,
            })
    }

    /// Returns the first temporary file with the given name.
    pub fn file(&self, name: &str) -> Option<&TempFile> {
        self.fields
            .iter()
            .filter(|field| field.name == name)
            .find_map(|field| match &field.value {
                FieldValue::File(file) => Some(file),
                _ => None,
            })
    }

    /// Removes the first temporary file with the given name from the form, handing over ownership.
    pub fn take_file(&mut self, name: &str) -> Option<TempFile> {
        let idx = self.fields.iter().position(|field| {
            field.name == name && matches!(field.value, FieldValue::File(_))
        })?;

        match self.fields.remove(idx).value {
            FieldValue::File(file) => Some(file),
            _ => None,
        }
    }

    /// Returns the raw payload of the first field with the given name, whatever its shape.
    ///
    /// Files are read back from disk; JSON values are serialized again.
    pub fn read_bytes(&self, name: &str) -> Result<Option<Bytes>, DecodeError> {
        let Some(field) = self.get(name) else {
            return Ok(None);
        };

        let bytes = match &field.value {
            FieldValue::Bytes(bytes) => bytes.clone(),
            FieldValue::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            FieldValue::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|err| DecodeError::field(name, FieldError::Json(err)))?,
            FieldValue::File(file) => file
                .read_to_bytes()
                .map_err(|err| DecodeError::field(name, FieldError::FileIo(err)))?,
        };

        Ok(Some(bytes))
    }

    /// Expresses the decoded fields as a submission that encodes to an equivalent form.
    ///
    /// File fields borrow the decoded temporary files.
    pub fn to_submission(&self) -> FormSubmission<'_> {
        self.fields
            .iter()
            .map(|field| {
                let part = match &field.value {
                    FieldValue::Bytes(bytes) => {
                        FormPart::bytes(field.name.as_str(), field.kind, bytes.clone())
                    }
                    FieldValue::File(file) => {
                        FormPart::temp_file(field.name.as_str(), field.kind, &file.file)
                    }
                    FieldValue::Text(text) => {
                        FormPart::new(field.name.as_str(), field.kind, text.clone())
                    }
                    FieldValue::Json(value) => {
                        FormPart::new(field.name.as_str(), field.kind, value.clone())
                    }
                };

                match &field.file_name {
                    Some(file_name) => part.with_file_name(file_name.as_str()),
                    None => part,
                }
            })
            .collect()
    }

    /// Unwraps into the decoded fields.
    pub fn into_fields(self) -> Vec<DecodedField> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl IntoIterator for DecodedForm {
    type Item = DecodedField;
    type IntoIter = vec::IntoIter<DecodedField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// Types that can be collected from a `multipart/form-data` form.
///
/// Used by the [`MultipartForm`](crate::extract::MultipartForm) extractor.
///
/// ```
/// use actix_multipart_codec::{
///     ContentKind, DecodeError, DecodedForm, FieldSpec, FormSchema, MultipartCollect, TempFile,
/// };
///
/// struct Upload {
///     file: TempFile,
///     file_name: String,
/// }
///
/// impl MultipartCollect for Upload {
///     fn schema() -> FormSchema {
///         FormSchema::new()
///             .field("file", FieldSpec::file(ContentKind::OctetStream))
///             .field("fileName", FieldSpec::text())
///     }
///
///     fn from_form(mut form: DecodedForm) -> Result<Self, DecodeError> {
///         let file_name = form.text("fileName").unwrap_or_default().to_owned();
///
///         Ok(Upload {
///             file: form.take_file("file").ok_or(DecodeError::MissingField("file".into()))?,
///             file_name,
///         })
///     }
/// }
/// ```
pub trait MultipartCollect: Sized {
    /// Fields this type is collected from.
    fn schema() -> FormSchema;

    /// Converts a form decoded with [`schema`](Self::schema) into `Self`.
    fn from_form(form: DecodedForm) -> Result<Self, DecodeError>;
}

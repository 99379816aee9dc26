//! Form parts and submissions, the input side of the encoder.

use std::{fmt, io, path::PathBuf};

use actix_web::web::Bytes;
use mime::Mime;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::EncodeError;

/// Declared content kind of a part, determining its `Content-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// `application/octet-stream`; the part carries a `filename` parameter.
    OctetStream,

    /// `text/plain`.
    Text,

    /// `application/json`.
    Json,
}

impl ContentKind {
    /// Returns the media type written into the part's `Content-Type` header.
    pub fn mime(&self) -> Mime {
        match self {
            ContentKind::OctetStream => mime::APPLICATION_OCTET_STREAM,
            ContentKind::Text => mime::TEXT_PLAIN,
            ContentKind::Json => mime::APPLICATION_JSON,
        }
    }

    /// Returns true if parts of this kind are sent with a `filename` parameter.
    pub(crate) fn carries_file_name(&self) -> bool {
        matches!(self, ContentKind::OctetStream)
    }

    /// Checks whether a received part content type is acceptable for this kind.
    ///
    /// Text accepts a missing content type, which defaults to `text/plain` per
    /// [RFC 7578 §4.4](https://datatracker.ietf.org/doc/html/rfc7578#section-4.4). Octet streams
    /// accept anything.
    pub(crate) fn accepts(&self, content_type: Option<&Mime>) -> bool {
        match self {
            ContentKind::OctetStream => true,
            ContentKind::Text => content_type.map_or(true, |mime| {
                mime.subtype() == mime::PLAIN || mime.suffix() == Some(mime::PLAIN)
            }),
            ContentKind::Json => content_type.map_or(false, |mime| {
                mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON)
            }),
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.mime(), f)
    }
}

/// A finite stream of byte chunks, read sequentially and exactly once.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = io::Result<Bytes>> + 'a>;

/// Where a part's payload comes from.
pub enum PartSource<'a> {
    /// In-memory bytes.
    Bytes(Bytes),

    /// Chunks produced on demand while the body is encoded.
    Stream(ChunkStream<'a>),

    /// A caller-owned temporary file. It is reopened for reading and never deleted by the encoder.
    TempFile(&'a NamedTempFile),

    /// A file opened when its part is encoded.
    Path(PathBuf),

    /// A structured value serialized as JSON.
    Value(serde_json::Value),

    /// No payload; the part is left out of the encoded body.
    Absent,
}

impl PartSource<'_> {
    /// Returns true for [`PartSource::Absent`].
    pub fn is_absent(&self) -> bool {
        matches!(self, PartSource::Absent)
    }

    fn kind_name(&self) -> &'static str {
        match self {
            PartSource::Bytes(_) => "bytes",
            PartSource::Stream(_) => "stream",
            PartSource::TempFile(_) => "temp file",
            PartSource::Path(_) => "path",
            PartSource::Value(_) => "value",
            PartSource::Absent => "absent",
        }
    }
}

impl fmt::Debug for PartSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            PartSource::TempFile(file) => f.debug_tuple("TempFile").field(&file.path()).finish(),
            PartSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            PartSource::Value(value) => f.debug_tuple("Value").field(value).finish(),
            other => f.write_str(other.kind_name()),
        }
    }
}

impl From<Bytes> for PartSource<'_> {
    fn from(bytes: Bytes) -> Self {
        PartSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for PartSource<'_> {
    fn from(bytes: Vec<u8>) -> Self {
        PartSource::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for PartSource<'_> {
    fn from(text: String) -> Self {
        PartSource::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for PartSource<'_> {
    fn from(text: &'static str) -> Self {
        PartSource::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl<'a> From<&'a NamedTempFile> for PartSource<'a> {
    fn from(file: &'a NamedTempFile) -> Self {
        PartSource::TempFile(file)
    }
}

impl From<PathBuf> for PartSource<'_> {
    fn from(path: PathBuf) -> Self {
        PartSource::Path(path)
    }
}

impl From<serde_json::Value> for PartSource<'_> {
    fn from(value: serde_json::Value) -> Self {
        PartSource::Value(value)
    }
}

impl<'a, T> From<Option<T>> for PartSource<'a>
where
    T: Into<PartSource<'a>>,
{
    fn from(source: Option<T>) -> Self {
        source.map_or(PartSource::Absent, Into::into)
    }
}

/// A single named part of a form submission.
#[derive(Debug)]
pub struct FormPart<'a> {
    name: String,
    kind: ContentKind,
    source: PartSource<'a>,
    file_name: Option<String>,
}

impl<'a> FormPart<'a> {
    /// Constructs a part from any source.
    pub fn new(
        name: impl Into<String>,
        kind: ContentKind,
        source: impl Into<PartSource<'a>>,
    ) -> Self {
        FormPart {
            name: name.into(),
            kind,
            source: source.into(),
            file_name: None,
        }
    }

    /// Constructs a part from in-memory bytes.
    pub fn bytes(name: impl Into<String>, kind: ContentKind, bytes: impl Into<Bytes>) -> Self {
        Self::new(name, kind, PartSource::Bytes(bytes.into()))
    }

    /// Constructs a `text/plain` part.
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, ContentKind::Text, text.into())
    }

    /// Constructs a `text/plain` part from a plain value (string, number, bool, unit enum).
    pub fn plain<T: Serialize>(name: impl Into<String>, value: &T) -> Result<Self, EncodeError> {
        let name = name.into();
        match serde_plain::to_string(value) {
            Ok(text) => Ok(Self::text(name, text)),
            Err(source) => Err(EncodeError::Plain { name, source }),
        }
    }

    /// Constructs an `application/json` part from any serializable value.
    pub fn json<T: Serialize>(name: impl Into<String>, value: &T) -> Result<Self, EncodeError> {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => Ok(Self::new(name, ContentKind::Json, value)),
            Err(source) => Err(EncodeError::Json { name, source }),
        }
    }

    /// Constructs a part whose body is produced chunk by chunk.
    pub fn stream<I>(name: impl Into<String>, kind: ContentKind, chunks: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Bytes>>,
        I::IntoIter: 'a,
    {
        Self::new(name, kind, PartSource::Stream(Box::new(chunks.into_iter())))
    }

    /// Constructs a part backed by a caller-owned temporary file.
    pub fn temp_file(name: impl Into<String>, kind: ContentKind, file: &'a NamedTempFile) -> Self {
        Self::new(name, kind, PartSource::TempFile(file))
    }

    /// Constructs a part backed by a file path.
    pub fn path(name: impl Into<String>, kind: ContentKind, path: impl Into<PathBuf>) -> Self {
        Self::new(name, kind, PartSource::Path(path.into()))
    }

    /// Constructs a part with no payload. It is omitted from the encoded body.
    pub fn absent(name: impl Into<String>, kind: ContentKind) -> Self {
        Self::new(name, kind, PartSource::Absent)
    }

    /// Sets the `filename` sent with octet-stream parts.
    ///
    /// Without it the field name is used. The name of a backing file is never used.
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Returns the part's field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the part's declared content kind.
    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Returns the part's payload source.
    pub fn source(&self) -> &PartSource<'a> {
        &self.source
    }

    /// Returns the `filename` parameter the encoder will write, if any.
    pub fn file_name(&self) -> Option<&str> {
        if !self.kind.carries_file_name() {
            return None;
        }

        Some(self.file_name.as_deref().unwrap_or(&self.name))
    }

    pub(crate) fn into_source(self) -> PartSource<'a> {
        self.source
    }
}

/// An ordered sequence of form parts.
///
/// Names may repeat; each repetition is one value of a multi-valued field.
#[derive(Debug, Default)]
pub struct FormSubmission<'a> {
    parts: Vec<FormPart<'a>>,
}

impl<'a> FormSubmission<'a> {
    /// Constructs an empty submission.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a part, builder style.
    pub fn part(mut self, part: FormPart<'a>) -> Self {
        self.parts.push(part);
        self
    }

    /// Appends a part.
    pub fn push(&mut self, part: FormPart<'a>) {
        self.parts.push(part);
    }

    /// Returns the parts in submission order.
    pub fn parts(&self) -> &[FormPart<'a>] {
        &self.parts
    }

    /// Returns the number of parts, absent ones included.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Returns true if the submission has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<'a> FromIterator<FormPart<'a>> for FormSubmission<'a> {
    fn from_iter<I: IntoIterator<Item = FormPart<'a>>>(iter: I) -> Self {
        FormSubmission {
            parts: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for FormSubmission<'a> {
    type Item = FormPart<'a>;
    type IntoIter = std::vec::IntoIter<FormPart<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter()
    }
}

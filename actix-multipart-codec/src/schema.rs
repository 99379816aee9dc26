//! Form schemas: which fields a form expects and how each is decoded.

use crate::{error::DecodeError, part::ContentKind};

/// In-memory shape a field's data is decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Raw bytes held in memory.
    Bytes,

    /// Raw bytes streamed to a temporary file.
    File,

    /// UTF-8 text.
    Text,

    /// A JSON document.
    Json,
}

impl Shape {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Shape::Bytes => "bytes",
            Shape::File => "a temporary file",
            Shape::Text => "text",
            Shape::Json => "JSON",
        }
    }

    pub(crate) fn in_memory(self) -> bool {
        !matches!(self, Shape::File)
    }
}

/// How many parts of a given name a form expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Multiplicity {
    /// Exactly one part; decoding fails if none arrives.
    #[default]
    Required,

    /// At most one part.
    Optional,

    /// Any number of parts, kept in arrival order.
    Repeated,
}

/// How a second part with the name of a single-valued field is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateField {
    /// Additional fields are not processed.
    #[default]
    Ignore,

    /// An error will be raised.
    Deny,

    /// All fields will be processed, the last one will replace all previous.
    Replace,
}

/// Expected content kind, shape, and multiplicity of one named field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    kind: ContentKind,
    shape: Shape,
    multiplicity: Multiplicity,
    limit: Option<usize>,
}

impl FieldSpec {
    /// Raw bytes of the given kind, kept in memory.
    pub fn bytes(kind: ContentKind) -> Self {
        Self::new(kind, Shape::Bytes)
    }

    /// Raw bytes of the given kind, written to a temporary file.
    pub fn file(kind: ContentKind) -> Self {
        Self::new(kind, Shape::File)
    }

    /// A `text/plain` field decoded as a string.
    pub fn text() -> Self {
        Self::new(ContentKind::Text, Shape::Text)
    }

    /// An `application/json` field decoded as a JSON value.
    pub fn json() -> Self {
        Self::new(ContentKind::Json, Shape::Json)
    }

    fn new(kind: ContentKind, shape: Shape) -> Self {
        FieldSpec {
            kind,
            shape,
            multiplicity: Multiplicity::Required,
            limit: None,
        }
    }

    /// Marks the field as optional.
    pub fn optional(mut self) -> Self {
        self.multiplicity = Multiplicity::Optional;
        self
    }

    /// Marks the field as multi-valued.
    pub fn repeated(mut self) -> Self {
        self.multiplicity = Multiplicity::Repeated;
        self
    }

    /// Sets a limit in bytes for this field name.
    ///
    /// The limit is shared across all parts sharing the same name.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn multiplicity(&self) -> Multiplicity {
        self.multiplicity
    }

    pub fn field_limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Describes the fields of a `multipart/form-data` form.
///
/// ```
/// use actix_multipart_codec::{ContentKind, FieldSpec, FormSchema};
///
/// let schema = FormSchema::new()
///     .field("file", FieldSpec::file(ContentKind::OctetStream).optional())
///     .field("fileName", FieldSpec::text())
///     .field("pojo", FieldSpec::json().optional());
///
/// assert!(schema.get("fileName").is_some());
/// assert!(schema.get("other").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct FormSchema {
    fields: Vec<(String, FieldSpec)>,
    duplicate_field: DuplicateField,
    deny_unknown_fields: bool,
    validate_content_type: bool,
}

impl FormSchema {
    /// Creates an empty schema with content type validation enabled.
    pub fn new() -> Self {
        FormSchema {
            fields: Vec::new(),
            duplicate_field: DuplicateField::Ignore,
            deny_unknown_fields: false,
            validate_content_type: true,
        }
    }

    /// Adds a field. A field declared twice keeps its latest spec.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();

        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = spec,
            None => self.fields.push((name, spec)),
        }

        self
    }

    /// Sets how duplicate parts of single-valued fields are handled.
    pub fn duplicate_field(mut self, policy: DuplicateField) -> Self {
        self.duplicate_field = policy;
        self
    }

    /// Reject parts whose name has no field in this schema.
    pub fn deny_unknown_fields(mut self, deny: bool) -> Self {
        self.deny_unknown_fields = deny;
        self
    }

    /// Whether part content types are checked against their field's content kind.
    pub fn validate_content_type(mut self, validate: bool) -> Self {
        self.validate_content_type = validate;
        self
    }

    /// Returns how the named field is declared.
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find_map(|(n, spec)| (n == name).then_some(spec))
    }

    /// Iterates over fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub(crate) fn duplicate_policy(&self) -> DuplicateField {
        self.duplicate_field
    }

    pub(crate) fn denies_unknown_fields(&self) -> bool {
        self.deny_unknown_fields
    }

    pub(crate) fn validates_content_type(&self) -> bool {
        self.validate_content_type
    }
}

/// Used to keep track of the remaining limits for the form and current field.
#[derive(Debug)]
pub struct Limits {
    pub total_limit_remaining: usize,
    pub memory_limit_remaining: usize,
    pub field_limit_remaining: Option<usize>,
}

impl Limits {
    pub fn new(total_limit: usize, memory_limit: usize) -> Self {
        Self {
            total_limit_remaining: total_limit,
            memory_limit_remaining: memory_limit,
            field_limit_remaining: None,
        }
    }

    /// Called for each chunk of a field to ensure that the form limits are not exceeded.
    ///
    /// # Arguments
    ///
    /// * `bytes` - The number of bytes being read from this chunk
    /// * `in_memory` - Whether to consume from the memory limits
    pub fn try_consume_limits(&mut self, bytes: usize, in_memory: bool) -> Result<(), DecodeError> {
        self.total_limit_remaining = self
            .total_limit_remaining
            .checked_sub(bytes)
            .ok_or(DecodeError::LimitExceeded)?;

        if in_memory {
            self.memory_limit_remaining = self
                .memory_limit_remaining
                .checked_sub(bytes)
                .ok_or(DecodeError::LimitExceeded)?;
        }

        if let Some(field_limit) = self.field_limit_remaining {
            self.field_limit_remaining = Some(
                field_limit
                    .checked_sub(bytes)
                    .ok_or(DecodeError::LimitExceeded)?,
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn builders() {
        let spec = FieldSpec::text().repeated().limit(10);
        assert_eq!(spec.kind(), ContentKind::Text);
        assert_eq!(spec.shape(), Shape::Text);
        assert_eq!(spec.multiplicity(), Multiplicity::Repeated);
        assert_eq!(spec.field_limit(), Some(10));

        let spec = FieldSpec::file(ContentKind::Text);
        assert_eq!(spec.kind(), ContentKind::Text);
        assert_eq!(spec.multiplicity(), Multiplicity::Required);
    }

    #[test]
    fn redeclared_field_keeps_position() {
        let schema = FormSchema::new()
            .field("a", FieldSpec::text())
            .field("b", FieldSpec::json())
            .field("a", FieldSpec::bytes(ContentKind::OctetStream));

        let names: Vec<_> = schema.fields().map(|(name, _)| name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(schema.get("a").unwrap().shape(), Shape::Bytes);
    }

    #[test]
    fn defaults() {
        let schema = FormSchema::new();
        assert_eq!(schema.duplicate_policy(), DuplicateField::Ignore);
        assert!(!schema.denies_unknown_fields());
        assert!(schema.validates_content_type());
    }

    #[test]
    fn limits() {
        let mut limits = Limits::new(10, 4);

        limits.try_consume_limits(4, false).unwrap();
        limits.try_consume_limits(4, true).unwrap();
        assert_matches!(
            limits.try_consume_limits(1, true),
            Err(DecodeError::LimitExceeded)
        );

        let mut limits = Limits::new(10, 10);
        limits.field_limit_remaining = Some(2);
        limits.try_consume_limits(2, true).unwrap();
        assert_matches!(
            limits.try_consume_limits(1, false),
            Err(DecodeError::LimitExceeded)
        );
    }
}

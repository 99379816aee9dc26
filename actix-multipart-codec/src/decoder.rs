//! Schema-driven `multipart/form-data` decoding.

use std::{
    collections::HashMap,
    io::{Read, Write as _},
    path::PathBuf,
    str,
};

use actix_web::web::BytesMut;
use mime::Mime;
use tempfile::NamedTempFile;

use crate::{
    error::{DecodeError, FieldError},
    form::{DecodedField, DecodedForm, FieldValue, TempFile},
    schema::{DuplicateField, FieldSpec, FormSchema, Limits, Multiplicity, Shape},
    server::{Field, Multipart},
};

/// Limits and temp file location used by a [`FormDecoder`].
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub(crate) total_limit: usize,
    pub(crate) memory_limit: usize,
    pub(crate) temp_dir: Option<PathBuf>,
}

impl DecodeConfig {
    pub(crate) const DEFAULT: DecodeConfig = DecodeConfig {
        total_limit: 52_428_800, // 50 MiB
        memory_limit: 2_097_152, // 2 MiB
        temp_dir: None,
    };

    /// Sets maximum accepted payload size for the entire form. By default this limit is 50MiB.
    pub fn total_limit(mut self, total_limit: usize) -> Self {
        self.total_limit = total_limit;
        self
    }

    /// Sets maximum accepted data that will be read into memory. By default this limit is 2MiB.
    pub fn memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    /// Sets the directory that will be used to store temporary files.
    ///
    /// If this value is not set, the system default temporary directory will be used.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    fn create_tempfile(&self) -> std::io::Result<NamedTempFile> {
        match &self.temp_dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        DecodeConfig::DEFAULT
    }
}

/// Decodes `multipart/form-data` bodies into [`DecodedForm`]s according to a [`FormSchema`].
#[derive(Debug, Clone)]
pub struct FormDecoder {
    schema: FormSchema,
    config: DecodeConfig,
}

impl FormDecoder {
    /// Creates a decoder with default limits.
    pub fn new(schema: FormSchema) -> Self {
        FormDecoder {
            schema,
            config: DecodeConfig::default(),
        }
    }

    /// Replaces the decoder's limits and temp file location.
    pub fn with_config(mut self, config: DecodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(&self) -> &FormSchema {
        &self.schema
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// Decodes a body read from `reader`, framed by the boundary in `content_type`.
    ///
    /// The payload is processed incrementally; only fields decoded to an in-memory shape are
    /// buffered.
    pub fn decode<R: Read>(
        &self,
        content_type: &Mime,
        reader: R,
    ) -> Result<DecodedForm, DecodeError> {
        if content_type.type_() == mime::MULTIPART && content_type.subtype() != mime::FORM_DATA {
            // only multipart/form-data is supported
            return Err(DecodeError::ContentTypeIncompatible);
        }

        let mut multipart = Multipart::new(content_type, reader)?;

        let mut limits = Limits::new(self.config.total_limit, self.config.memory_limit);

        // ensure limits are shared for all fields with this name
        let mut field_limits = HashMap::<String, Option<usize>>::new();

        let mut form = DecodedForm::new();

        while let Some(field) = multipart.next_field()? {
            let name = field.name().to_owned();

            let Some(spec) = self.schema.get(&name) else {
                if self.schema.denies_unknown_fields() {
                    return Err(DecodeError::UnknownField(name));
                }

                log::debug!("skipping multipart field `{}` that is not part of the form", name);
                skip_field(field, &mut limits)?;
                continue;
            };

            let duplicate =
                spec.multiplicity() != Multiplicity::Repeated && form.contains(&name);

            if duplicate {
                match self.schema.duplicate_policy() {
                    DuplicateField::Ignore => {
                        log::trace!("ignoring duplicate multipart field `{}`", name);
                        skip_field(field, &mut limits)?;
                        continue;
                    }

                    DuplicateField::Deny => return Err(DecodeError::DuplicateField(name)),

                    DuplicateField::Replace => {}
                }
            }

            if self.schema.validates_content_type() && !spec.kind().accepts(field.content_type())
            {
                return Err(DecodeError::field(name, FieldError::ContentType(spec.kind())));
            }

            // retrieve the limit for this field
            let entry = field_limits
                .entry(name.clone())
                .or_insert_with(|| spec.field_limit());

            limits.field_limit_remaining.clone_from(entry);

            let decoded = self.read_field(field, spec, &mut limits)?;

            // update the stored limit
            *entry = limits.field_limit_remaining;

            if duplicate {
                form.replace(decoded);
            } else {
                form.push(decoded);
            }
        }

        for (name, spec) in self.schema.fields() {
            if spec.multiplicity() == Multiplicity::Required && !form.contains(name) {
                return Err(DecodeError::MissingField(name.to_owned()));
            }
        }

        Ok(form)
    }

    /// Decodes a fully buffered body.
    pub fn decode_bytes(
        &self,
        content_type: &Mime,
        body: &[u8],
    ) -> Result<DecodedForm, DecodeError> {
        self.decode(content_type, body)
    }

    fn read_field<R: Read>(
        &self,
        mut field: Field<'_, R>,
        spec: &FieldSpec,
        limits: &mut Limits,
    ) -> Result<DecodedField, DecodeError> {
        let name = field.name().to_owned();
        let content_type = field.content_type().cloned();
        let file_name = field.file_name().map(ToOwned::to_owned);

        let value = match spec.shape() {
            Shape::File => {
                let file = self.read_file(&name, &mut field, limits)?;

                FieldValue::File(TempFile {
                    file: file.0,
                    content_type: content_type.clone(),
                    file_name: file_name.clone(),
                    size: file.1,
                })
            }

            shape => {
                let mut data = BytesMut::new();

                while let Some(chunk) = field.chunk()? {
                    limits.try_consume_limits(chunk.len(), shape.in_memory())?;
                    data.extend_from_slice(&chunk);
                }

                let data = data.freeze();

                match shape {
                    Shape::Text => {
                        let text = str::from_utf8(&data)
                            .map_err(|err| DecodeError::field(&name, FieldError::Utf8(err)))?;
                        FieldValue::Text(text.to_owned())
                    }

                    Shape::Json => {
                        let value = serde_json::from_slice(&data)
                            .map_err(|err| DecodeError::field(&name, FieldError::Json(err)))?;
                        FieldValue::Json(value)
                    }

                    _ => FieldValue::Bytes(data),
                }
            }
        };

        Ok(DecodedField {
            name,
            kind: spec.kind(),
            content_type,
            file_name,
            value,
        })
    }

    fn read_file<R: Read>(
        &self,
        name: &str,
        field: &mut Field<'_, R>,
        limits: &mut Limits,
    ) -> Result<(NamedTempFile, usize), DecodeError> {
        let file_io = |err| DecodeError::field(name, FieldError::FileIo(err));

        let mut file = self.config.create_tempfile().map_err(file_io)?;
        let mut size = 0;

        while let Some(chunk) = field.chunk()? {
            limits.try_consume_limits(chunk.len(), false)?;
            size += chunk.len();
            file.write_all(&chunk).map_err(file_io)?;
        }

        file.flush().map_err(file_io)?;

        Ok((file, size))
    }
}

/// Drains a field that is not kept, charging its bytes to the total limit only.
fn skip_field<R: Read>(mut field: Field<'_, R>, limits: &mut Limits) -> Result<(), DecodeError> {
    while let Some(chunk) = field.chunk()? {
        limits.total_limit_remaining = limits
            .total_limit_remaining
            .checked_sub(chunk.len())
            .ok_or(DecodeError::LimitExceeded)?;
    }

    Ok(())
}

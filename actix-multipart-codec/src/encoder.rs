//! Multipart form encoding.

use std::{
    fmt, fs,
    io::{self, Read as _},
    vec,
};

use actix_web::web::{BufMut as _, Bytes, BytesMut};
use mime::Mime;
use rand::distr::{Alphanumeric, SampleString as _};

use crate::{
    error::EncodeError,
    part::{ChunkStream, FormPart, FormSubmission, PartSource},
};

const CRLF: &[u8] = b"\r\n";
const CRLF_CRLF: &[u8] = b"\r\n\r\n";
const HYPHENS: &[u8] = b"--";
const BOUNDARY_PREFIX: &str = "------------------------";

/// Size of the chunks read from file sources.
const FILE_CHUNK_SIZE: usize = 8 * 1024;

/// Encodes [`FormSubmission`]s as `multipart/form-data` bodies.
///
/// Each part is written as:
///
/// ```plain
/// --<boundary>
/// Content-Disposition: form-data; name="<field>"[; filename="<name>"]
/// Content-Type: <media-type>
///
/// <body>
/// ```
///
/// followed by `--<boundary>--` after the last part. Parts with an absent source are omitted.
#[derive(Debug, Clone)]
pub struct FormEncoder {
    boundary: String,
    content_type: Mime,
}

impl FormEncoder {
    /// Constructs an encoder using a random alphanumeric boundary.
    pub fn new() -> Self {
        let boundary = Alphanumeric.sample_string(&mut rand::rng(), 32);

        Self::with_boundary([BOUNDARY_PREFIX, &boundary].concat())
            .expect("generated boundary should be valid")
    }

    /// Constructs an encoder with a fixed boundary.
    ///
    /// Boundaries must be 1 to 70 characters of the RFC 2046 `bchars` set, excluding space.
    pub fn with_boundary(boundary: impl Into<String>) -> Result<Self, EncodeError> {
        let boundary = boundary.into();

        let valid = (1..=70).contains(&boundary.len())
            && boundary
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"'()+_,-./:=?".contains(&b));

        let content_type = valid
            .then(|| format!("multipart/form-data; boundary=\"{boundary}\"").parse::<Mime>())
            .and_then(Result::ok)
            .ok_or_else(|| EncodeError::InvalidBoundary(boundary.clone()))?;

        Ok(FormEncoder {
            boundary,
            content_type,
        })
    }

    /// Returns the boundary, without the leading hyphens.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Returns the `multipart/form-data` media type, including the boundary parameter.
    pub fn content_type(&self) -> &Mime {
        &self.content_type
    }

    /// Starts encoding a submission.
    ///
    /// Part names are validated up front. Sources are only opened and read as the returned
    /// [`EncodedForm`] is iterated.
    pub fn encode<'a>(&self, form: FormSubmission<'a>) -> Result<EncodedForm<'a>, EncodeError> {
        for part in form.parts() {
            validate_name(part.name())?;

            if let Some(file_name) = part.file_name() {
                validate_file_name(part.name(), file_name)?;
            }
        }

        Ok(EncodedForm {
            boundary: self.boundary.clone(),
            content_type: self.content_type.clone(),
            parts: form.into_iter(),
            body: None,
            finished: false,
        })
    }

    /// Encodes a submission into a single buffer.
    pub fn encode_to_bytes(&self, form: FormSubmission<'_>) -> Result<Bytes, EncodeError> {
        self.encode(form)?.into_bytes()
    }
}

impl Default for FormEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> Result<(), EncodeError> {
    if name.is_empty() || name.contains(['\r', '\n']) {
        return Err(EncodeError::InvalidName(name.to_owned()));
    }

    Ok(())
}

fn validate_file_name(name: &str, file_name: &str) -> Result<(), EncodeError> {
    if file_name.chars().any(char::is_control) {
        return Err(EncodeError::InvalidFileName {
            name: name.to_owned(),
            file_name: file_name.to_owned(),
        });
    }

    Ok(())
}

/// Escapes a Content-Disposition parameter value for use inside a quoted-string.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);

    quoted.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');

    quoted
}

/// A form being encoded.
///
/// Iterating yields the body in chunks: one chunk of headers per part, then the part's payload as
/// it is read from its source. Iteration stops after the first error.
pub struct EncodedForm<'a> {
    boundary: String,
    content_type: Mime,
    parts: vec::IntoIter<FormPart<'a>>,

    /// Payload of the part currently being written, with its field name.
    body: Option<(String, PartBody<'a>)>,

    finished: bool,
}

enum PartBody<'a> {
    Once(Option<Bytes>),
    Stream(ChunkStream<'a>),
    File(fs::File),
}

impl PartBody<'_> {
    fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        match self {
            PartBody::Once(bytes) => bytes.take().map(Ok),
            PartBody::Stream(chunks) => chunks.next(),
            PartBody::File(file) => read_file_chunk(file).transpose(),
        }
    }
}

fn read_file_chunk(file: &mut fs::File) -> io::Result<Option<Bytes>> {
    let mut buf = vec![0; FILE_CHUNK_SIZE];

    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                buf.truncate(n);
                return Ok(Some(Bytes::from(buf)));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

impl<'a> EncodedForm<'a> {
    /// Returns the `Content-Type` header value to send with this body.
    pub fn content_type(&self) -> &Mime {
        &self.content_type
    }

    /// Reads all sources and collects the complete body.
    pub fn into_bytes(self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(1_024);

        for chunk in self {
            buf.put(chunk?);
        }

        Ok(buf.freeze())
    }

    /// Writes the headers of `part` and prepares its payload.
    ///
    /// Returns `Ok(None)` for absent parts, which are skipped.
    fn start_part(&mut self, part: FormPart<'a>) -> Result<Option<Bytes>, EncodeError> {
        let name = part.name().to_owned();

        let mut head = BytesMut::with_capacity(128);
        head.put(HYPHENS);
        head.put(self.boundary.as_bytes());
        head.put(CRLF);
        head.put(format!("Content-Disposition: form-data; name={}", quote(&name)).as_bytes());
        if let Some(file_name) = part.file_name() {
            head.put(format!("; filename={}", quote(file_name)).as_bytes());
        }
        head.put(CRLF);
        head.put(format!("Content-Type: {}", part.kind().mime()).as_bytes());
        head.put(CRLF_CRLF);

        let body = match part.into_source() {
            PartSource::Absent => {
                log::trace!("omitting part `{name}` with absent source");
                return Ok(None);
            }

            PartSource::Bytes(bytes) => PartBody::Once(Some(bytes)),

            PartSource::Value(value) => match serde_json::to_vec(&value) {
                Ok(json) => PartBody::Once(Some(Bytes::from(json))),
                Err(source) => return Err(EncodeError::Json { name, source }),
            },

            PartSource::Stream(chunks) => PartBody::Stream(chunks),

            PartSource::TempFile(file) => match file.reopen() {
                Ok(file) => PartBody::File(file),
                Err(source) => return Err(EncodeError::Io { name, source }),
            },

            PartSource::Path(path) => match fs::File::open(&path) {
                Ok(file) => PartBody::File(file),
                Err(source) => return Err(EncodeError::Io { name, source }),
            },
        };

        self.body = Some((name, body));

        Ok(Some(head.freeze()))
    }

    fn closing_boundary(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.boundary.len() + 6);
        buf.put(HYPHENS);
        buf.put(self.boundary.as_bytes());
        buf.put(HYPHENS);
        buf.put(CRLF);
        buf.freeze()
    }

    fn fail(&mut self) {
        self.body = None;
        self.parts = Vec::new().into_iter();
        self.finished = true;
    }
}

impl Iterator for EncodedForm<'_> {
    type Item = Result<Bytes, EncodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((name, body)) = &mut self.body {
                match body.next_chunk() {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,

                    Some(Ok(chunk)) => return Some(Ok(chunk)),

                    Some(Err(source)) => {
                        let name = name.clone();
                        self.fail();
                        return Some(Err(EncodeError::Io { name, source }));
                    }

                    // part payload is exhausted, terminate it before the next boundary
                    None => {
                        self.body = None;
                        return Some(Ok(Bytes::from_static(CRLF)));
                    }
                }
            }

            if self.finished {
                return None;
            }

            match self.parts.next() {
                Some(part) => match self.start_part(part) {
                    Ok(Some(head)) => return Some(Ok(head)),
                    Ok(None) => continue,
                    Err(err) => {
                        self.fail();
                        return Some(Err(err));
                    }
                },

                None => {
                    self.finished = true;
                    return Some(Ok(self.closing_boundary()));
                }
            }
        }
    }
}

impl fmt::Debug for EncodedForm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedForm")
            .field("content_type", &self.content_type)
            .field("remaining_parts", &self.parts.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use assert_matches::assert_matches;
    use futures_util::stream;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::part::ContentKind;

    fn encoder() -> FormEncoder {
        FormEncoder::with_boundary("qWeRtYuIoP").unwrap()
    }

    fn hello_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"HELLO WORLD").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn wire_format() {
        let form = FormSubmission::new()
            .part(
                FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD")
                    .with_file_name("greeting.txt"),
            )
            .part(FormPart::text("fileName", "greeting.txt"))
            .part(FormPart::json("pojo", &serde_json::json!({ "name": "some-name" })).unwrap());

        let body = encoder().encode_to_bytes(form).unwrap();

        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            "--qWeRtYuIoP\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"greeting.txt\"\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n\
            HELLO WORLD\r\n\
            --qWeRtYuIoP\r\n\
            Content-Disposition: form-data; name=\"fileName\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            greeting.txt\r\n\
            --qWeRtYuIoP\r\n\
            Content-Disposition: form-data; name=\"pojo\"\r\n\
            Content-Type: application/json\r\n\
            \r\n\
            {\"name\":\"some-name\"}\r\n\
            --qWeRtYuIoP--\r\n",
        );
    }

    #[test]
    fn content_type_carries_boundary() {
        let encoder = FormEncoder::new();
        assert!(encoder.boundary().starts_with(BOUNDARY_PREFIX));
        assert_eq!(encoder.boundary().len(), BOUNDARY_PREFIX.len() + 32);

        let ct = encoder.content_type();
        assert_eq!(ct.type_(), mime::MULTIPART);
        assert_eq!(ct.subtype(), mime::FORM_DATA);
        assert_eq!(
            ct.get_param(mime::BOUNDARY).unwrap().as_str(),
            encoder.boundary()
        );
    }

    #[test]
    fn invalid_boundary() {
        assert_matches!(
            FormEncoder::with_boundary(""),
            Err(EncodeError::InvalidBoundary(_))
        );
        assert_matches!(
            FormEncoder::with_boundary("has\"quote"),
            Err(EncodeError::InvalidBoundary(_))
        );
        assert_matches!(
            FormEncoder::with_boundary("x".repeat(71)),
            Err(EncodeError::InvalidBoundary(_))
        );
    }

    #[test]
    fn absent_parts_are_omitted() {
        let missing: Option<Bytes> = None;

        let form = FormSubmission::new()
            .part(FormPart::new("file", ContentKind::OctetStream, missing))
            .part(FormPart::text("fileName", "greeting.txt"));

        let body = encoder().encode_to_bytes(form).unwrap();

        assert!(memchr::memmem::find(&body, b"name=\"file\"").is_none());
        assert!(memchr::memmem::find(&body, b"name=\"fileName\"").is_some());
    }

    #[test]
    fn only_absent_parts() {
        let form = FormSubmission::new().part(FormPart::absent("file", ContentKind::OctetStream));

        let body = encoder().encode_to_bytes(form).unwrap();
        assert_eq!(body, "--qWeRtYuIoP--\r\n");
    }

    #[test]
    fn every_source_kind_yields_same_payload() {
        let file = hello_file();

        let sources: Vec<PartSource<'_>> = vec![
            PartSource::Bytes(Bytes::from_static(b"HELLO WORLD")),
            PartSource::Stream(Box::new(
                b"HELLO WORLD"
                    .iter()
                    .map(|b| Ok::<_, io::Error>(Bytes::copy_from_slice(&[*b]))),
            )),
            PartSource::TempFile(&file),
            PartSource::Path(file.path().to_owned()),
        ];

        let expected = encoder()
            .encode_to_bytes(FormSubmission::new().part(FormPart::bytes(
                "file",
                ContentKind::OctetStream,
                "HELLO WORLD",
            )))
            .unwrap();

        for source in sources {
            let debug = format!("{source:?}");
            let form = FormSubmission::new().part(FormPart::new(
                "file",
                ContentKind::OctetStream,
                source,
            ));

            let body = encoder().encode_to_bytes(form).unwrap();
            assert_eq!(body, expected, "source {debug} encoded differently");
        }
    }

    #[test]
    fn file_name_never_comes_from_file() {
        let file = hello_file();

        let form = FormSubmission::new().part(FormPart::temp_file(
            "file",
            ContentKind::OctetStream,
            &file,
        ));
        let body = encoder().encode_to_bytes(form).unwrap();
        assert!(memchr::memmem::find(&body, b"filename=\"file\"").is_some());

        let form = FormSubmission::new().part(FormPart::temp_file("file", ContentKind::Text, &file));
        let body = encoder().encode_to_bytes(form).unwrap();
        assert!(memchr::memmem::find(&body, b"filename").is_none());
    }

    #[test]
    fn caller_file_survives_encoding() {
        let file = hello_file();

        let form = FormSubmission::new().part(FormPart::temp_file(
            "file",
            ContentKind::OctetStream,
            &file,
        ));
        encoder().encode_to_bytes(form).unwrap();

        assert!(file.path().exists());
    }

    #[test]
    fn quotes_are_escaped() {
        let form = FormSubmission::new().part(
            FormPart::bytes("file", ContentKind::OctetStream, "x").with_file_name("a\"b\\c.txt"),
        );

        let body = encoder().encode_to_bytes(form).unwrap();
        assert!(memchr::memmem::find(&body, br#"filename="a\"b\\c.txt""#).is_some());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let form = FormSubmission::new().part(FormPart::text("", "value"));
        assert_matches!(encoder().encode(form), Err(EncodeError::InvalidName(_)));

        let form = FormSubmission::new().part(FormPart::text("a\r\nb", "value"));
        assert_matches!(encoder().encode(form), Err(EncodeError::InvalidName(_)));
    }

    #[test]
    fn file_names_cannot_inject_headers() {
        let part = FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD")
            .with_file_name("x.txt\r\nContent-Type: text/html");
        let form = FormSubmission::new().part(part);

        assert_matches!(
            encoder().encode(form),
            Err(EncodeError::InvalidFileName { name, .. }) if name == "file"
        );

        let part = FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD")
            .with_file_name("tab\tname.txt");
        assert_matches!(
            encoder().encode(FormSubmission::new().part(part)),
            Err(EncodeError::InvalidFileName { .. })
        );

        let part = FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD")
            .with_file_name("grüße \"quoted\".txt");
        let body = encoder().encode_to_bytes(FormSubmission::new().part(part)).unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("filename=\"grüße \\\"quoted\\\".txt\"\r\n"), "{body}");
    }

    #[test]
    fn missing_path_fails_with_io_error() {
        let form = FormSubmission::new().part(FormPart::path(
            "file",
            ContentKind::OctetStream,
            "/definitely/not/here.bin",
        ));

        let err = encoder().encode_to_bytes(form).unwrap_err();
        assert_matches!(err, EncodeError::Io { name, .. } if name == "file");
    }

    #[test]
    fn stream_error_stops_encoding() {
        let chunks = vec![
            Ok(Bytes::from_static(b"HELLO")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "producer went away")),
        ];

        let form = FormSubmission::new()
            .part(FormPart::stream("file", ContentKind::OctetStream, chunks))
            .part(FormPart::text("fileName", "greeting.txt"));

        let mut encoded = encoder().encode(form).unwrap();

        assert!(encoded.next().unwrap().is_ok()); // headers
        assert_eq!(encoded.next().unwrap().unwrap(), "HELLO");
        assert_matches!(encoded.next(), Some(Err(EncodeError::Io { .. })));
        assert!(encoded.next().is_none());
    }

    #[test]
    fn stream_is_read_lazily() {
        use std::cell::Cell;

        let pulled = Cell::new(0);
        let chunks = (0..3).map(|_| {
            pulled.set(pulled.get() + 1);
            Ok(Bytes::from_static(b"ab"))
        });

        let form =
            FormSubmission::new().part(FormPart::stream("file", ContentKind::OctetStream, chunks));
        let mut encoded = encoder().encode(form).unwrap();
        assert_eq!(pulled.get(), 0);

        encoded.next().unwrap().unwrap(); // headers
        assert_eq!(pulled.get(), 0);

        encoded.next().unwrap().unwrap();
        assert_eq!(pulled.get(), 1);
    }

    /// Test using an external library to prevent the two-wrongs-make-a-right class of errors.
    #[actix_rt::test]
    async fn ecosystem_compat() {
        let encoder = FormEncoder::new();
        let boundary = encoder.boundary().to_owned();

        let form = FormSubmission::new()
            .part(
                FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD")
                    .with_file_name("greeting.txt"),
            )
            .part(FormPart::text("number", "12342"));
        let body = encoder.encode_to_bytes(form).unwrap();

        let body = stream::once(async { Ok::<_, std::convert::Infallible>(body) });
        let mut form = multer::Multipart::new(body, boundary);

        let field = form.next_field().await.unwrap().unwrap();
        assert_eq!(field.name().unwrap(), "file");
        assert_eq!(field.file_name(), Some("greeting.txt"));
        assert_eq!(field.content_type(), Some(&mime::APPLICATION_OCTET_STREAM));
        assert_eq!(field.bytes().await.unwrap(), "HELLO WORLD");

        let field = form.next_field().await.unwrap().unwrap();
        assert_eq!(field.name().unwrap(), "number");
        assert_eq!(field.file_name(), None);
        assert_eq!(field.text().await.unwrap(), "12342");

        assert!(form.next_field().await.unwrap().is_none());
    }
}

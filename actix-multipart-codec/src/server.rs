//! Multipart payload parsing.

use std::{fmt, io::Read};

use actix_web::{
    http::header::{self, ContentDisposition, DispositionType, HeaderMap, HeaderName, HeaderValue},
    web::{Bytes, BytesMut},
};
use mime::Mime;

use crate::{error::DecodeError, payload::PayloadBuffer};

const MAX_HEADERS: usize = 32;

const BOUNDARY_MARKER: &[u8] = b"--";
const LINE_BREAK: &[u8] = b"\r\n";

/// Synchronous, single-pass reader of `multipart/*` payloads.
///
/// Fields are handed out one at a time by [`next_field`](Self::next_field). A field borrows the
/// reader, so the previous field is always released before the next one is parsed; any of its
/// data left unread is skipped.
pub struct Multipart<R> {
    payload: PayloadBuffer<R>,

    /// Field boundary (without "--" prefix).
    boundary: String,

    /// `\r\n--<boundary>`, the sequence terminating every field's data.
    delimiter: Vec<u8>,

    /// True for `multipart/form-data`, where every field must be named.
    form_data: bool,

    state: State,

    /// Body state of the field last handed out, until its data is exhausted.
    field: Option<InnerField>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum State {
    /// Skip data until first boundary.
    FirstBoundary,

    /// Reading boundary.
    Boundary,

    /// Reading Headers.
    Headers,

    /// Stream EOF.
    Eof,
}

struct InnerField {
    /// Field data's stated size according to its Content-Length header.
    length: Option<u64>,

    /// True once the field data has been read up to the delimiter.
    eof: bool,
}

enum Progress {
    Chunk(Bytes),
    End,
    More,
}

impl<R: Read> Multipart<R> {
    /// Creates a multipart reader from the request's Content-Type and payload.
    pub fn new(content_type: &Mime, reader: R) -> Result<Self, DecodeError> {
        if content_type.type_() != mime::MULTIPART {
            return Err(DecodeError::ContentTypeIncompatible);
        }

        let boundary = content_type
            .get_param(mime::BOUNDARY)
            .ok_or(DecodeError::BoundaryMissing)?
            .as_str()
            .to_owned();

        let form_data = content_type.subtype() == mime::FORM_DATA;

        Ok(Self::with_boundary(boundary, form_data, reader))
    }

    /// Creates a multipart reader from a header map, finding Content-Type and boundary.
    pub fn from_headers(headers: &HeaderMap, reader: R) -> Result<Self, DecodeError> {
        let content_type = find_content_type(headers)?;
        Self::new(&content_type, reader)
    }

    fn with_boundary(boundary: String, form_data: bool, reader: R) -> Self {
        let delimiter = [LINE_BREAK, BOUNDARY_MARKER, boundary.as_bytes()].concat();

        Multipart {
            payload: PayloadBuffer::new(reader),
            boundary,
            delimiter,
            form_data,
            state: State::FirstBoundary,
            field: None,
        }
    }

    /// Returns the next field, or `None` after the final boundary.
    pub fn next_field(&mut self) -> Result<Option<Field<'_, R>>, DecodeError> {
        // release field; unread data of the previous field is discarded
        while self.field.is_some() {
            self.read_chunk()?;
        }

        match self.state {
            State::Eof => return Ok(None),

            // read until first boundary
            State::FirstBoundary => {
                if self.skip_until_boundary()? {
                    self.state = State::Eof;
                    return Ok(None);
                }
            }

            // read boundary
            State::Boundary => {
                if self.read_boundary()? {
                    self.state = State::Eof;
                    return Ok(None);
                }
            }

            State::Headers => {}
        }

        self.state = State::Headers;
        let headers = self.read_field_headers()?;
        self.state = State::Boundary;

        let content_disposition = headers
            .get(&header::CONTENT_DISPOSITION)
            .and_then(|cd| ContentDisposition::from_raw(cd).ok())
            .filter(|cd| matches!(cd.disposition, DispositionType::FormData));

        let name = if self.form_data {
            // According to RFC 7578 §4.2, which relates to "multipart/form-data" requests
            // specifically, fields must have a Content-Disposition header, its disposition
            // type must be set as "form-data", and it must have a name parameter.

            let Some(cd) = &content_disposition else {
                return Err(DecodeError::ContentDispositionMissing);
            };

            let Some(name) = cd.get_name() else {
                return Err(DecodeError::ContentDispositionNameMissing);
            };

            name.to_owned()
        } else {
            String::new()
        };

        let content_type: Option<Mime> = headers
            .get(&header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .and_then(|ct| ct.parse().ok());

        // nested multipart stream is not supported
        if let Some(mime) = &content_type {
            if mime.type_() == mime::MULTIPART {
                return Err(DecodeError::Nested);
            }
        }

        let length = match headers.get(&header::CONTENT_LENGTH) {
            Some(len) => Some(
                len.to_str()
                    .ok()
                    .and_then(|len| len.parse::<u64>().ok())
                    .ok_or(DecodeError::Header)?,
            ),
            None => None,
        };

        self.field = Some(InnerField { length, eof: false });

        Ok(Some(Field {
            multipart: self,
            name,
            content_type,
            content_disposition,
            headers,
        }))
    }

    /// Skips the preamble up to and including the first boundary line.
    ///
    /// Returns true if the first boundary is also the final one.
    fn skip_until_boundary(&mut self) -> Result<bool, DecodeError> {
        loop {
            let line = self.payload.read_until_filled(b"\n")?;

            if let Some(eof) = self.match_boundary(&line) {
                return Ok(eof);
            }
        }
    }

    /// Reads a field boundary from the payload buffer (and discards it).
    ///
    /// Reads "in-between" and "final" boundaries. E.g. for boundary = "foo":
    ///
    /// ```plain
    /// --foo    <-- in-between fields
    /// --foo--  <-- end of request body, should be followed by EOF
    /// ```
    ///
    /// Returns true if the final boundary was read.
    fn read_boundary(&mut self) -> Result<bool, DecodeError> {
        let line = self.payload.readline_or_eof_filled()?;

        if line.is_empty() && self.payload.eof {
            // final boundary was never sent
            return Err(DecodeError::Incomplete);
        }

        self.match_boundary(&line).ok_or(DecodeError::BoundaryMissing)
    }

    /// Checks whether `line` is a boundary line.
    ///
    /// Returns `Some(false)` for an in-between boundary, `Some(true)` for the final boundary, and
    /// `None` if the line is not a boundary at all.
    fn match_boundary(&self, line: &[u8]) -> Option<bool> {
        let boundary = self.boundary.as_bytes();
        let boundary_len = boundary.len();

        if line.len() < boundary_len + 2
            || !line.starts_with(BOUNDARY_MARKER)
            || &line[2..boundary_len + 2] != boundary
        {
            return None;
        }

        let rest = &line[boundary_len + 2..];

        // boundary is followed by line-break, indicating more fields to come
        if rest == LINE_BREAK {
            return Some(false);
        }

        // final boundary, may be followed by a line-break or the end of the payload
        if rest.starts_with(BOUNDARY_MARKER) {
            let tail = &rest[2..];
            if tail.is_empty() || tail == LINE_BREAK {
                return Some(true);
            }
        }

        None
    }

    fn read_field_headers(&mut self) -> Result<HeaderMap, DecodeError> {
        let bytes = self.payload.read_until_filled(b"\r\n\r\n")?;

        let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];

        match httparse::parse_headers(&bytes, &mut hdrs).map_err(|_| DecodeError::Header)? {
            httparse::Status::Complete((_, hdrs)) => {
                // convert headers
                let mut headers = HeaderMap::with_capacity(hdrs.len());

                for h in hdrs {
                    let name = HeaderName::try_from(h.name).map_err(|_| DecodeError::Header)?;
                    let value =
                        HeaderValue::try_from(h.value).map_err(|_| DecodeError::Header)?;
                    headers.append(name, value);
                }

                Ok(headers)
            }

            httparse::Status::Partial => Err(DecodeError::Header),
        }
    }

    /// Reads the next chunk of the current field's data.
    ///
    /// Returns `Ok(None)` once the field is exhausted; the line-break ending the field is consumed
    /// so that the payload is positioned at the next boundary.
    fn read_chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let Some(field) = self.field.as_mut() else {
            return Ok(None);
        };

        while !field.eof {
            let progress = match field.length.as_mut() {
                Some(len) => read_len(&mut self.payload, len)?,
                None => read_stream(&mut self.payload, &self.delimiter)?,
            };

            match progress {
                Progress::Chunk(bytes) => return Ok(Some(bytes)),
                Progress::End => field.eof = true,
                Progress::More => self.payload.fill()?,
            }
        }

        let line = self.payload.read_until_filled(b"\n")?;
        if line.as_ref() != LINE_BREAK {
            log::warn!("multipart field did not read all the data or it is malformed");
        }

        self.field = None;

        Ok(None)
    }
}

/// Reads body part content chunk of the specified size.
///
/// The body part must have a `Content-Length` header with proper value.
fn read_len<R: Read>(
    payload: &mut PayloadBuffer<R>,
    size: &mut u64,
) -> Result<Progress, DecodeError> {
    if *size == 0 {
        return Ok(Progress::End);
    }

    match payload.read_max(*size)? {
        Some(chunk) => {
            *size -= chunk.len() as u64;
            Ok(Progress::Chunk(chunk))
        }
        None => Ok(Progress::More),
    }
}

/// Reads content chunk of body part with unknown length.
///
/// Data is handed out up to the delimiter. A tail that could be the start of the delimiter is
/// held back until more data arrives.
fn read_stream<R: Read>(
    payload: &mut PayloadBuffer<R>,
    delimiter: &[u8],
) -> Result<Progress, DecodeError> {
    if payload.buf.is_empty() {
        return if payload.eof {
            Err(DecodeError::Incomplete)
        } else {
            Ok(Progress::More)
        };
    }

    match memchr::memmem::find(&payload.buf, delimiter) {
        // found boundary
        Some(0) => Ok(Progress::End),

        Some(idx) => Ok(Progress::Chunk(payload.buf.split_to(idx).freeze())),

        None if payload.eof => Err(DecodeError::Incomplete),

        None => {
            let keep = delimiter.len() - 1;
            let len = payload.buf.len();

            if len > keep {
                Ok(Progress::Chunk(payload.buf.split_to(len - keep).freeze()))
            } else {
                Ok(Progress::More)
            }
        }
    }
}

/// Extract Content-Type from headers.
pub(crate) fn find_content_type(headers: &HeaderMap) -> Result<Mime, DecodeError> {
    headers
        .get(&header::CONTENT_TYPE)
        .ok_or(DecodeError::ContentTypeMissing)?
        .to_str()
        .ok()
        .and_then(|content_type| content_type.parse::<Mime>().ok())
        .ok_or(DecodeError::ContentTypeParse)
}

impl<R> fmt::Debug for Multipart<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multipart")
            .field("boundary", &self.boundary)
            .field("form_data", &self.form_data)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A single field in a multipart stream.
pub struct Field<'m, R> {
    multipart: &'m mut Multipart<R>,

    /// Form field name.
    ///
    /// Will be an empty string in non-form contexts.
    // INVARIANT: always non-empty when request content-type is multipart/form-data.
    name: String,

    content_type: Option<Mime>,
    content_disposition: Option<ContentDisposition>,
    headers: HeaderMap,
}

impl<R: Read> Field<'_, R> {
    /// Returns the field's name.
    ///
    /// Always present for `multipart/form-data`; empty for other multipart types.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a reference to the field's header map.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a reference to the field's content (mime) type, if it is supplied by the client.
    ///
    /// According to [RFC 7578](https://www.rfc-editor.org/rfc/rfc7578#section-4.4), if it is not
    /// present, it should default to "text/plain".
    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// Returns this field's parsed Content-Disposition header, if set.
    pub fn content_disposition(&self) -> Option<&ContentDisposition> {
        self.content_disposition.as_ref()
    }

    /// Returns the `filename` parameter of the Content-Disposition header, if set.
    pub fn file_name(&self) -> Option<&str> {
        self.content_disposition()?.get_filename()
    }

    /// Reads the next chunk of field data, or `None` when the field is exhausted.
    pub fn chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        self.multipart.read_chunk()
    }

    /// Collects the raw field data, up to `limit` bytes.
    ///
    /// If the data would exceed `limit`, [`DecodeError::LimitExceeded`] is returned.
    pub fn bytes(&mut self, limit: usize) -> Result<Bytes, DecodeError> {
        let mut buf = BytesMut::new();

        while let Some(chunk) = self.chunk()? {
            if buf.len() + chunk.len() > limit {
                return Err(DecodeError::LimitExceeded);
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(buf.freeze())
    }
}

impl<R: Read> Iterator for Field<'_, R> {
    type Item = Result<Bytes, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunk().transpose()
    }
}

impl<R> fmt::Debug for Field<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ct) = &self.content_type {
            writeln!(f, "\nField: {}", ct)?;
        } else {
            writeln!(f, "\nField:")?;
        }
        writeln!(f, "  name: {}", self.name)?;
        writeln!(f, "  boundary: {}", self.multipart.boundary)?;
        writeln!(f, "  headers:")?;
        for (key, val) in self.headers.iter() {
            writeln!(f, "    {:?}: {:?}", key, val)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::payload::Trickle;

    const BOUNDARY: &str = "abbc761f78ff4d7cb7573b5a23f96ef0";

    fn form_data() -> Mime {
        format!("multipart/form-data; boundary=\"{BOUNDARY}\"")
            .parse()
            .unwrap()
    }

    fn create_simple_request() -> Bytes {
        Bytes::from(
            "testasdadsad\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"fn.txt\"\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: 4\r\n\r\n\
             test\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"fn.txt\"\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             data\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0--\r\n",
        )
    }

    #[test]
    fn test_boundary() {
        let headers = HeaderMap::new();
        assert_matches!(
            Multipart::from_headers(&headers, &b""[..]),
            Err(DecodeError::ContentTypeMissing)
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("test"));
        assert_matches!(
            Multipart::from_headers(&headers, &b""[..]),
            Err(DecodeError::ContentTypeParse)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/mixed"),
        );
        assert_matches!(
            Multipart::from_headers(&headers, &b""[..]),
            Err(DecodeError::BoundaryMissing)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; boundary=\"5c02368e880e436dab70ed54e1c58209\""),
        );
        assert_matches!(
            Multipart::from_headers(&headers, &b""[..]),
            Err(DecodeError::ContentTypeIncompatible)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(
                "multipart/mixed; boundary=\"5c02368e880e436dab70ed54e1c58209\"",
            ),
        );
        let multipart = Multipart::from_headers(&headers, &b""[..]).unwrap();
        assert_eq!(multipart.boundary, "5c02368e880e436dab70ed54e1c58209");
        assert!(!multipart.form_data);
    }

    type Collected = Vec<(String, Option<String>, Bytes)>;

    fn read_all_fields<R: Read>(mut multipart: Multipart<R>) -> Collected {
        let mut fields = Vec::new();

        while let Some(mut field) = multipart.next_field().unwrap() {
            let name = field.name().to_owned();
            let file_name = field.file_name().map(ToOwned::to_owned);
            let data = field.bytes(usize::MAX).unwrap();
            fields.push((name, file_name, data));
        }

        fields
    }

    #[test]
    fn test_multipart() {
        let body = create_simple_request();
        let mut multipart = Multipart::new(&form_data(), &body[..]).unwrap();

        let mut field = multipart.next_field().unwrap().unwrap();
        assert_eq!(field.name(), "file");
        assert_eq!(field.file_name(), Some("fn.txt"));
        assert_eq!(field.content_type().unwrap().type_(), mime::TEXT);
        assert_eq!(field.content_type().unwrap().subtype(), mime::PLAIN);
        assert_eq!(field.chunk().unwrap().unwrap(), "test");
        assert!(field.chunk().unwrap().is_none());

        let mut field = multipart.next_field().unwrap().unwrap();
        assert_eq!(field.bytes(usize::MAX).unwrap(), "data");

        assert!(multipart.next_field().unwrap().is_none());
        assert!(multipart.next_field().unwrap().is_none());
    }

    #[test]
    fn test_multipart_one_byte_at_a_time() {
        let body = create_simple_request();

        for step in [1, 2, 3, 7, 64] {
            let multipart = Multipart::new(&form_data(), Trickle::new(&body, step)).unwrap();
            let fields = read_all_fields(multipart);

            assert_eq!(fields.len(), 2, "step {step}");
            assert_eq!(fields[0].2, "test", "step {step}");
            assert_eq!(fields[1].2, "data", "step {step}");
        }
    }

    #[test]
    fn unread_field_is_skipped() {
        let body = create_simple_request();
        let mut multipart = Multipart::new(&form_data(), Trickle::new(&body, 5)).unwrap();

        let field = multipart.next_field().unwrap().unwrap();
        assert_eq!(field.name(), "file");
        drop(field);

        let mut field = multipart.next_field().unwrap().unwrap();
        assert_eq!(field.bytes(usize::MAX).unwrap(), "data");
    }

    #[test]
    fn data_resembling_boundary() {
        let body = Bytes::from(
            "--abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"file\"\r\n\
             \r\n\
             line one\r\n--abbc761f78ff\r\n-- not a boundary\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0--\r\n",
        );

        for step in [1, 4, 100] {
            let multipart = Multipart::new(&form_data(), Trickle::new(&body, step)).unwrap();
            let fields = read_all_fields(multipart);
            assert_eq!(
                fields[0].2,
                "line one\r\n--abbc761f78ff\r\n-- not a boundary",
                "step {step}"
            );
        }
    }

    #[test]
    fn empty_form() {
        let body = format!("--{BOUNDARY}--\r\n");
        let fields = read_all_fields(Multipart::new(&form_data(), body.as_bytes()).unwrap());
        assert!(fields.is_empty());
    }

    #[test]
    fn final_boundary_without_line_break() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"number\"\r\n\
             \r\n\
             12342\r\n\
             --{BOUNDARY}--"
        );

        let fields = read_all_fields(Multipart::new(&form_data(), body.as_bytes()).unwrap());
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, "number");
        assert_eq!(fields[0].2, "12342");
    }

    #[test]
    fn incomplete_stream() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"\r\n\
             \r\n\
             truncated da"
        );

        let mut multipart = Multipart::new(&form_data(), body.as_bytes()).unwrap();
        let mut field = multipart.next_field().unwrap().unwrap();
        assert_matches!(field.bytes(usize::MAX), Err(DecodeError::Incomplete));
    }

    #[test]
    fn missing_final_boundary() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"\r\n\
             \r\n\
             data\r\n\
             --{BOUNDARY}\r\n"
        );

        let mut multipart = Multipart::new(&form_data(), body.as_bytes()).unwrap();
        multipart.next_field().unwrap().unwrap();
        assert_matches!(multipart.next_field(), Err(DecodeError::Incomplete));
    }

    #[test]
    fn no_content_disposition() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             data\r\n\
             --{BOUNDARY}--\r\n"
        );

        let mut multipart = Multipart::new(&form_data(), body.as_bytes()).unwrap();
        assert_matches!(
            multipart.next_field(),
            Err(DecodeError::ContentDispositionMissing)
        );
    }

    #[test]
    fn no_name_in_form_data() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; filename=\"fn.txt\"\r\n\
             \r\n\
             data\r\n\
             --{BOUNDARY}--\r\n"
        );

        let mut multipart = Multipart::new(&form_data(), body.as_bytes()).unwrap();
        assert_matches!(
            multipart.next_field(),
            Err(DecodeError::ContentDispositionNameMissing)
        );
    }

    #[test]
    fn name_not_required_outside_form_data() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             data\r\n\
             --{BOUNDARY}--\r\n"
        );

        let ct = format!("multipart/mixed; boundary=\"{BOUNDARY}\"").parse().unwrap();
        let fields = read_all_fields(Multipart::new(&ct, body.as_bytes()).unwrap());
        assert_eq!(fields[0].0, "");
        assert_eq!(fields[0].2, "data");
    }

    #[test]
    fn nested_multipart_is_rejected() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"files\"\r\n\
             Content-Type: multipart/mixed; boundary=inner\r\n\
             \r\n\
             --inner--\r\n\
             --{BOUNDARY}--\r\n"
        );

        let mut multipart = Multipart::new(&form_data(), body.as_bytes()).unwrap();
        assert_matches!(multipart.next_field(), Err(DecodeError::Nested));
    }

    #[test]
    fn garbage_instead_of_boundary() {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"\r\n\
             Content-Length: 4\r\n\
             \r\n\
             data\r\n\
             garbage\r\n"
        );

        let mut multipart = Multipart::new(&form_data(), body.as_bytes()).unwrap();
        let mut field = multipart.next_field().unwrap().unwrap();
        assert_eq!(field.bytes(usize::MAX).unwrap(), "data");
        assert_matches!(multipart.next_field(), Err(DecodeError::BoundaryMissing));
    }

    #[test]
    fn bytes_limited() {
        let body = create_simple_request();
        let mut multipart = Multipart::new(&form_data(), &body[..]).unwrap();

        let mut field = multipart.next_field().unwrap().unwrap();
        assert_matches!(field.bytes(2), Err(DecodeError::LimitExceeded));

        // next field still readable
        let mut field = multipart.next_field().unwrap().unwrap();
        assert_eq!(field.bytes(usize::MAX).unwrap(), "data");
    }
}

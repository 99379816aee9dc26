//! Sending forms with `awc`.

use std::{io, path::PathBuf};

use actix_web::{
    error::PayloadError,
    http::{header, StatusCode},
    web::{self, Bytes},
    ResponseError,
};
use awc::{error::SendRequestError, ClientResponse};
use derive_more::{Display, Error, From};
use futures_core::Stream;

use crate::{
    decoder::FormDecoder,
    encoder::FormEncoder,
    error::{DecodeError, EncodeError},
    form::DecodedForm,
    part::FormSubmission,
    server::find_content_type,
};

/// Maximum size of a plain response body read by [`MultipartClient`].
const RESPONSE_LIMIT: usize = 2_097_152; // 2 MiB

/// Errors that can occur while sending a form or reading its response.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The form could not be encoded.
    #[display("{}", _0)]
    #[from]
    Encode(EncodeError),

    /// The request could not be sent.
    #[display("Failed to send request: {}", _0)]
    #[from]
    Send(SendRequestError),

    /// The response body could not be read.
    #[display("Failed to read response body: {}", _0)]
    #[from]
    Payload(PayloadError),

    /// The server answered with a non-success status.
    #[display("Unexpected response status {}: {}", status, body)]
    Status { status: StatusCode, body: String },

    /// A multipart response could not be decoded.
    #[display("{}", _0)]
    #[from]
    Decode(DecodeError),

    /// A file to be sent could not be read.
    #[display("{}", _0)]
    #[from]
    Io(io::Error),
}

/// Return `BadGateway` for `ClientError`, passing through non-success statuses of the server.
impl ResponseError for ClientError {
    fn status_code(&self) -> StatusCode {
        match self {
            ClientError::Encode(_) | ClientError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClientError::Status { status, .. } => *status,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Sends forms to, and fetches forms from, a single base URL.
///
/// Non-success responses are never retried; they are returned as [`ClientError::Status`].
///
/// ```no_run
/// use actix_multipart_codec::{client::MultipartClient, ContentKind, FormPart, FormSubmission};
///
/// # async fn send() -> Result<(), actix_multipart_codec::client::ClientError> {
/// let client = MultipartClient::new("http://127.0.0.1:8080");
///
/// let form = FormSubmission::new()
///     .part(FormPart::bytes("file", ContentKind::OctetStream, "HELLO WORLD"))
///     .part(FormPart::text("fileName", "greeting.txt"));
///
/// let res = client.send_form("/echo/binary", form).await?;
/// assert_eq!(res, "fileOk:true,nameOk:true");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MultipartClient {
    base_url: String,
    client: awc::Client,
}

impl MultipartClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, awc::Client::default())
    }

    pub fn with_client(base_url: impl Into<String>, client: awc::Client) -> Self {
        let mut base_url = base_url.into();

        while base_url.ends_with('/') {
            base_url.pop();
        }

        MultipartClient { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POSTs `form` as `multipart/form-data` and returns the response body as text.
    ///
    /// Sources are read and the body encoded before the request is sent. This happens on the
    /// calling task, so sources backed by files or streams block the worker while they are read.
    /// Stream sources need not be `Send`, which rules out moving the encoding to the blocking
    /// pool; prefer [`send_file`](Self::send_file) for large files.
    pub async fn send_form(
        &self,
        path: &str,
        form: FormSubmission<'_>,
    ) -> Result<String, ClientError> {
        let encoded = FormEncoder::new().encode(form)?;
        let content_type = encoded.content_type().to_string();
        let body = encoded.into_bytes()?;

        let url = self.url(path);
        log::debug!("sending {} byte multipart form to {}", body.len(), url);

        let mut res = self
            .client
            .post(url)
            .insert_header((header::CONTENT_TYPE, content_type))
            .send_body(body)
            .await?;

        read_text(&mut res).await
    }

    /// POSTs the contents of the file at `file` as `application/octet-stream`.
    pub async fn send_file(
        &self,
        path: &str,
        file: impl Into<PathBuf>,
    ) -> Result<String, ClientError> {
        let file = file.into();

        let body = web::block(move || std::fs::read(file))
            .await
            .map_err(io::Error::other)??;

        let mut res = self
            .client
            .post(self.url(path))
            .insert_header((header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.to_string()))
            .send_body(body)
            .await?;

        read_text(&mut res).await
    }

    /// GETs a `multipart/form-data` response and decodes it with `decoder`.
    pub async fn fetch_form(
        &self,
        path: &str,
        decoder: &FormDecoder,
    ) -> Result<DecodedForm, ClientError> {
        let mut res = self.client.get(self.url(path)).send().await?;

        if !res.status().is_success() {
            return Err(status_error(&mut res).await);
        }

        let content_type = find_content_type(res.headers())?;
        let body = res.body().limit(decoder.config().total_limit).await?;

        log::debug!("decoding {} byte multipart response", body.len());

        Ok(decoder.decode_bytes(&content_type, &body)?)
    }
}

async fn read_text<S>(res: &mut ClientResponse<S>) -> Result<String, ClientError>
where
    S: Stream<Item = Result<Bytes, PayloadError>> + Unpin,
{
    if !res.status().is_success() {
        return Err(status_error(res).await);
    }

    let body = res.body().limit(RESPONSE_LIMIT).await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

async fn status_error<S>(res: &mut ClientResponse<S>) -> ClientError
where
    S: Stream<Item = Result<Bytes, PayloadError>> + Unpin,
{
    let status = res.status();

    let body = match res.body().limit(RESPONSE_LIMIT).await {
        Ok(body) => String::from_utf8_lossy(&body).into_owned(),
        Err(err) => {
            log::warn!("could not read body of {} response: {}", status, err);
            String::new()
        }
    };

    ClientError::Status { status, body }
}

//! Echo endpoints exercising every kind of form part source.
//!
//! [`configure_echo`] registers endpoints that decode submitted forms and report whether each
//! field arrived intact. [`configure_client`] registers endpoints that build forms from every
//! source kind and send them to the echo endpoints of the server configured in
//! [`EchoClientConfig`].
//!
//! ```no_run
//! use actix_multipart_codec::echo;
//! use actix_web::{App, HttpServer};
//!
//! # async fn run() -> std::io::Result<()> {
//! HttpServer::new(|| {
//!     App::new()
//!         .app_data(echo::EchoClientConfig::new("http://127.0.0.1:8080"))
//!         .configure(echo::configure_echo)
//!         .configure(echo::configure_client)
//! })
//! .bind(("127.0.0.1", 8080))?
//! .run()
//! .await
//! # }
//! ```

use std::{borrow::Cow, io, io::Write as _, str};

use actix_web::{
    error, http::header, web, web::Bytes, Error, HttpRequest, HttpResponse, Responder,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    client::{ClientError, MultipartClient},
    encoder::FormEncoder,
    error::{DecodeError, EncodeError},
    extract::MultipartForm,
    form::{DecodedForm, MultipartCollect, TempFile},
    part::{ContentKind, FormPart, FormSubmission},
    schema::{FieldSpec, FormSchema},
};

pub const HELLO_WORLD: &str = "HELLO WORLD";
pub const GREETING_TXT: &str = "greeting.txt";
pub const NUMBER: u32 = 12342;

/// Structured part sent alongside a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pojo {
    pub name: String,
    pub value: String,
}

impl Pojo {
    fn sample() -> Self {
        Pojo {
            name: "some-name".to_owned(),
            value: "some-value".to_owned(),
        }
    }
}

/// A binary file and its name. Both fields may be omitted.
#[derive(Debug)]
pub struct BinaryFileForm {
    pub file: Option<TempFile>,
    pub file_name: Option<String>,
}

impl MultipartCollect for BinaryFileForm {
    fn schema() -> FormSchema {
        FormSchema::new()
            .field("file", FieldSpec::file(ContentKind::OctetStream).optional())
            .field("fileName", FieldSpec::text().optional())
    }

    fn from_form(mut form: DecodedForm) -> Result<Self, DecodeError> {
        Ok(BinaryFileForm {
            file_name: form.text("fileName").map(ToOwned::to_owned),
            file: form.take_file("file"),
        })
    }
}

/// A text file and one or more numbers.
#[derive(Debug)]
pub struct TextFileForm {
    pub file: TempFile,
    pub number: Vec<String>,
}

impl MultipartCollect for TextFileForm {
    fn schema() -> FormSchema {
        FormSchema::new()
            .field("file", FieldSpec::file(ContentKind::Text))
            .field("number", FieldSpec::text().repeated())
    }

    fn from_form(mut form: DecodedForm) -> Result<Self, DecodeError> {
        let number = form.texts("number").into_iter().map(ToOwned::to_owned).collect();

        Ok(TextFileForm {
            file: take_required_file(&mut form, "file")?,
            number,
        })
    }
}

/// A binary file, its name, and an optional structured part.
#[derive(Debug)]
pub struct BinaryFileWithPojoForm {
    pub file: TempFile,
    pub file_name: Option<String>,
    pub pojo: Option<Pojo>,
}

impl MultipartCollect for BinaryFileWithPojoForm {
    fn schema() -> FormSchema {
        FormSchema::new()
            .field("file", FieldSpec::file(ContentKind::OctetStream))
            .field("fileName", FieldSpec::text().optional())
            .field("pojo", FieldSpec::json().optional())
    }

    fn from_form(mut form: DecodedForm) -> Result<Self, DecodeError> {
        Ok(BinaryFileWithPojoForm {
            pojo: form.json("pojo")?,
            file_name: form.text("fileName").map(ToOwned::to_owned),
            file: take_required_file(&mut form, "file")?,
        })
    }
}

fn take_required_file(form: &mut DecodedForm, name: &str) -> Result<TempFile, DecodeError> {
    form.take_file(name)
        .ok_or_else(|| DecodeError::MissingField(name.to_owned()))
}

/// Returns true if the uploaded file holds exactly [`HELLO_WORLD`].
fn contains_hello_world(file: &TempFile) -> bool {
    match file.read_to_bytes() {
        Ok(data) => data == HELLO_WORLD,
        Err(err) => {
            log::error!(
                "failed to read contents of uploaded file {}: {}",
                file.file.path().display(),
                err
            );
            false
        }
    }
}

/// Registers the echo endpoints.
pub fn configure_echo(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/echo/octet-stream").route(web::post().to(echo_octet_stream)))
        .service(web::resource("/echo/binary").route(web::post().to(echo_binary)))
        .service(web::resource("/echo/text").route(web::post().to(echo_text)))
        .service(web::resource("/echo/with-pojo").route(web::post().to(echo_with_pojo)))
        .service(web::resource("/produces/multipart").route(web::get().to(produce_multipart)));
}

async fn echo_octet_stream(body: Bytes) -> Result<String, Error> {
    let text = str::from_utf8(&body).map_err(error::ErrorBadRequest)?;
    Ok(text.to_owned())
}

async fn echo_binary(form: MultipartForm<BinaryFileForm>) -> impl Responder {
    let file_ok = match &form.file {
        Some(file) => contains_hello_world(file).to_string(),
        None => "null".to_owned(),
    };

    let name_ok = form.file_name.as_deref() == Some(GREETING_TXT);

    format!("fileOk:{file_ok},nameOk:{name_ok}")
}

async fn echo_text(form: MultipartForm<TextFileForm>) -> impl Responder {
    let file_ok = contains_hello_world(&form.file);

    let number_ok = form
        .number
        .first()
        .and_then(|number| number.parse::<u32>().ok())
        == Some(NUMBER);

    format!("fileOk:{file_ok},numberOk:{number_ok}")
}

async fn echo_with_pojo(form: MultipartForm<BinaryFileWithPojoForm>) -> impl Responder {
    let file_ok = contains_hello_world(&form.file);
    let name_ok = form.file_name.as_deref() == Some(GREETING_TXT);

    let pojo_ok = match &form.pojo {
        Some(pojo) => (*pojo == Pojo::sample()).to_string(),
        None => "null".to_owned(),
    };

    format!("fileOk:{file_ok},nameOk:{name_ok},pojoOk:{pojo_ok}")
}

/// Responds with a form holding a text file of [`HELLO_WORLD`] and the number [`NUMBER`].
async fn produce_multipart() -> Result<HttpResponse, Error> {
    let (content_type, body) = web::block(|| -> Result<_, EncodeError> {
        let file = hello_world_file().map_err(|source| EncodeError::Io {
            name: "file".to_owned(),
            source,
        })?;

        let form = FormSubmission::new()
            .part(FormPart::temp_file("file", ContentKind::Text, &file))
            .part(FormPart::plain("number", &NUMBER)?);

        let encoder = FormEncoder::new();
        let body = encoder.encode_to_bytes(form)?;

        Ok((encoder.content_type().to_string(), body))
    })
    .await??;

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, content_type))
        .body(body))
}

fn hello_world_file() -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(HELLO_WORLD.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Location of the echo endpoints targeted by [`configure_client`] endpoints.
///
/// Add to your app data to have it picked up; defaults to `http://127.0.0.1:8080`.
#[derive(Debug, Clone)]
pub struct EchoClientConfig {
    base_url: Cow<'static, str>,
}

impl EchoClientConfig {
    pub fn new(base_url: impl Into<Cow<'static, str>>) -> Self {
        EchoClientConfig {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Extracts config from app data. Check both `T` and `Data<T>`, in that order, and fall
    /// back to the default config.
    fn from_req(req: &HttpRequest) -> &Self {
        req.app_data::<Self>()
            .or_else(|| req.app_data::<web::Data<Self>>().map(|d| d.as_ref()))
            .unwrap_or(&DEFAULT_CONFIG)
    }

    fn client(req: &HttpRequest) -> MultipartClient {
        MultipartClient::new(Self::from_req(req).base_url())
    }
}

const DEFAULT_CONFIG: EchoClientConfig = EchoClientConfig {
    base_url: Cow::Borrowed("http://127.0.0.1:8080"),
};

impl Default for EchoClientConfig {
    fn default() -> Self {
        DEFAULT_CONFIG
    }
}

#[derive(Debug, Deserialize)]
struct NullFileQuery {
    #[serde(default, rename = "nullFile")]
    null_file: bool,
}

#[derive(Debug, Deserialize)]
struct WithPojoQuery {
    #[serde(default = "default_with_pojo", rename = "withPojo")]
    with_pojo: bool,
}

fn default_with_pojo() -> bool {
    true
}

/// Registers endpoints that send forms to the echo endpoints.
pub fn configure_client(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/client/octet-stream").route(web::get().to(send_octet_stream)))
        .service(
            web::resource("/client/byte-array-as-binary-file-with-pojo")
                .route(web::get().to(send_byte_array_with_pojo)),
        )
        .service(
            web::resource("/client/byte-array-as-binary-file")
                .route(web::get().to(send_byte_array_as_binary)),
        )
        .service(
            web::resource("/client/multi-byte-as-binary-file")
                .route(web::get().to(send_multi_byte_as_binary)),
        )
        .service(
            web::resource("/client/buffer-as-binary-file")
                .route(web::get().to(send_buffer_as_binary)),
        )
        .service(
            web::resource("/client/file-as-binary-file").route(web::get().to(send_file_as_binary)),
        )
        .service(
            web::resource("/client/path-as-binary-file").route(web::get().to(send_path_as_binary)),
        )
        .service(
            web::resource("/client/byte-array-as-text-file")
                .route(web::get().to(send_byte_array_as_text)),
        )
        .service(
            web::resource("/client/buffer-as-text-file").route(web::get().to(send_buffer_as_text)),
        )
        .service(web::resource("/client/file-as-text-file").route(web::get().to(send_file_as_text)))
        .service(web::resource("/client/path-as-text-file").route(web::get().to(send_path_as_text)));
}

async fn send_octet_stream(req: HttpRequest) -> Result<String, ClientError> {
    let file = web::block(|| {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"test")?;
        Ok::<_, io::Error>(file)
    })
    .await
    .map_err(io::Error::other)??;

    EchoClientConfig::client(&req)
        .send_file("/echo/octet-stream", file.path())
        .await
}

async fn send_byte_array_with_pojo(
    req: HttpRequest,
    query: web::Query<WithPojoQuery>,
) -> Result<String, ClientError> {
    let pojo = if query.with_pojo {
        FormPart::json("pojo", &Pojo::sample())?
    } else {
        FormPart::absent("pojo", ContentKind::Json)
    };

    let form = FormSubmission::new()
        .part(FormPart::bytes(
            "file",
            ContentKind::OctetStream,
            HELLO_WORLD.as_bytes().to_vec(),
        ))
        .part(FormPart::text("fileName", GREETING_TXT))
        .part(pojo);

    match EchoClientConfig::client(&req)
        .send_form("/echo/with-pojo", form)
        .await
    {
        Err(ClientError::Status { status, body }) => {
            Ok(format!("Error: {} statusCode {}", body, status.as_u16()))
        }
        res => res,
    }
}

/// Sends `file` with the greeting file name to the binary echo endpoint.
async fn send_binary(req: &HttpRequest, file: FormPart<'_>) -> Result<String, ClientError> {
    let form = FormSubmission::new()
        .part(file)
        .part(FormPart::text("fileName", GREETING_TXT));

    EchoClientConfig::client(req)
        .send_form("/echo/binary", form)
        .await
}

/// Sends `file` with [`NUMBER`] to the text echo endpoint.
async fn send_text(req: &HttpRequest, file: FormPart<'_>) -> Result<String, ClientError> {
    let form = FormSubmission::new()
        .part(file)
        .part(FormPart::plain("number", &NUMBER)?);

    EchoClientConfig::client(req).send_form("/echo/text", form).await
}

async fn send_byte_array_as_binary(
    req: HttpRequest,
    query: web::Query<NullFileQuery>,
) -> Result<String, ClientError> {
    let data = (!query.null_file).then(|| HELLO_WORLD.as_bytes().to_vec());
    send_binary(&req, FormPart::new("file", ContentKind::OctetStream, data)).await
}

async fn send_multi_byte_as_binary(
    req: HttpRequest,
    query: web::Query<NullFileQuery>,
) -> Result<String, ClientError> {
    let file = if query.null_file {
        FormPart::absent("file", ContentKind::OctetStream)
    } else {
        let bytes = HELLO_WORLD
            .bytes()
            .map(|byte| Ok(Bytes::copy_from_slice(&[byte])));

        FormPart::stream("file", ContentKind::OctetStream, bytes)
    };

    send_binary(&req, file).await
}

async fn send_buffer_as_binary(
    req: HttpRequest,
    query: web::Query<NullFileQuery>,
) -> Result<String, ClientError> {
    let data = (!query.null_file).then(|| Bytes::from_static(HELLO_WORLD.as_bytes()));
    send_binary(&req, FormPart::new("file", ContentKind::OctetStream, data)).await
}

async fn send_file_as_binary(
    req: HttpRequest,
    query: web::Query<NullFileQuery>,
) -> Result<String, ClientError> {
    if query.null_file {
        return send_binary(&req, FormPart::absent("file", ContentKind::OctetStream)).await;
    }

    let file = hello_world_file()?;
    send_binary(&req, FormPart::temp_file("file", ContentKind::OctetStream, &file)).await
}

async fn send_path_as_binary(
    req: HttpRequest,
    query: web::Query<NullFileQuery>,
) -> Result<String, ClientError> {
    if query.null_file {
        return send_binary(&req, FormPart::absent("file", ContentKind::OctetStream)).await;
    }

    let file = hello_world_file()?;
    send_binary(&req, FormPart::path("file", ContentKind::OctetStream, file.path())).await
}

async fn send_byte_array_as_text(req: HttpRequest) -> Result<String, ClientError> {
    let file = FormPart::bytes("file", ContentKind::Text, HELLO_WORLD.as_bytes().to_vec());
    send_text(&req, file).await
}

async fn send_buffer_as_text(req: HttpRequest) -> Result<String, ClientError> {
    let data = Bytes::from_static(HELLO_WORLD.as_bytes());
    let file = FormPart::bytes("file", ContentKind::Text, data);
    send_text(&req, file).await
}

async fn send_file_as_text(req: HttpRequest) -> Result<String, ClientError> {
    let file = hello_world_file()?;
    send_text(&req, FormPart::temp_file("file", ContentKind::Text, &file)).await
}

async fn send_path_as_text(req: HttpRequest) -> Result<String, ClientError> {
    let file = hello_world_file()?;
    send_text(&req, FormPart::path("file", ContentKind::Text, file.path())).await
}

//! Typed `multipart/form-data` extractor for Actix Web.

use std::{io, path::PathBuf, sync::Arc};

use actix_web::{
    dev,
    error::PayloadError,
    web::{self, BytesMut},
    Error, FromRequest, HttpRequest,
};
use derive_more::{Deref, DerefMut};
use futures_core::future::LocalBoxFuture;
use futures_util::{future::ready, StreamExt as _};

use crate::{
    decoder::{DecodeConfig, FormDecoder},
    error::DecodeError,
    form::MultipartCollect,
    server::find_content_type,
};

/// Typed `multipart/form-data` extractor.
///
/// To extract typed data from a multipart stream, the inner type `T` must implement the
/// [`MultipartCollect`] trait.
///
/// Note that this extractor rejects requests with any other Content-Type such as `multipart/mixed`,
/// `multipart/related`, or non-multipart media types.
///
/// The payload is collected up to the configured total limit and then decoded on the blocking
/// thread pool. Add a [`MultipartFormConfig`] to your app data to configure extraction.
#[derive(Deref, DerefMut)]
pub struct MultipartForm<T: MultipartCollect>(pub T);

impl<T: MultipartCollect> MultipartForm<T> {
    /// Unwrap into inner `T` value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> FromRequest for MultipartForm<T>
where
    T: MultipartCollect + 'static,
{
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, payload: &mut dev::Payload) -> Self::Future {
        let config = MultipartFormConfig::from_req(req);
        let err_handler = config.err_handler.clone();
        let req = req.clone();

        let content_type = match find_content_type(req.headers()) {
            Ok(ct) if ct.type_() == mime::MULTIPART && ct.subtype() == mime::FORM_DATA => ct,

            // this extractor only supports multipart/form-data
            Ok(_) => {
                let err = map_error(&err_handler, DecodeError::ContentTypeIncompatible, &req);
                return Box::pin(ready(Err(err)));
            }

            Err(err) => return Box::pin(ready(Err(map_error(&err_handler, err, &req)))),
        };

        let total_limit = config.total_limit;
        let decoder = FormDecoder::new(T::schema()).with_config(config.decode_config());
        let mut payload = payload.take();

        Box::pin(async move {
            let res = async {
                let mut body = BytesMut::new();

                while let Some(chunk) = payload.next().await {
                    let chunk = chunk.map_err(payload_error)?;

                    if body.len() + chunk.len() > total_limit {
                        return Err(DecodeError::LimitExceeded);
                    }

                    body.extend_from_slice(&chunk);
                }

                let body = body.freeze();

                let form = web::block(move || decoder.decode_bytes(&content_type, &body))
                    .await
                    .map_err(|err| DecodeError::Io(io::Error::other(err)))??;

                log::trace!("decoded multipart form with {} fields", form.len());

                T::from_form(form)
            }
            .await;

            res.map(MultipartForm)
                .map_err(|err| map_error(&err_handler, err, &req))
        })
    }
}

fn payload_error(err: PayloadError) -> DecodeError {
    match err {
        PayloadError::Overflow => DecodeError::LimitExceeded,
        PayloadError::Incomplete(_) => DecodeError::Incomplete,
        err => DecodeError::Io(io::Error::other(err)),
    }
}

fn map_error(
    err_handler: &MultipartFormErrorHandler,
    err: DecodeError,
    req: &HttpRequest,
) -> Error {
    match err_handler {
        Some(handler) => (*handler)(err, req),
        None => err.into(),
    }
}

type MultipartFormErrorHandler =
    Option<Arc<dyn Fn(DecodeError, &HttpRequest) -> Error + Send + Sync>>;

/// [`struct@MultipartForm`] extractor configuration.
///
/// Add to your app data to have it picked up by [`struct@MultipartForm`] extractors.
#[derive(Clone)]
pub struct MultipartFormConfig {
    total_limit: usize,
    memory_limit: usize,
    directory: Option<PathBuf>,
    err_handler: MultipartFormErrorHandler,
}

impl MultipartFormConfig {
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
    /// If this value is not present, the system default temporary directory will be used.
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Sets custom error handler.
    pub fn error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(DecodeError, &HttpRequest) -> Error + Send + Sync + 'static,
    {
        self.err_handler = Some(Arc::new(f));
        self
    }

    /// Extracts payload config from app data. Check both `T` and `Data<T>`, in that order, and fall
    /// back to the default payload config.
    fn from_req(req: &HttpRequest) -> &Self {
        req.app_data::<Self>()
            .or_else(|| req.app_data::<web::Data<Self>>().map(|d| d.as_ref()))
            .unwrap_or(&DEFAULT_CONFIG)
    }

    fn decode_config(&self) -> DecodeConfig {
        let config = DecodeConfig::default()
            .total_limit(self.total_limit)
            .memory_limit(self.memory_limit);

        match &self.directory {
            Some(dir) => config.temp_dir(dir),
            None => config,
        }
    }
}

const DEFAULT_CONFIG: MultipartFormConfig = MultipartFormConfig {
    total_limit: 52_428_800, // 50 MiB
    memory_limit: 2_097_152, // 2 MiB
    directory: None,
    err_handler: None,
};

impl Default for MultipartFormConfig {
    fn default() -> Self {
        DEFAULT_CONFIG
    }
}

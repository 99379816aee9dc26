//! Runs the echo and client endpoints on one server.
//!
//! The client endpoints send their forms back to this same server, so e.g.
//! `curl 'http://127.0.0.1:8080/client/path-as-binary-file'` round-trips a form through both.

use actix_multipart_codec::echo::{self, EchoClientConfig};
use actix_web::{middleware::Logger, App, HttpServer};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let bind = std::env::var("ECHO_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());
    let base_url = format!("http://{bind}");

    log::info!("starting HTTP server at {base_url}");

    HttpServer::new(move || {
        App::new()
            .app_data(EchoClientConfig::new(base_url.clone()))
            .configure(echo::configure_echo)
            .configure(echo::configure_client)
            .wrap(Logger::default())
    })
    .workers(2)
    .bind(&bind)?
    .run()
    .await
}

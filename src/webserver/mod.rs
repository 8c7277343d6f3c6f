use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{default_registry, Encoder, TextEncoder};
use std::net::SocketAddr;
use tokio::runtime::Runtime;

use crate::errors::SlotLogError;

/// Env var overriding the port `/metrics` is served on.
pub const PORT_ENV_VAR: &str = "LEDGERLOG_METRICS_PORT";

fn port() -> Result<u16, SlotLogError> {
    match std::env::var(PORT_ENV_VAR) {
        Ok(var) => var
            .parse()
            .map_err(|err| SlotLogError::Config(format!("Unable to parse {PORT_ENV_VAR}: {err}"))),
        Err(_) => Ok(3030),
    }
}

/// Serve the Prometheus text exposition of the default registry on
/// `/metrics`. Call [`crate::metrics::initialize_metrics`] first or
/// there will be nothing to scrape.
pub async fn run_webserver() -> Result<(), SlotLogError> {
    let app = Router::new().route("/metrics", get(get_metrics));

    let port = port()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting metrics server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            SlotLogError::Config(format!(
                "Unable to create local webserver at port {port}: {err}"
            ))
        })
}

/// Start a small tokio runtime running [`run_webserver`].
/// Keep a reference to the runtime for as long as you need it running.
pub fn start_server_runtime() -> Result<Runtime, SlotLogError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("webserver-threads")
        .enable_all()
        .build()
        .map_err(|err| {
            SlotLogError::Config(format!("error initializing tokio runtime for webserver: {err}"))
        })?;
    rt.spawn(async {
        if let Err(err) = run_webserver().await {
            tracing::error!("{err}");
        }
    });
    Ok(rt)
}

async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&default_registry().gather(), &mut body) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[tokio::test]
async fn metrics_are_served_as_text() {
    let resp: axum::response::Response = get_metrics().await.into_response();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

use futures::future;
use hyper::{header, Body, Request, Response, StatusCode};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, instrument};

#[instrument(skip(registry))]
pub async fn serve(addr: SocketAddr, registry: Arc<Registry>) -> Result<(), hyper::Error> {
    let server =
        hyper::server::Server::bind(&addr).serve(hyper::service::make_service_fn(move |_conn| {
            let registry = registry.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req: Request<Body>| {
                    let registry = registry.clone();
                    future::ok::<_, hyper::Error>(match req.uri().path() {
                        "/metrics" => handle_metrics(&registry, req),
                        "/ready" => handle_probe("ready\n", req),
                        "/live" => handle_probe("live\n", req),
                        _ => plain_status(StatusCode::NOT_FOUND),
                    })
                },
            ))
        }));
    let addr = server.local_addr();
    info!(%addr, "HTTP admin server listening");
    server.await
}

fn handle_metrics(registry: &Registry, req: Request<Body>) -> Response<Body> {
    if req.method() != hyper::Method::GET {
        return plain_status(StatusCode::METHOD_NOT_ALLOWED);
    }
    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, registry) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(buffer.into())
            .unwrap_or_default(),
        Err(_) => plain_status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn handle_probe(body: &'static str, req: Request<Body>) -> Response<Body> {
    match *req.method() {
        hyper::Method::GET | hyper::Method::HEAD => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body.into())
            .unwrap_or_default(),
        _ => plain_status(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn plain_status(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .unwrap_or_default()
}

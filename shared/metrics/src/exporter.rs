//! `/metrics` HTTP exporter

use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Method, Request, Response, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

fn respond(registry: &Registry, req: &Request<Body>) -> Response<Body> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut response = Response::new(Body::from("not found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %err, "failed to encode Prometheus metrics");
        let mut response = Response::new(Body::from("failed to encode metrics"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }

    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = header::HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    response
}

/// Launch a lightweight HTTP server that exposes `registry` on `/metrics`
pub fn serve_metrics(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let response = respond(&registry, &req);
                    async move { Ok::<_, Infallible>(response) }
                }))
            }
        });

        info!(%addr, "METRICS: exporter listening");
        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        }
    })
}

//! HTTP server bootstrap: accepts connections and dispatches requests into
//! [`RequestRouter`], enforcing the per-request socket timeout.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, StatusCode};
use tokio::net::TcpListener;

use crate::body::ProxyBody;
use crate::router::RequestRouter;
use crate::types::BoxError;

/// Accepts connections from `listener` forever, dispatching each request to
/// `router`. Returns only if accepting a connection fails outright.
pub async fn serve(listener: TcpListener, router: RequestRouter, socket_timeout: Duration) -> Result<(), BoxError> {
    let router = Arc::new(router);

    tracing::info!(addr = %listener.local_addr()?, "remote-cache-proxy listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let router = router.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: HyperRequest<hyper::body::Incoming>| {
                let router = router.clone();
                async move {
                    let req = req.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync());
                    Ok::<_, Infallible>(dispatch_with_timeout(&router, req, socket_timeout).await)
                }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            let conn = http.serve_connection(io, svc).with_upgrades();

            if let Err(err) = conn.await {
                tracing::warn!(error = %err, "error serving connection");
            }
        });
    }
}

async fn dispatch_with_timeout(
    router: &RequestRouter,
    req: crate::types::Request,
    socket_timeout: Duration,
) -> crate::types::Response {
    match tokio::time::timeout(socket_timeout, router.handle(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("request timed out");
            hyper::Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(ProxyBody::empty())
                .expect("empty response is always well-formed")
        }
    }
}

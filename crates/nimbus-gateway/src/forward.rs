//! Upstream forwarding over HTTP/1.1.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tracing::{debug, warn};

use crate::table::{RouteMatch, RouteTable};

/// Connect + request + response-body budget for one upstream call.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers that are not forwarded.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, std::io::Error),
    #[error("upstream handshake failed: {0}")]
    Handshake(hyper::Error),
    #[error("upstream request failed: {0}")]
    Request(hyper::Error),
    #[error("invalid upstream request: {0}")]
    Build(#[from] http::Error),
}

#[derive(Clone)]
pub struct Gateway {
    table: Arc<RouteTable>,
    timeout: Duration,
}

impl Gateway {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self {
            table,
            timeout: UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route and forward a buffered request. Never fails: an unknown path is
    /// a 404 and an unreachable upstream a 502.
    pub async fn forward(&self, req: Request<Bytes>) -> Response<Bytes> {
        let path = req.uri().path().to_string();
        let Some(route) = self.table.route(&path, req.uri().query()) else {
            debug!(%path, "no gateway route");
            return plain(StatusCode::NOT_FOUND, "no route");
        };

        match tokio::time::timeout(self.timeout, send(&route, req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(route_id = %route.route_id, upstream = %route.upstream.authority, error = %e, "upstream call failed");
                plain(StatusCode::BAD_GATEWAY, "bad gateway")
            }
            Err(_) => {
                warn!(route_id = %route.route_id, upstream = %route.upstream.authority, "upstream call timed out");
                plain(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }
}

async fn send(route: &RouteMatch, req: Request<Bytes>) -> Result<Response<Bytes>, ForwardError> {
    let authority = &route.upstream.authority;
    let stream = tokio::net::TcpStream::connect(authority)
        .await
        .map_err(|e| ForwardError::Connect(authority.clone(), e))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(ForwardError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection closed with error");
        }
    });

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder()
        .method(parts.method)
        .uri(route.path_and_query.as_str())
        .version(http::Version::HTTP_11);
    for (name, value) in &parts.headers {
        if HOP_HEADERS.contains(&name.as_str()) || *name == HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    let host = match parts.headers.get(HOST) {
        Some(original) if !route.rewrite_host => original.clone(),
        _ => http::HeaderValue::from_str(authority).map_err(http::Error::from)?,
    };
    let upstream_req = builder.header(HOST, host).body(Full::new(body))?;

    let resp = sender
        .send_request(upstream_req)
        .await
        .map_err(ForwardError::Request)?;
    let (parts, body) = resp.into_parts();
    let body = body.collect().await.map_err(ForwardError::Request)?.to_bytes();

    let mut out = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out = out.header(name, value);
    }
    Ok(out.body(body)?)
}

fn plain(status: StatusCode, msg: &'static str) -> Response<Bytes> {
    let mut resp = Response::new(Bytes::from_static(msg.as_bytes()));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::route;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot upstream that answers with the request head it received.
    async fn echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let head = String::from_utf8_lossy(&buf).to_lowercase();
            let body = head.split("\r\n\r\n").next().unwrap_or_default().to_string();
            let resp = format!(
                "HTTP/1.1 201 Created\r\ncontent-length: {}\r\nx-upstream: echo\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });
        addr
    }

    fn request(path: &str, host: &str) -> Request<Bytes> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header(HOST, host)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_with_stripped_prefix() {
        let addr = echo_upstream().await;
        let table = Arc::new(RouteTable::new());
        table.replace(vec![route("/svc", &format!("http://{addr}/base"), true)]);
        let gateway = Gateway::new(table);

        let resp = gateway.forward(request("/svc/items?x=1", "public.example.com")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-upstream"], "echo");
        let head = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(head.starts_with("get /base/items?x=1 http/1.1"), "{head}");
        assert!(head.contains("host: public.example.com"), "{head}");
    }

    #[tokio::test]
    async fn rewrites_host_when_asked() {
        let addr = echo_upstream().await;
        let table = Arc::new(RouteTable::new());
        let mut r = route("/svc", &format!("http://{addr}"), false);
        r.rewrite_host = true;
        table.replace(vec![r]);

        let resp = Gateway::new(table).forward(request("/svc/a", "public.example.com")).await;
        let head = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(head.starts_with("get /svc/a http/1.1"), "{head}");
        assert!(head.contains(&format!("host: {addr}")), "{head}");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let gateway = Gateway::new(Arc::new(RouteTable::new()));
        let resp = gateway.forward(request("/nothing", "x")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let table = Arc::new(RouteTable::new());
        table.replace(vec![route("/", &format!("http://{addr}"), false)]);
        let resp = Gateway::new(table).forward(request("/a", "x")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}

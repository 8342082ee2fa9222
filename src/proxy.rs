//! The upstream proxy engine
//!
//! A `SynapseProxy` forwards a request to one backend URL: it swaps the
//! scheme and host onto the incoming path-and-query, copies headers
//! verbatim in both directions, streams the response body back, and
//! observes the upstream call duration against the metrics histogram.
//! Upstream failures become the standard Matrix 500 error; there is no
//! retry.

use crate::error::{empty_body, log_and_reply_error, ErrCode, HttpError, ProxyBody};
use crate::metrics::ProxyMetrics;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Proxies HTTP requests to a single backend.
///
/// Holds its own pooled client, so connections to the backend are reused
/// across requests. Safe for concurrent use.
pub struct SynapseProxy {
    /// Where proxied requests are sent to
    url: Uri,
    /// Pooled client used to send proxied requests
    client: Client<HttpConnector, ProxyBody>,
    /// Stores timings of outgoing proxied requests
    metrics: Option<Arc<ProxyMetrics>>,
}

impl SynapseProxy {
    pub fn new(url: Uri, metrics: Option<Arc<ProxyMetrics>>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { url, client, metrics }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Proxy a whole request, taking the method, path, headers, body and
    /// declared content length from it.
    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        self.proxy_http(
            parts.method,
            &path_and_query,
            &parts.headers,
            body.boxed(),
            content_length,
        )
        .await
    }

    /// Send a request built from the method, path-and-query, headers,
    /// body and content length to the backend and build the response
    /// from what the backend returns.
    pub async fn proxy_http(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: ProxyBody,
        content_length: Option<u64>,
    ) -> Response<ProxyBody> {
        let path = path_and_query
            .split('?')
            .next()
            .unwrap_or(path_and_query)
            .to_owned();

        let uri = match self.upstream_uri(path_and_query) {
            Ok(uri) => uri,
            Err(err) => {
                return log_and_reply_error(&HttpError::new(
                    err,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrCode::Unknown,
                    "Error proxying request",
                ));
            }
        };

        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = method.clone();
        *upstream_req.uri_mut() = uri;
        for (name, value) in headers.iter() {
            upstream_req.headers_mut().append(name, value.clone());
        }
        // The content length declared by the caller wins over anything
        // copied from the headers.
        if let Some(length) = content_length {
            upstream_req
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(length));
        }

        let start = Instant::now();
        let result = self.client.request(upstream_req).await;

        if let Some(metrics) = &self.metrics {
            metrics.observe(&path, method.as_str(), start.elapsed().as_micros() as f64);
        }

        match result {
            Ok(upstream_resp) => {
                let (parts, body) = upstream_resp.into_parts();

                // A failure while streaming the body cannot alter the
                // already-written status; it is only logged.
                let body = body
                    .map_err(|error| {
                        warn!(%error, "Error streaming response body");
                        error
                    })
                    .boxed();

                let mut response = Response::new(body);
                *response.status_mut() = parts.status;
                for (name, value) in parts.headers.iter() {
                    response.headers_mut().append(name, value.clone());
                }
                response
            }
            Err(err) => log_and_reply_error(&HttpError::new(
                err,
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrCode::Unknown,
                "Error proxying request",
            )),
        }
    }

    /// Plain GET against an absolute URI through the pooled client.
    /// Used by the versions cache refresh.
    pub async fn get(
        &self,
        uri: Uri,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let mut req = Request::new(empty_body());
        *req.uri_mut() = uri;
        self.client.request(req).await
    }

    pub(crate) fn upstream_uri(&self, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
        let authority = self
            .url
            .authority()
            .map(|a| a.as_str())
            .unwrap_or("localhost");

        Uri::builder()
            .scheme(self.url.scheme_str().unwrap_or("http"))
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use hyper::header::HeaderName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accept one connection, capture the raw request, send a canned
    /// response.
    async fn one_shot_upstream(
        listener: TcpListener,
        response: &'static str,
        captured_tx: oneshot::Sender<String>,
    ) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 16384];
        let mut total = 0;
        loop {
            let n = stream.read(&mut buf[total..]).await.unwrap();
            total += n;
            let text = String::from_utf8_lossy(&buf[..total]);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                    .unwrap_or(0);
                if total >= header_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        captured_tx
            .send(String::from_utf8_lossy(&buf[..total]).into_owned())
            .unwrap();
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_header_and_body_fidelity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (captured_tx, captured_rx) = oneshot::channel();

        tokio::spawn(one_shot_upstream(
            listener,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Upstream: yes\r\nContent-Length: 7\r\n\r\ngot it!",
            captured_tx,
        ));

        let url: Uri = format!("http://127.0.0.1:{}", port).parse().unwrap();
        let proxy = SynapseProxy::new(url, None);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-custom"),
            HeaderValue::from_static("abc"),
        );

        let body = r#"{"k":"v"}"#;
        let response = proxy
            .proxy_http(
                Method::POST,
                "/test/path?x=1",
                &headers,
                full_body(body),
                Some(body.len() as u64),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
        assert_eq!(response.headers().get("content-length").unwrap(), "7");
        let response_body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&response_body[..], b"got it!");

        let captured = captured_rx.await.unwrap();
        assert!(captured.starts_with("POST /test/path?x=1 HTTP/1.1\r\n"), "{captured}");
        assert!(captured.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(captured.to_ascii_lowercase().contains("x-custom: abc"));
        assert!(captured.ends_with(r#"{"k":"v"}"#), "{captured}");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_matrix_500() {
        // Bind then drop, so nothing is listening on the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url: Uri = format!("http://127.0.0.1:{}", port).parse().unwrap();
        let proxy = SynapseProxy::new(url, None);

        let response = proxy
            .proxy_http(Method::GET, "/", &HeaderMap::new(), empty_body(), None)
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errcode"], "M_UNKNOWN");
        assert_eq!(json["error"], "Error proxying request");
    }
}

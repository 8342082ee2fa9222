//! The request router and HTTP server
//!
//! The route table is built once at startup and never mutated. Rules are
//! ordered most specific first; a pattern ending in '/' matches the
//! whole subtree below it, anything else matches exactly. The catch-all
//! "/" rule is last and sends everything unclaimed to the homeserver.

use crate::debug;
use crate::error::{full_body, reply_error, ProxyBody};
use crate::login::LoginHandler;
use crate::metrics::ProxyMetrics;
use crate::proxy::SynapseProxy;
use crate::ring::Balancer;
use crate::versions::VersionsCache;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug as debug_log, error, info};

/// Budget for one request, end to end. Long-poll sync requests are the
/// longest-lived thing the proxy carries; synapse caps them well below
/// this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const SYNC_FAMILY_PATHS: &[&str] = &[
    "/_matrix/client/v2_alpha/sync",
    "/_matrix/client/r0/sync",
    "/_matrix/client/r0/events",
    "/_matrix/client/api/v1/events",
    "/_matrix/client/api/v1/initialSync",
    "/_matrix/client/r0/initialSync",
];

const FEDERATION_READER_PREFIXES: &[&str] = &[
    "/_matrix/federation/v1/event/",
    "/_matrix/federation/v1/state/",
    "/_matrix/federation/v1/state_ids/",
    "/_matrix/federation/v1/backfill/",
    "/_matrix/federation/v1/get_missing_events/",
];

const CLIENT_READER_PATHS: &[&str] = &[
    "/_matrix/client/r0/publicRooms",
    "/_matrix/client/api/v1/publicRooms",
];

/// What a matched route dispatches to.
pub enum Dispatcher {
    /// Static "test" line for connectivity checks
    Test,
    /// Prometheus text exposition
    Metrics(Arc<ProxyMetrics>),
    /// CPU profiling endpoints
    Debug,
    /// Cached /_matrix/client/versions body
    Versions(Arc<VersionsCache>),
    /// Login interception
    Login(Arc<LoginHandler>),
    /// Consistent-hash balancer over the synchrotrons
    Balancer(Arc<Balancer>),
    /// Plain proxy to one backend
    Proxy(Arc<SynapseProxy>),
}

impl Dispatcher {
    /// Short name for logs and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Dispatcher::Test => "test",
            Dispatcher::Metrics(_) => "metrics",
            Dispatcher::Debug => "debug",
            Dispatcher::Versions(_) => "versions",
            Dispatcher::Login(_) => "login",
            Dispatcher::Balancer(_) => "balancer",
            Dispatcher::Proxy(_) => "proxy",
        }
    }
}

struct Route {
    pattern: &'static str,
    dispatcher: Dispatcher,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        if self.pattern.ends_with('/') {
            path.starts_with(self.pattern)
                || path == &self.pattern[..self.pattern.len() - 1]
        } else {
            path == self.pattern
        }
    }
}

/// Everything the router can dispatch to. Worker entries are `None`
/// when that worker is not configured; their routes are then simply not
/// installed.
pub struct RouterConfig {
    pub synapse: Arc<SynapseProxy>,
    pub login: Arc<LoginHandler>,
    pub versions: Arc<VersionsCache>,
    pub metrics: Arc<ProxyMetrics>,
    pub balancer: Option<Arc<Balancer>>,
    pub federation_reader: Option<Arc<SynapseProxy>>,
    pub media_repository: Option<Arc<SynapseProxy>>,
    pub client_reader: Option<Arc<SynapseProxy>>,
}

pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let mut routes = Vec::new();

        routes.push(Route {
            pattern: "/_dendron/test",
            dispatcher: Dispatcher::Test,
        });
        routes.push(Route {
            pattern: "/_dendron/metrics",
            dispatcher: Dispatcher::Metrics(config.metrics),
        });
        routes.push(Route {
            pattern: "/debug/pprof/",
            dispatcher: Dispatcher::Debug,
        });
        routes.push(Route {
            pattern: "/_matrix/client/versions",
            dispatcher: Dispatcher::Versions(config.versions),
        });
        routes.push(Route {
            pattern: "/_matrix/client/api/v1/login",
            dispatcher: Dispatcher::Login(Arc::clone(&config.login)),
        });
        routes.push(Route {
            pattern: "/_matrix/client/r0/login",
            dispatcher: Dispatcher::Login(config.login),
        });

        if let Some(balancer) = config.balancer {
            for pattern in SYNC_FAMILY_PATHS {
                routes.push(Route {
                    pattern,
                    dispatcher: Dispatcher::Balancer(Arc::clone(&balancer)),
                });
            }
        }

        if let Some(federation_reader) = config.federation_reader {
            for pattern in FEDERATION_READER_PREFIXES {
                routes.push(Route {
                    pattern,
                    dispatcher: Dispatcher::Proxy(Arc::clone(&federation_reader)),
                });
            }
            routes.push(Route {
                pattern: "/_matrix/federation/v1/publicRooms",
                dispatcher: Dispatcher::Proxy(federation_reader),
            });
        }

        if let Some(media_repository) = config.media_repository {
            routes.push(Route {
                pattern: "/_matrix/media/",
                dispatcher: Dispatcher::Proxy(media_repository),
            });
        }

        if let Some(client_reader) = config.client_reader {
            for pattern in CLIENT_READER_PATHS {
                routes.push(Route {
                    pattern,
                    dispatcher: Dispatcher::Proxy(Arc::clone(&client_reader)),
                });
            }
        }

        routes.push(Route {
            pattern: "/",
            dispatcher: Dispatcher::Proxy(config.synapse),
        });

        Self { routes }
    }

    /// First matching rule wins; the table is ordered most specific
    /// first and ends with the catch-all.
    pub fn find(&self, path: &str) -> &Dispatcher {
        &self.find_route(path).dispatcher
    }

    fn find_route(&self, path: &str) -> &Route {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .expect("the catch-all route matches everything")
    }

    /// The pattern of the rule that claims `path`.
    #[cfg(test)]
    fn pattern_for(&self, path: &str) -> &'static str {
        self.find_route(path).pattern
    }

    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let dispatcher = self.find(req.uri().path());
        debug_log!(
            method = %req.method(),
            path = req.uri().path(),
            dispatcher = dispatcher.kind(),
            "Routing request"
        );

        match dispatcher {
            Dispatcher::Test => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(full_body("test\n"))
                .expect("valid response with static parts"),
            Dispatcher::Metrics(metrics) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(full_body(metrics.render()))
                .expect("valid response with static parts"),
            Dispatcher::Debug => debug::serve(req).await,
            Dispatcher::Versions(versions) => versions.serve(),
            Dispatcher::Login(login) => login.serve(req).await,
            Dispatcher::Balancer(balancer) => balancer.serve(req).await,
            Dispatcher::Proxy(proxy) => proxy.serve(req).await,
        }
    }
}

/// Accepts connections, optionally completes a TLS handshake, and hands
/// each connection to hyper with the router as its service.
pub struct HttpServer {
    listener: TcpListener,
    router: Arc<Router>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl HttpServer {
    pub fn new(listener: TcpListener, router: Arc<Router>, tls_acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            listener,
            router,
            tls_acceptor,
        }
    }

    pub async fn run(self) {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, protocol, "Listening for matrix requests"),
            Err(_) => info!(protocol, "Listening for matrix requests"),
        }

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "Failed to accept connection");
                    continue;
                }
            };

            let router = Arc::clone(&self.router);
            let tls_acceptor = self.tls_acceptor.clone();

            tokio::spawn(async move {
                if let Some(acceptor) = tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(error) = handle_connection(tls_stream, router).await {
                                debug_log!(%addr, %error, "TLS connection error");
                            }
                        }
                        Err(error) => {
                            debug_log!(%addr, %error, "TLS handshake failed");
                        }
                    }
                } else if let Err(error) = handle_connection(stream, router).await {
                    debug_log!(%addr, %error, "Connection error");
                }
            });
        }
    }
}

async fn handle_connection<S>(stream: S, router: Arc<Router>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move {
            match tokio::time::timeout(REQUEST_TIMEOUT, router.dispatch(req)).await {
                Ok(response) => Ok::<_, hyper::Error>(response),
                Err(_) => Ok(reply_error(
                    StatusCode::GATEWAY_TIMEOUT,
                    "M_UNKNOWN",
                    "Request timed out",
                )),
            }
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use hyper::Uri;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve_versions_once(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\n{}",
            )
            .await;
    }

    async fn test_router(with_workers: bool) -> Router {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_versions_once(listener));

        let url: Uri = format!("http://127.0.0.1:{}", port).parse().unwrap();
        let metrics = Arc::new(ProxyMetrics::new().unwrap());
        let synapse = Arc::new(SynapseProxy::new(url, Some(Arc::clone(&metrics))));
        let login = Arc::new(LoginHandler::new(
            Arc::new(SqliteDatabase::open_in_memory().unwrap()),
            Arc::clone(&synapse),
            "example.org",
            "secret",
        ));
        let versions = VersionsCache::new(Arc::clone(&synapse), Duration::from_secs(3600))
            .await
            .unwrap();

        let worker =
            |port: u16| Arc::new(SynapseProxy::new(format!("http://127.0.0.1:{}", port).parse().unwrap(), None));

        Router::new(RouterConfig {
            synapse,
            login,
            versions,
            metrics,
            balancer: with_workers.then(|| {
                let urls: Vec<Uri> = vec!["http://127.0.0.1:2".parse().unwrap()];
                Arc::new(Balancer::new(&urls, None))
            }),
            federation_reader: with_workers.then(|| worker(3)),
            media_repository: with_workers.then(|| worker(4)),
            client_reader: with_workers.then(|| worker(5)),
        })
    }

    #[tokio::test]
    async fn test_fixed_routes() {
        let router = test_router(false).await;

        assert_eq!(router.find("/_dendron/test").kind(), "test");
        assert_eq!(router.find("/_dendron/metrics").kind(), "metrics");
        assert_eq!(router.find("/debug/pprof/profile").kind(), "debug");
        assert_eq!(router.find("/_matrix/client/versions").kind(), "versions");
        assert_eq!(router.find("/_matrix/client/api/v1/login").kind(), "login");
        assert_eq!(router.find("/_matrix/client/r0/login").kind(), "login");
        assert_eq!(router.find("/").kind(), "proxy");
        assert_eq!(router.find("/anything/else").kind(), "proxy");
    }

    #[tokio::test]
    async fn test_worker_routes_absent_without_workers() {
        let router = test_router(false).await;

        // With no workers configured everything falls through to the
        // homeserver catch-all.
        assert_eq!(router.pattern_for("/_matrix/client/r0/sync"), "/");
        assert_eq!(router.pattern_for("/_matrix/federation/v1/event/$abc"), "/");
        assert_eq!(router.pattern_for("/_matrix/media/r0/download/x"), "/");
        assert_eq!(router.pattern_for("/_matrix/client/r0/publicRooms"), "/");
    }

    #[tokio::test]
    async fn test_worker_routes_present_when_configured() {
        let router = test_router(true).await;

        for path in SYNC_FAMILY_PATHS {
            assert_eq!(router.find(path).kind(), "balancer", "{path}");
        }
        // Exact-match rules do not claim subpaths.
        assert_eq!(router.pattern_for("/_matrix/client/r0/sync/extra"), "/");

        assert_eq!(
            router.pattern_for("/_matrix/federation/v1/event/$abc"),
            "/_matrix/federation/v1/event/"
        );
        assert_eq!(
            router.pattern_for("/_matrix/federation/v1/state_ids/!r/"),
            "/_matrix/federation/v1/state_ids/"
        );
        assert_eq!(
            router.pattern_for("/_matrix/federation/v1/publicRooms"),
            "/_matrix/federation/v1/publicRooms"
        );
        assert_eq!(
            router.pattern_for("/_matrix/media/r0/download/x"),
            "/_matrix/media/"
        );
        assert_eq!(
            router.pattern_for("/_matrix/client/r0/publicRooms"),
            "/_matrix/client/r0/publicRooms"
        );
    }

    #[tokio::test]
    async fn test_login_routes_take_precedence_over_catch_all() {
        let router = test_router(true).await;
        // Longest prefix wins even though "/" matches everything.
        assert_eq!(router.find("/_matrix/client/r0/login").kind(), "login");
        // But sibling paths are not claimed by the exact login rule.
        assert_eq!(router.find("/_matrix/client/r0/logout").kind(), "proxy");
    }
}

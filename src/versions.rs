//! Cache for the `/_matrix/client/versions` response
//!
//! The versions endpoint is static in practice, so it is fetched once at
//! startup and refreshed on a timer. A failed refresh leaves the last
//! good body in place; the cache never serves an error once it has been
//! constructed. Readers load the current body through an atomic pointer
//! swap and never block on the refresher.

use crate::error::{full_body, matrix_headers, ProxyBody};
use crate::proxy::SynapseProxy;
use anyhow::Context;
use arc_swap::ArcSwap;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct VersionsCache {
    proxy: Arc<SynapseProxy>,
    versions_uri: Uri,
    /// Always contains the last successfully fetched body
    resp: ArcSwap<Bytes>,
}

impl VersionsCache {
    /// Fetch the initial body (failure here is fatal) and start the
    /// background refresher.
    pub async fn new(
        proxy: Arc<SynapseProxy>,
        update_interval: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let versions_uri = proxy
            .upstream_uri("/_matrix/client/versions")
            .context("invalid synapse URL")?;

        let cache = Arc::new(Self {
            proxy,
            versions_uri,
            resp: ArcSwap::from_pointee(Bytes::new()),
        });

        cache
            .update()
            .await
            .context("error getting initial versions")?;

        let refresher = Arc::clone(&cache);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(update_interval).await;
                // Failures are logged inside update; the last good body
                // keeps serving until the next tick.
                let _ = refresher.update().await;
            }
        });

        Ok(cache)
    }

    /// Serve the cached body with the standard Matrix JSON/CORS headers.
    pub fn serve(&self) -> Response<ProxyBody> {
        let body = (*self.resp.load_full()).clone();
        matrix_headers(Response::builder().status(StatusCode::OK))
            .body(full_body(body))
            .expect("valid response with static headers")
    }

    async fn update(&self) -> anyhow::Result<()> {
        let resp = match self.proxy.get(self.versions_uri.clone()).await {
            Ok(resp) => resp,
            Err(error) => {
                warn!(%error, "Error updating /versions");
                return Err(error.into());
            }
        };

        if resp.status() != StatusCode::OK {
            warn!(status = %resp.status(), "Error updating /versions");
            anyhow::bail!("error updating /versions: status code {}", resp.status());
        }

        let bytes = resp.into_body().collect().await?.to_bytes();
        self.resp.store(Arc::new(bytes));
        Ok(())
    }
}

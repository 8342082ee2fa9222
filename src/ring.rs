//! Consistent-hash balancing across synchrotron workers
//!
//! Sync traffic is sharded so one user's long-poll requests always land
//! on the same worker. The key is the caller's access token (query
//! parameter first, then bearer header); unauthenticated requests get a
//! random key so they spread uniformly. The ring is built once at
//! startup and never mutated.

use crate::error::{full_body, ProxyBody};
use crate::metrics::ProxyMetrics;
use crate::proxy::SynapseProxy;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Virtual points per physical node; enough that the deterministic
/// distribution is smooth.
const VIRTUAL_NODES_PER_NODE: usize = 160;

/// A consistent hash ring over a fixed set of nodes.
///
/// Each node is replicated into [`VIRTUAL_NODES_PER_NODE`] points on a
/// 64-bit ring; a key maps to the owner of the first point at or after
/// its hash, wrapping around. The hash is a truncated SHA-256, stable
/// across runs and platforms.
pub struct HashRing {
    points: BTreeMap<u64, usize>,
    node_count: usize,
}

impl HashRing {
    pub fn new<S: AsRef<str>>(nodes: &[S]) -> Self {
        let mut points = BTreeMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for replica in 0..VIRTUAL_NODES_PER_NODE {
                let point = ring_hash(format!("{}#{}", node.as_ref(), replica).as_bytes());
                points.insert(point, index);
            }
        }
        Self {
            points,
            node_count: nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Index of the node owning `key`, or `None` for an empty ring.
    pub fn node_for(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let hash = ring_hash(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, &index)| index)
    }
}

fn ring_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Extract the key sync requests are sharded by: the `access_token`
/// query parameter, else the bearer token, else 8 fresh random bytes.
pub fn balance_key(uri: &Uri, headers: &HeaderMap) -> Vec<u8> {
    if let Some(query) = uri.query() {
        for pair in query.split('&') {
            if let Some((name, value)) = pair.split_once('=') {
                if name == "access_token" && !value.is_empty() {
                    return value.as_bytes().to_vec();
                }
            }
        }
    }

    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return token.as_bytes().to_vec();
            }
        }
    }

    let mut random_bytes = vec![0u8; 8];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    random_bytes
}

/// Routes sync-family requests to one synchrotron chosen by the ring.
pub struct Balancer {
    ring: HashRing,
    proxies: Vec<Arc<SynapseProxy>>,
}

impl Balancer {
    pub fn new(urls: &[Uri], metrics: Option<Arc<ProxyMetrics>>) -> Self {
        let nodes: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        let proxies = urls
            .iter()
            .map(|url| Arc::new(SynapseProxy::new(url.clone(), metrics.clone())))
            .collect();
        Self {
            ring: HashRing::new(&nodes),
            proxies,
        }
    }

    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let key = balance_key(req.uri(), req.headers());
        match self.ring.node_for(&key) {
            Some(index) => {
                debug!(
                    backend = %self.proxies[index].url(),
                    path = req.uri().path(),
                    "Balancing sync request"
                );
                self.proxies[index].serve(req).await
            }
            None => {
                // The ring is enforced non-empty at startup, so this is
                // unreachable in practice.
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(full_body("No backend synchrotron available"))
                    .expect("valid response with static parts")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn nodes(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("http://synchrotron-{}:8008", i))
            .collect()
    }

    #[test]
    fn test_same_key_is_sticky() {
        let ring = HashRing::new(&nodes(5));
        let first = ring.node_for(b"some_access_token").unwrap();
        for _ in 0..10 {
            assert_eq!(ring.node_for(b"some_access_token").unwrap(), first);
        }
    }

    #[test]
    fn test_mapping_is_stable_across_rings() {
        let a = HashRing::new(&nodes(4));
        let b = HashRing::new(&nodes(4));
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(a.node_for(key.as_bytes()), b.node_for(key.as_bytes()));
        }
    }

    #[test]
    fn test_keys_spread_over_all_nodes() {
        let ring = HashRing::new(&nodes(3));
        let mut counts = [0usize; 3];
        for i in 0..1000 {
            let key = format!("key-{}", i);
            counts[ring.node_for(key.as_bytes()).unwrap()] += 1;
        }
        for (node, count) in counts.iter().enumerate() {
            assert!(*count > 100, "node {} got only {} of 1000 keys", node, count);
        }
    }

    #[test]
    fn test_removing_a_node_moves_few_keys() {
        let four = HashRing::new(&nodes(4));
        let three = HashRing::new(&nodes(3));
        let mut unchanged = 0;
        for i in 0..1000 {
            let key = format!("key-{}", i);
            if four.node_for(key.as_bytes()) == three.node_for(key.as_bytes()) {
                unchanged += 1;
            }
        }
        // Only keys owned by the removed node should move.
        assert!(unchanged > 500, "only {} of 1000 keys kept their node", unchanged);
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(&Vec::<String>::new());
        assert!(ring.is_empty());
        assert_eq!(ring.node_for(b"anything"), None);
    }

    #[test]
    fn test_balance_key_prefers_query_parameter() {
        let uri: Uri = "/_matrix/client/r0/sync?since=s1&access_token=query_token"
            .parse()
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header_token"));

        assert_eq!(balance_key(&uri, &headers), b"query_token".to_vec());
    }

    #[test]
    fn test_balance_key_falls_back_to_bearer() {
        let uri: Uri = "/_matrix/client/r0/sync".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header_token"));

        assert_eq!(balance_key(&uri, &headers), b"header_token".to_vec());
    }

    #[test]
    fn test_balance_key_ignores_non_bearer_auth() {
        let uri: Uri = "/_matrix/client/r0/sync".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));

        // Falls through to a random 8-byte key.
        assert_eq!(balance_key(&uri, &headers).len(), 8);
    }

    #[test]
    fn test_balance_key_without_credentials_is_random() {
        let uri: Uri = "/_matrix/client/r0/sync?access_token=".parse().unwrap();
        let headers = HeaderMap::new();

        let a = balance_key(&uri, &headers);
        let b = balance_key(&uri, &headers);
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        assert_ne!(a, b, "random keys should differ");
    }
}

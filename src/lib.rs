//! Dendron - a supervising reverse proxy for a Matrix homeserver
//!
//! This library provides a reverse proxy that:
//! - Launches a synapse homeserver and its worker processes as children
//! - Waits for each child to accept HTTP connections before serving traffic
//! - Routes requests to the right backend by URL-path prefix
//! - Shards the sync endpoints across a pool of synchrotrons with a
//!   consistent hash ring keyed on the caller's access token
//! - Intercepts password login and mints macaroon access/refresh tokens
//! - Caches the `/_matrix/client/versions` response, serving stale on error
//! - Records per-endpoint request duration histograms
//! - Shuts the whole process set down as a unit on a signal or child exit

pub mod config;
pub mod db;
pub mod debug;
pub mod endpoints;
pub mod error;
pub mod login;
pub mod macaroons;
pub mod metrics;
pub mod proxy;
pub mod ring;
pub mod router;
pub mod supervisor;
pub mod versions;

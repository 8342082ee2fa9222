//! Configuration loading
//!
//! One TOML file, given as the first command line argument. The
//! `[server]` section covers the listener, TLS material, the signing
//! secret and the database; `[synapse]` covers the homeserver child;
//! `[workers]` covers the optional worker children. Validation failures
//! are fatal at startup.

use anyhow::Context;
use hyper::Uri;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub synapse: SynapseConfig,

    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address to listen for matrix requests on
    #[serde(default = "default_listen_addr")]
    pub addr: String,

    /// Listen for HTTPS requests, otherwise listen for HTTP requests
    #[serde(default)]
    pub tls: bool,

    /// TLS certificate (PEM). Must match the certificate synapse is
    /// configured with.
    pub cert_file: Option<String>,

    /// TLS private key (PEM)
    pub key_file: Option<String>,

    /// The server name tokens are scoped to, e.g. "example.org"
    #[serde(default)]
    pub server_name: String,

    /// Secret the login macaroons are signed with
    #[serde(default)]
    pub macaroon_secret: String,

    /// Path to the synapse database
    #[serde(default = "default_database")]
    pub database: String,
}

impl ServerConfig {
    /// The listen address with Go-style ":port" shorthand expanded.
    pub fn listen_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            tls: false,
            cert_file: None,
            key_file: None,
            server_name: String::new(),
            macaroon_secret: String::new(),
            database: default_database(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynapseConfig {
    /// Start a synapse process, otherwise connect to an existing synapse
    #[serde(default = "default_true")]
    pub start: bool,

    /// Python interpreter to run synapse with. This should be the
    /// python binary installed inside synapse's virtualenv.
    #[serde(default = "default_python")]
    pub python: String,

    /// Path to synapse's config
    #[serde(default = "default_synapse_config")]
    pub config: String,

    /// The HTTP URL that synapse is configured to listen on
    #[serde(default = "default_synapse_url")]
    pub url: String,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            start: true,
            python: default_python(),
            config: default_synapse_config(),
            url: default_synapse_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkersConfig {
    /// Pusher worker config
    pub pusher_config: Option<String>,

    /// Appservice worker config
    pub appservice_config: Option<String>,

    /// Synchrotron worker config
    pub synchrotron_config: Option<String>,

    /// Comma separated list of HTTP URLs that the synchrotron will
    /// listen on
    pub synchrotron_urls: Option<String>,

    /// Federation reader worker config
    pub federation_reader_config: Option<String>,

    /// The HTTP URL that the federation reader will listen on
    pub federation_reader_url: Option<String>,

    /// Media repository worker config
    pub media_repository_config: Option<String>,

    /// The HTTP URL that the media repository will listen on
    pub media_repository_url: Option<String>,

    /// Client reader worker config
    pub client_reader_config: Option<String>,

    /// The HTTP URL that the client reader will listen on
    pub client_reader_url: Option<String>,
}

impl WorkersConfig {
    pub fn synchrotron_urls(&self) -> Vec<String> {
        self.synchrotron_urls
            .as_deref()
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.synapse
            .url
            .parse::<Uri>()
            .with_context(|| format!("invalid synapse url {:?}", self.synapse.url))?;

        if self.server.tls && (self.server.cert_file.is_none() || self.server.key_file.is_none()) {
            anyhow::bail!("tls requires both cert_file and key_file");
        }

        if self.server.server_name.is_empty() {
            anyhow::bail!("server_name must be set");
        }

        if self.server.macaroon_secret.is_empty() {
            anyhow::bail!("macaroon_secret must be set");
        }

        if self.workers.synchrotron_config.is_some() != self.workers.synchrotron_urls.is_some() {
            anyhow::bail!("synchrotron_config and synchrotron_urls must be set together");
        }
        if self.workers.synchrotron_config.is_some() && self.workers.synchrotron_urls().is_empty() {
            anyhow::bail!("synchrotron_urls must name at least one URL");
        }
        for url in self.workers.synchrotron_urls() {
            url.parse::<Uri>()
                .with_context(|| format!("invalid synchrotron url {:?}", url))?;
        }

        for (config, url, name) in [
            (
                &self.workers.federation_reader_config,
                &self.workers.federation_reader_url,
                "federation_reader",
            ),
            (
                &self.workers.media_repository_config,
                &self.workers.media_repository_url,
                "media_repository",
            ),
            (
                &self.workers.client_reader_config,
                &self.workers.client_reader_url,
                "client_reader",
            ),
        ] {
            if config.is_some() != url.is_some() {
                anyhow::bail!("{}_config and {}_url must be set together", name, name);
            }
            if let Some(url) = url {
                url.parse::<Uri>()
                    .with_context(|| format!("invalid {} url {:?}", name, url))?;
            }
        }

        Ok(())
    }
}

fn default_listen_addr() -> String {
    ":8448".to_owned()
}

fn default_database() -> String {
    "homeserver.db".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_python() -> String {
    "python".to_owned()
}

fn default_synapse_config() -> String {
    "homeserver.yaml".to_owned()
}

fn default_synapse_url() -> String {
    "http://localhost:18448".to_owned()
}

use anyhow::Context;
use dendron::config::Config;
use dendron::db::SqliteDatabase;
use dendron::login::LoginHandler;
use dendron::metrics::ProxyMetrics;
use dendron::proxy::SynapseProxy;
use dendron::ring::Balancer;
use dendron::router::{HttpServer, Router, RouterConfig};
use dendron::supervisor::{
    install_signal_watcher, terminate_channel, ManagedProcess, Supervisor,
};
use dendron::versions::VersionsCache;
use hyper::Uri;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// How often the versions cache refreshes.
const VERSIONS_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dendron=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dendron.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let max_files = set_max_open_files().context("raising open file limit")?;
    info!(files = max_files, "Set maximum number of open files");

    let metrics = Arc::new(ProxyMetrics::new().context("registering metrics")?);

    let urls = BackendUrls::parse(&config)?;

    // Used to terminate dendron. First event wins.
    let (terminate_tx, mut terminate_rx) = terminate_channel();
    install_signal_watcher(terminate_tx.clone())?;

    let supervisor = Supervisor::new(terminate_tx.clone());
    let mut children: Vec<ManagedProcess> = Vec::new();

    if let Err(err) = start_children(&supervisor, &config, &urls, &mut children).await {
        error!(error = %err, "Failed to start processes");
        stop_children(children).await;
        return Err(err);
    }

    let result = serve(&config, &urls, metrics, &mut terminate_rx).await;

    match result {
        Ok(reason) => {
            info!(reason, "Shutting Down");
            stop_children(children).await;
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "Failed to start proxy");
            stop_children(children).await;
            Err(err)
        }
    }
}

/// All backend URLs, parsed and validated up front.
struct BackendUrls {
    synapse: Uri,
    synchrotrons: Vec<Uri>,
    federation_reader: Option<Uri>,
    media_repository: Option<Uri>,
    client_reader: Option<Uri>,
}

impl BackendUrls {
    fn parse(config: &Config) -> anyhow::Result<Self> {
        let parse_opt = |url: &Option<String>, what: &str| -> anyhow::Result<Option<Uri>> {
            url.as_deref()
                .map(|u| u.parse::<Uri>().with_context(|| format!("invalid {} url", what)))
                .transpose()
        };

        Ok(Self {
            synapse: config.synapse.url.parse().context("invalid synapse url")?,
            synchrotrons: config
                .workers
                .synchrotron_urls()
                .iter()
                .map(|u| u.parse::<Uri>().context("invalid synchrotron url"))
                .collect::<anyhow::Result<_>>()?,
            federation_reader: parse_opt(&config.workers.federation_reader_url, "federation reader")?,
            media_repository: parse_opt(&config.workers.media_repository_url, "media repository")?,
            client_reader: parse_opt(&config.workers.client_reader_url, "client reader")?,
        })
    }
}

/// Spawn the homeserver and each configured worker, awaiting each
/// readiness probe in turn.
async fn start_children(
    supervisor: &Supervisor,
    config: &Config,
    urls: &BackendUrls,
    children: &mut Vec<ManagedProcess>,
) -> anyhow::Result<()> {
    if !config.synapse.start {
        info!(url = %urls.synapse, "Using existing synapse");
        return Ok(());
    }

    let python = &config.synapse.python;
    let synapse_config = &config.synapse.config;

    children.push(
        supervisor
            .start_process(
                "synapse",
                Some(&urls.synapse),
                python,
                &worker_args("synapse.app.homeserver", synapse_config, None),
            )
            .await?,
    );

    if let Some(pusher_config) = &config.workers.pusher_config {
        children.push(
            supervisor
                .start_process(
                    "pusher",
                    None,
                    python,
                    &worker_args("synapse.app.pusher", synapse_config, Some(pusher_config)),
                )
                .await?,
        );
    }

    if let Some(appservice_config) = &config.workers.appservice_config {
        children.push(
            supervisor
                .start_process(
                    "appservice",
                    None,
                    python,
                    &worker_args(
                        "synapse.app.appservice",
                        synapse_config,
                        Some(appservice_config),
                    ),
                )
                .await?,
        );
    }

    if let Some(synchrotron_config) = &config.workers.synchrotron_config {
        // One process, possibly several listeners; probe the last one.
        children.push(
            supervisor
                .start_process(
                    "synchrotron",
                    urls.synchrotrons.last(),
                    python,
                    &worker_args(
                        "synapse.app.synchrotron",
                        synapse_config,
                        Some(synchrotron_config),
                    ),
                )
                .await?,
        );
    }

    if let Some(federation_reader_config) = &config.workers.federation_reader_config {
        children.push(
            supervisor
                .start_process(
                    "federationReader",
                    urls.federation_reader.as_ref(),
                    python,
                    &worker_args(
                        "synapse.app.federation_reader",
                        synapse_config,
                        Some(federation_reader_config),
                    ),
                )
                .await?,
        );
    }

    if let Some(media_repository_config) = &config.workers.media_repository_config {
        children.push(
            supervisor
                .start_process(
                    "mediaRepository",
                    urls.media_repository.as_ref(),
                    python,
                    &worker_args(
                        "synapse.app.media_repository",
                        synapse_config,
                        Some(media_repository_config),
                    ),
                )
                .await?,
        );
    }

    if let Some(client_reader_config) = &config.workers.client_reader_config {
        children.push(
            supervisor
                .start_process(
                    "clientReader",
                    urls.client_reader.as_ref(),
                    python,
                    &worker_args(
                        "synapse.app.client_reader",
                        synapse_config,
                        Some(client_reader_config),
                    ),
                )
                .await?,
        );
    }

    info!("Synapse started");
    Ok(())
}

fn worker_args(module: &str, synapse_config: &str, worker_config: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-m".to_owned(),
        module.to_owned(),
        "-c".to_owned(),
        synapse_config.to_owned(),
    ];
    if let Some(worker_config) = worker_config {
        args.push("-c".to_owned());
        args.push(worker_config.to_owned());
    }
    args
}

/// Assemble the router over the running backends, bind the listener and
/// serve until the terminate channel fires. Returns the reason.
async fn serve(
    config: &Config,
    urls: &BackendUrls,
    metrics: Arc<ProxyMetrics>,
    terminate_rx: &mut mpsc::Receiver<String>,
) -> anyhow::Result<String> {
    let db = SqliteDatabase::open(&config.server.database).context("opening database")?;

    let synapse_proxy = Arc::new(SynapseProxy::new(
        urls.synapse.clone(),
        Some(Arc::clone(&metrics)),
    ));

    let login = Arc::new(LoginHandler::new(
        Arc::new(db),
        Arc::clone(&synapse_proxy),
        config.server.server_name.as_str(),
        config.server.macaroon_secret.as_str(),
    ));

    let versions = VersionsCache::new(Arc::clone(&synapse_proxy), VERSIONS_UPDATE_INTERVAL)
        .await
        .context("fetching initial versions")?;

    let balancer = if urls.synchrotrons.is_empty() {
        None
    } else {
        Some(Arc::new(Balancer::new(
            &urls.synchrotrons,
            Some(Arc::clone(&metrics)),
        )))
    };

    let worker_proxy = |url: &Option<Uri>| {
        url.as_ref()
            .map(|u| Arc::new(SynapseProxy::new(u.clone(), Some(Arc::clone(&metrics)))))
    };

    let router = Arc::new(Router::new(RouterConfig {
        synapse: synapse_proxy,
        login,
        versions,
        metrics: Arc::clone(&metrics),
        balancer,
        federation_reader: worker_proxy(&urls.federation_reader),
        media_repository: worker_proxy(&urls.media_repository),
        client_reader: worker_proxy(&urls.client_reader),
    }));

    let listen_addr = config.server.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {}", listen_addr))?;

    let tls_acceptor = if config.server.tls {
        let cert_file = config.server.cert_file.as_deref().expect("validated");
        let key_file = config.server.key_file.as_deref().expect("validated");
        Some(build_tls_acceptor(cert_file, key_file)?)
    } else {
        None
    };

    tokio::spawn(HttpServer::new(listener, router, tls_acceptor).run());

    let reason = terminate_rx
        .recv()
        .await
        .unwrap_or_else(|| "Terminate channel closed".to_owned());
    Ok(reason)
}

async fn stop_children(children: Vec<ManagedProcess>) {
    // Reverse start order, workers before the homeserver they depend on.
    for child in children.into_iter().rev() {
        child.stop().await;
    }
}

fn set_max_open_files() -> anyhow::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(std::io::Error::last_os_error()).context("getrlimit");
    }
    limit.rlim_cur = limit.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setrlimit");
    }
    Ok(limit.rlim_max)
}

fn build_tls_acceptor(cert_file: &str, key_file: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS configuration error")?;

    info!(cert = cert_file, key = key_file, "TLS enabled");
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("failed to open certificate file {}", path))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates from {}", path))?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open key file {}", path))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .with_context(|| format!("failed to parse key from {}", path))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("no private key found in {}", path)
}

//! Child process supervision
//!
//! The homeserver and each worker run as child processes. Every child
//! gets a readiness probe before traffic is routed to it, an exit
//! watcher that turns an unexpected death into a terminate event, and a
//! polite-then-forceful stop sequence on shutdown. All exit and signal
//! events fan into one single-shot terminate channel: the first event
//! wins and later ones are dropped without blocking.

use crate::error::{empty_body, ProxyBody};
use anyhow::Context;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// How often the readiness probe retries.
const READY_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Total budget for a child to start accepting HTTP connections.
const READY_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a child gets to exit after the polite terminate signal
/// before it is killed outright.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Create the terminate channel: capacity one, first event wins.
/// Producers must use `try_send`; a full channel means shutdown is
/// already underway and the event can be dropped.
pub fn terminate_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(1)
}

/// Install a watcher that turns the first SIGINT, SIGTERM or SIGHUP
/// into a terminate event.
pub fn install_signal_watcher(terminate_tx: mpsc::Sender<String>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        };
        let _ = terminate_tx.try_send(format!("Got signal {}", name));
    });

    Ok(())
}

/// A supervised child process.
///
/// The child itself is owned by its exit watcher task, which reaps it
/// and emits the terminate event when it dies. `stop` signals the child
/// by pid and waits for the watcher to observe the exit.
pub struct ManagedProcess {
    app: String,
    pid: u32,
    watcher: JoinHandle<()>,
}

impl ManagedProcess {
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Polite terminate, a hard kill scheduled after the grace period,
    /// then wait for the reap.
    pub async fn stop(self) {
        info!(app = %self.app, pid = self.pid, "Stopping process");

        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(app = %self.app, pid = self.pid, "Failed to signal process");
        }

        let pid = self.pid;
        let app = self.app.clone();
        let killer = tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE_PERIOD).await;
            warn!(app = %app, pid, "Process failed to stop within 10 seconds");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        });

        // The watcher finishes once the child has been reaped.
        let _ = self.watcher.await;
        killer.abort();
    }
}

/// Spawns children and wires their exits into the terminate channel.
pub struct Supervisor {
    terminate_tx: mpsc::Sender<String>,
    probe_client: Client<HttpConnector, ProxyBody>,
}

impl Supervisor {
    pub fn new(terminate_tx: mpsc::Sender<String>) -> Self {
        let probe_client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            terminate_tx,
            probe_client,
        }
    }

    /// Start one child. If `process_url` is given, block until the
    /// child answers an HTTP request there; a readiness timeout is an
    /// error and the child is killed and reaped before it propagates.
    pub async fn start_process(
        &self,
        app: &str,
        process_url: Option<&Uri>,
        program: &str,
        args: &[String],
    ) -> anyhow::Result<ManagedProcess> {
        match process_url {
            Some(url) => info!(app, program, %url, "Starting process"),
            None => info!(app, program, "Starting process"),
        }

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start process {}", app))?;
        let pid = child
            .id()
            .with_context(|| format!("process {} exited before it could be supervised", app))?;
        info!(app, pid, "Process spawned");

        if let Some(url) = process_url {
            if let Err(err) = self.wait_for_process(url, app).await {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err);
            }
        }

        let terminate_tx = self.terminate_tx.clone();
        let watcher_app = app.to_owned();
        let watcher = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(app = %watcher_app, %status, "Process exited"),
                Err(error) => warn!(app = %watcher_app, %error, "Error waiting for process"),
            }
            let _ = terminate_tx.try_send(format!("Process {} Stopped", watcher_app));
        });

        Ok(ManagedProcess {
            app: app.to_owned(),
            pid,
            watcher,
        })
    }

    /// Poll the child's URL until it answers. Any HTTP response counts,
    /// whatever the status code; the body is dropped immediately.
    async fn wait_for_process(&self, process_url: &Uri, app: &str) -> anyhow::Result<()> {
        info!(app, url = %process_url, "Connecting to process");
        let deadline = Instant::now() + READY_TIMEOUT;

        while Instant::now() < deadline {
            let mut req = Request::new(empty_body());
            *req.uri_mut() = process_url.clone();
            if self.probe_client.request(req).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_PERIOD).await;
        }

        anyhow::bail!(
            "timeout waiting for process {} to accept http connections",
            app
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_terminate_event_wins() {
        let (tx, mut rx) = terminate_channel();

        tx.try_send("first".to_owned()).unwrap();
        // The channel holds one event; later sends are dropped.
        assert!(tx.try_send("second".to_owned()).is_err());

        assert_eq!(rx.recv().await.unwrap(), "first");
    }
}

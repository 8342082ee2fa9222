//! Child process lifecycle tests
//!
//! These spawn real `/bin/sh` children, so they only run on Unix.
#![cfg(unix)]

use dendron::supervisor::{terminate_channel, ManagedProcess, Supervisor};
use hyper::Uri;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn sh_args(script: &str) -> Vec<String> {
    vec!["-c".to_owned(), script.to_owned()]
}

/// Reserve a port by binding and immediately dropping a listener.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Answer every connection on the listener with a minimal 200.
async fn accept_loop(listener: TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                .await;
        });
    }
}

#[tokio::test]
async fn test_child_exit_sends_terminate_event() {
    let (terminate_tx, mut terminate_rx) = terminate_channel();
    let supervisor = Supervisor::new(terminate_tx);

    let _child = supervisor
        .start_process("quick", None, "/bin/sh", &sh_args("exit 0"))
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), terminate_rx.recv())
        .await
        .expect("terminate event within five seconds")
        .expect("channel open");
    assert_eq!(reason, "Process quick Stopped");
}

#[tokio::test]
async fn test_readiness_succeeds_once_url_accepts() {
    let port = free_port().await;
    let url: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();

    // The URL starts accepting connections half a second in.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        accept_loop(listener).await;
    });

    let (terminate_tx, _terminate_rx) = terminate_channel();
    let supervisor = Supervisor::new(terminate_tx);

    let start = Instant::now();
    let child = supervisor
        .start_process("sleeper", Some(&url), "/bin/sh", &sh_args("sleep 30"))
        .await
        .expect("readiness probe succeeds");
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(400), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(20), "waited {:?}", waited);

    child.stop().await;
}

#[tokio::test]
async fn test_readiness_times_out_when_url_never_accepts() {
    let port = free_port().await;
    let url: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();

    let (terminate_tx, _terminate_rx) = terminate_channel();
    let supervisor = Supervisor::new(terminate_tx);

    let start = Instant::now();
    let result = supervisor
        .start_process("deaf", Some(&url), "/bin/sh", &sh_args("sleep 60"))
        .await;
    assert!(result.is_err(), "readiness must time out");
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(19), "gave up after {:?}", waited);
    assert!(waited < Duration::from_secs(30), "gave up after {:?}", waited);
}

#[tokio::test]
async fn test_stop_terminates_politely_and_reaps() {
    let (terminate_tx, mut terminate_rx) = terminate_channel();
    let supervisor = Supervisor::new(terminate_tx);

    let child = supervisor
        .start_process("sleeper", None, "/bin/sh", &sh_args("sleep 30"))
        .await
        .unwrap();

    let start = Instant::now();
    child.stop().await;

    // SIGTERM alone must do it, well inside the 10 second kill grace.
    assert!(start.elapsed() < Duration::from_secs(5));

    // The exit watcher still emits its event; with the consumer already
    // gone at real shutdown it would be dropped, here we observe it.
    let reason = terminate_rx.recv().await.unwrap();
    assert_eq!(reason, "Process sleeper Stopped");
}

#[tokio::test]
async fn test_children_stop_in_reverse_start_order() {
    let (terminate_tx, _terminate_rx) = terminate_channel();
    let supervisor = Supervisor::new(terminate_tx);

    let mut children: Vec<ManagedProcess> = Vec::new();
    for app in ["first", "second", "third"] {
        children.push(
            supervisor
                .start_process(app, None, "/bin/sh", &sh_args("sleep 30"))
                .await
                .unwrap(),
        );
    }

    let mut stopped = Vec::new();
    for child in children.into_iter().rev() {
        stopped.push(child.app().to_owned());
        child.stop().await;
    }

    assert_eq!(stopped, ["third", "second", "first"]);
}

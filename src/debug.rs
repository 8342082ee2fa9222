//! Profiling endpoints under `/debug/pprof/`
//!
//! CPU profiles are collected on demand with the `pprof` crate and
//! served either in the pprof protobuf format (consumable by
//! `go tool pprof` and friends) or as a flamegraph SVG.

use crate::error::{full_body, ProxyBody};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

const DEFAULT_PROFILE_SECONDS: u64 = 30;
const MAX_PROFILE_SECONDS: u64 = 300;

/// Sampling frequency in Hz while a profile is being collected.
const PROFILE_FREQUENCY: i32 = 100;

pub async fn serve(req: Request<Incoming>) -> Response<ProxyBody> {
    let duration = profile_duration(req.uri().query());
    match req.uri().path() {
        "/debug/pprof" | "/debug/pprof/" => index(),
        "/debug/pprof/profile" => profile(duration).await,
        "/debug/pprof/flamegraph" => flamegraph(duration).await,
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Content-Type", "text/plain")
            .body(full_body("unknown profile\n"))
            .expect("valid response with static parts"),
    }
}

fn index() -> Response<ProxyBody> {
    let body = "/debug/pprof/\n\
                \n\
                profile?seconds=N    CPU profile, pprof protobuf format\n\
                flamegraph?seconds=N CPU profile, flamegraph SVG\n";
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(full_body(body))
        .expect("valid response with static parts")
}

fn profile_duration(query: Option<&str>) -> Duration {
    let seconds = query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("seconds="))
                .and_then(|v| v.parse::<u64>().ok())
        })
        .unwrap_or(DEFAULT_PROFILE_SECONDS)
        .clamp(1, MAX_PROFILE_SECONDS);
    Duration::from_secs(seconds)
}

async fn collect_report(duration: Duration) -> anyhow::Result<pprof::Report> {
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(PROFILE_FREQUENCY)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()?;
    tokio::time::sleep(duration).await;
    Ok(guard.report().build()?)
}

async fn profile(duration: Duration) -> Response<ProxyBody> {
    let result: anyhow::Result<Vec<u8>> = async {
        use pprof::protos::Message;
        let report = collect_report(duration).await?;
        let profile = report.pprof()?;
        let mut content = Vec::new();
        profile.write_to_vec(&mut content)?;
        Ok(content)
    }
    .await;

    match result {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(full_body(content))
            .expect("valid response with static parts"),
        Err(error) => profiling_error(error),
    }
}

async fn flamegraph(duration: Duration) -> Response<ProxyBody> {
    let result: anyhow::Result<Vec<u8>> = async {
        let report = collect_report(duration).await?;
        let mut content = Vec::new();
        report.flamegraph(&mut content)?;
        Ok(content)
    }
    .await;

    match result {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "image/svg+xml")
            .body(full_body(content))
            .expect("valid response with static parts"),
        Err(error) => profiling_error(error),
    }
}

fn profiling_error(error: anyhow::Error) -> Response<ProxyBody> {
    warn!(%error, "Error collecting profile");
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Content-Type", "text/plain")
        .body(full_body(format!("could not collect profile: {}\n", error)))
        .expect("valid response with static parts")
}

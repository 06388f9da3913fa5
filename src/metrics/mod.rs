//! Metrics
//!
//! Prometheus counters and gauges for the four cluster-maintenance engines,
//! exposed on `--metrics-addr` alongside `/healthz`. Each engine increments
//! its own counters as it runs; `serve` owns the HTTP exposition.

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{Counter, CounterVec, Encoder, Opts, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Error, Result};

pub static RECONCILER_VOLUMES_COPIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec(
        "swfsck_reconciler_volumes_total",
        "Replication reconciler actions by outcome",
        &["action"],
    )
});

pub static FSCK_ORPHANS_FOUND: Lazy<Counter> = Lazy::new(|| {
    register_counter("swfsck_fsck_orphans_total", "Orphaned needles/entries found by fsck")
});

pub static FSCK_ORPHANS_PURGED: Lazy<Counter> = Lazy::new(|| {
    register_counter("swfsck_fsck_purged_total", "Orphaned needles/entries purged by fsck")
});

pub static DISKCHECK_NEEDLES_REPAIRED: Lazy<Counter> = Lazy::new(|| {
    register_counter(
        "swfsck_diskcheck_needles_repaired_total",
        "Needles copied between replicas to repair a divergence",
    )
});

pub static EC_DECODES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec(
        "swfsck_ec_decodes_total",
        "EC decode orchestrator outcomes",
        &["result"],
    )
});

fn register_counter(name: &str, help: &str) -> Counter {
    let c = Counter::new(name, help).expect("valid counter metadata");
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .expect("metric registered exactly once");
    c
}

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("valid counter metadata");
    prometheus::default_registry()
        .register(Box::new(c.clone()))
        .expect("metric registered exactly once");
    c
}

/// Forces registration of every static metric, so `/metrics` reports zero
/// counters instead of omitting them before first use.
pub fn init() {
    Lazy::force(&RECONCILER_VOLUMES_COPIED);
    Lazy::force(&FSCK_ORPHANS_FOUND);
    Lazy::force(&FSCK_ORPHANS_PURGED);
    Lazy::force(&DISKCHECK_NEEDLES_REPAIRED);
    Lazy::force(&EC_DECODES);
}

async fn metrics_handler(
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", encoder.format_type())
                .body(Full::new(Bytes::from(buffer)))
                .unwrap()
        }
        "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Serves `/metrics` and `/healthz` until the process exits. Intended to be
/// spawned alongside an engine's main task.
pub async fn serve(addr: &str) -> Result<()> {
    init();

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid metrics address {addr}: {e}")))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Fatal(format!("failed to bind metrics server on {addr}: {e}")))?;

    info!(%addr, "metrics server listening");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Fatal(format!("metrics server accept error: {e}")))?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!(error = %e, "metrics server connection error");
            }
        });
    }
}

//! Inbound probe collector connections: announce, dump, heartbeat,
//! upload/download forwarding.

use crate::codec::{FrameDecoder, Package};
use crate::error::SessionError;
use crate::session::Session;
use crate::state::SharedState;
use crate::wire::probe as tp;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen for probe collectors on `port` until the listener is dropped.
pub async fn run(state: Arc<SharedState>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening for probes");
    loop {
        let (socket, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, socket).await {
                tracing::debug!(peer = %addr, error = %e, "probe connection ended");
            }
        });
    }
}

/// Serve a single accepted probe connection until it disconnects or is
/// closed for a protocol violation (e.g. a double announce). Exposed for
/// integration tests; [`run`] is the production entry point.
pub async fn serve_one(
    state: Arc<SharedState>,
    socket: tokio::net::TcpStream,
) -> std::io::Result<()> {
    handle_connection(state, socket).await
}

async fn handle_connection(
    state: Arc<SharedState>,
    socket: tokio::net::TcpStream,
) -> std::io::Result<()> {
    let (mut read_half, mut write_half) = socket.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let session = Arc::new(Session::new(write_tx));

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut conn_id: Option<u64> = None;
    let mut probe_key: Option<String> = None;
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    let result = 'read_loop: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        for pkg in decoder.feed(&buf[..n]) {
            if let Err(close) =
                dispatch(&state, &session, &mut conn_id, &mut probe_key, pkg).await
            {
                if close {
                    break 'read_loop Ok(());
                }
            }
        }
    };

    if let Some(id) = conn_id {
        tracing::info!(probe_key = ?probe_key, "probe connection lost");
        state.remove_probe(id).await;
    }
    writer_task.abort();
    result
}

/// Returns `Err(true)` when the connection should be closed.
async fn dispatch(
    state: &Arc<SharedState>,
    session: &Arc<Session>,
    conn_id: &mut Option<u64>,
    probe_key: &mut Option<String>,
    pkg: Package,
) -> Result<(), bool> {
    match pkg.tp {
        tp::REQ_ANNOUNCE => on_announce(state, session, conn_id, probe_key, pkg).await,
        tp::FAF_DUMP => {
            on_dump(state, pkg).await;
            Ok(())
        }
        tp::RES_INFO | tp::RES_ERR => {
            let result = if pkg.tp == tp::RES_ERR {
                let msg: String = pkg.read_data().unwrap_or_else(|_| "peer error".into());
                Err(SessionError::PeerError(msg))
            } else {
                Ok(pkg.clone())
            };
            let pid = pkg.pid;
            session.resolve(pid, result);
            Ok(())
        }
        tp::REQ_UPLOAD_FILE => {
            on_upload(state, session, pkg).await;
            Ok(())
        }
        tp::REQ_DOWNLOAD_FILE => {
            on_download(state, session, pkg).await;
            Ok(())
        }
        other => {
            tracing::error!(tp = other, "unhandled package type");
            Ok(())
        }
    }
}

async fn on_announce(
    state: &Arc<SharedState>,
    session: &Arc<Session>,
    conn_id: &mut Option<u64>,
    probe_key: &mut Option<String>,
    pkg: Package,
) -> Result<(), bool> {
    let (name, version): (String, String) = match pkg.read_data() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "unpack announce response failed; close the connection");
            return Err(true);
        }
    };

    tracing::info!(name = %name, version = %version, "probe collector announce");

    let checks = state.checks_for(&name).await;
    if checks.is_empty() {
        tracing::warn!(probe_key = %name, "no assets found for probe collector");
    }

    let resp = match Package::make(tp::RES_ANNOUNCE, &checks) {
        Ok(p) => p.with_pid(pkg.pid),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode announce response");
            return Err(true);
        }
    };

    match state
        .register_probe(name.clone(), version.clone(), session.clone())
        .await
    {
        Some(id) => {
            if session.respond(resp).is_err() {
                tracing::error!("failed to write announce response; close the connection");
                return Err(true);
            }
            *conn_id = Some(id);
            *probe_key = Some(name);
            Ok(())
        }
        None => {
            tracing::error!(probe_key = %name, "got a double probe collector announcement; close the connection");
            Err(true)
        }
    }
}

/// Enqueue the entire received package onto the hub outbound queue,
/// dropping the oldest entry on overflow.
async fn on_dump(state: &Arc<SharedState>, pkg: Package) {
    match state.hub().await {
        Some(hub) => hub.enqueue(pkg).await,
        None => tracing::warn!("hub client not ready; dropping dump package"),
    }
}

async fn on_upload(state: &Arc<SharedState>, session: &Arc<Session>, pkg: Package) {
    let data: serde_json::Value = pkg.read_data().unwrap_or(serde_json::Value::Null);
    let outcome = match state.hub().await {
        Some(hub) => hub.upload_file(data).await,
        None => Err(crate::error::CoreError::Protocol("hub not connected".into())),
    };
    let resp = match outcome {
        Ok(resp) => Package::make(tp::RES_UPLOAD_FILE, &resp),
        Err(e) => Package::make(tp::RES_ERR, &e.to_string()),
    };
    if let Ok(resp) = resp {
        let _ = session.respond(resp.with_pid(pkg.pid));
    }
}

async fn on_download(state: &Arc<SharedState>, session: &Arc<Session>, pkg: Package) {
    let data: serde_json::Value = pkg.read_data().unwrap_or(serde_json::Value::Null);
    let outcome = match state.hub().await {
        Some(hub) => hub.download_file(data).await,
        None => Err(crate::error::CoreError::Protocol("hub not connected".into())),
    };
    let resp = match outcome {
        Ok(resp) => Package::make(tp::RES_DOWNLOAD_FILE, &resp),
        Err(e) => Package::make(tp::RES_ERR, &e.to_string()),
    };
    if let Ok(resp) = resp {
        let _ = session.respond(resp.with_pid(pkg.pid));
    }
}

/// Issue `REQ_INFO` toward a single probe and measure the round trip. Used
/// by the heartbeat aggregator; never propagates an error — a failing
/// probe is reported with `timestamp=1` by the caller.
pub async fn heartbeat_one(
    probe_key: String,
    version: String,
    session: Arc<Session>,
) -> crate::heartbeat::ProbeInfo {
    let t0 = std::time::Instant::now();
    let pkg = Package::make_binary(tp::REQ_INFO, Vec::new());
    let timestamp = match session.request(pkg, HEARTBEAT_TIMEOUT).await {
        // the probe's timestamp may arrive as a msgpack int or float; decode
        // untyped and coerce rather than binding to `f64` directly, which
        // rmp-serde rejects for an int-encoded value.
        Ok(resp) => resp
            .read_data::<serde_json::Value>()
            .ok()
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0),
        Err(e) => {
            tracing::error!(probe_key = %probe_key, error = %e, "heartbeat request failed");
            1.0
        }
    };
    crate::heartbeat::ProbeInfo {
        key: probe_key,
        version,
        timestamp,
        roundtrip: t0.elapsed().as_secs_f64(),
    }
}

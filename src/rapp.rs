//! Single-owner sibling connection: accepts at most one live rapp
//! connection, keeps it alive with a periodic ping, and proxies
//! hub-initiated control requests through it.

use crate::codec::{FrameDecoder, Package};
use crate::error::SessionError;
use crate::session::Session;
use crate::state::SharedState;
use crate::wire::rapp as tp;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// The structured envelope the hub gets back for every `REQ_RAPP`.
#[derive(Debug, Clone, Serialize)]
pub struct RappEnvelope {
    pub protocol: u8,
    pub data: serde_json::Value,
}

pub async fn run(state: Arc<SharedState>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening for rapp");
    loop {
        let (socket, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, socket).await {
                tracing::debug!(peer = %addr, error = %e, "rapp connection ended");
            }
        });
    }
}

async fn handle_connection(
    state: Arc<SharedState>,
    socket: tokio::net::TcpStream,
) -> std::io::Result<()> {
    let (mut read_half, mut write_half) = socket.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let session = Arc::new(Session::new(write_tx));

    if !state.set_rapp(session.clone()).await {
        tracing::warn!("rapp already connected; aborting new connection");
        return Ok(());
    }
    tracing::info!("rapp connected");

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let keepalive_session = session.clone();
    let keepalive_task = tokio::spawn(async move { keepalive_loop(keepalive_session).await });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    let result = loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        let mut should_close = false;
        for pkg in decoder.feed(&buf[..n]) {
            if dispatch(&session, pkg) {
                should_close = true;
            }
        }
        if should_close {
            break Ok(());
        }
    };

    tracing::info!("rapp connection lost");
    keepalive_task.abort();
    writer_task.abort();
    state.clear_rapp(&session).await;
    result
}

/// Returns `true` when the connection should be closed (unknown message
/// type, per the original protocol's behavior).
fn dispatch(session: &Arc<Session>, pkg: Package) -> bool {
    match pkg.tp {
        tp::RAPP_RES => {
            let pid = pkg.pid;
            session.resolve(pid, Ok(pkg));
            false
        }
        tp::RAPP_BUSY | tp::RAPP_ERR => {
            let pid = pkg.pid;
            session.resolve(pid, Ok(pkg));
            false
        }
        other => {
            tracing::error!(tp = other, "unhandled package type");
            true
        }
    }
}

async fn keepalive_loop(session: Arc<Session>) {
    loop {
        tokio::time::sleep(KEEPALIVE_INTERVAL).await;
        let pkg = Package::make_binary(tp::RAPP_READ, Vec::new());
        match session.request(pkg, KEEPALIVE_TIMEOUT).await {
            Ok(_) => tracing::debug!("rapp keepalive"),
            Err(e) => {
                tracing::warn!(error = %e, "error on ping rapp");
                break;
            }
        }
    }
}

/// Forward a hub-initiated `REQ_RAPP{protocol, data}` to the rapp
/// connection, if any, and mirror the result into a `RES_RAPP` envelope.
pub async fn proxy_request(
    state: &Arc<SharedState>,
    protocol: u8,
    data: Option<serde_json::Value>,
) -> RappEnvelope {
    let session = match state.rapp().await {
        Some(s) => s,
        None => {
            return RappEnvelope {
                protocol: tp::RAPP_NO_CONNECTION,
                data: serde_json::Value::Null,
            }
        }
    };

    let pkg = match &data {
        None => Package::make_binary(protocol, Vec::new()),
        Some(v) => match Package::make(protocol, v) {
            Ok(p) => p,
            Err(e) => {
                return RappEnvelope {
                    protocol: tp::RAPP_ERR,
                    data: serde_json::json!({ "reason": e.to_string() }),
                }
            }
        },
    };

    match session.request(pkg, FORWARD_TIMEOUT).await {
        Ok(resp) => {
            let data = resp.read_data().unwrap_or(serde_json::Value::Null);
            RappEnvelope {
                protocol: resp.tp,
                data,
            }
        }
        Err(SessionError::Timeout) => RappEnvelope {
            protocol: tp::RAPP_ERR,
            data: serde_json::json!({ "reason": "request timed out" }),
        },
        Err(e) => RappEnvelope {
            protocol: tp::RAPP_ERR,
            data: serde_json::json!({ "reason": e.to_string() }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn no_rapp_connected_returns_no_connection() {
        let state = Arc::new(SharedState::new(
            "agent-1".into(),
            0,
            "tok".into(),
            PathBuf::from("/tmp/does-not-exist.mp"),
        ));
        let env = proxy_request(&state, tp::RAPP_READ, None).await;
        assert_eq!(env.protocol, tp::RAPP_NO_CONNECTION);
    }

    #[tokio::test]
    async fn second_rapp_connection_is_refused() {
        let state = Arc::new(SharedState::new(
            "agent-1".into(),
            0,
            "tok".into(),
            PathBuf::from("/tmp/does-not-exist.mp"),
        ));
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let s1 = Arc::new(Session::new(tx1));
        assert!(state.set_rapp(s1).await);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let s2 = Arc::new(Session::new(tx2));
        assert!(!state.set_rapp(s2).await);
    }
}

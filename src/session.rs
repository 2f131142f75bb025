//! Generic request/response session layer shared by the hub client, probe
//! server connections, and the rapp session: correlation ids, a pending
//! table, and timeout-bounded requests over a single connection.

use crate::codec::Package;
use crate::error::SessionError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type PendingTable = Mutex<HashMap<u16, oneshot::Sender<Result<Package, SessionError>>>>;

/// Per-connection session state. Owns the outbound write side via an
/// unbounded channel to a dedicated writer task, so `request`/`send` can be
/// called concurrently from more than one task (e.g. the hub client's
/// connect handshake and its drain loop share one session).
pub struct Session {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingTable,
    next_pid: Mutex<u16>,
}

impl Session {
    /// `write_tx` feeds a writer task that owns the actual socket half;
    /// the caller is responsible for spawning that task.
    pub fn new(write_tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Session {
            write_tx,
            pending: Mutex::new(HashMap::new()),
            next_pid: Mutex::new(0),
        }
    }

    /// Next correlation id: wraps modulo 2^16, skipping 0 (0 is reserved
    /// for fire-and-forget).
    fn allocate_pid(&self) -> u16 {
        let mut next = self.next_pid.lock().unwrap();
        loop {
            *next = next.wrapping_add(1);
            if *next != 0 {
                break;
            }
        }
        *next
    }

    /// Fire-and-forget: `pid` is forced to 0, no pending entry is registered.
    pub fn send(&self, pkg: Package) -> Result<(), SessionError> {
        let pkg = pkg.with_pid(0);
        self.write_tx
            .send(pkg.to_bytes())
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Write a reply frame as-is, preserving whatever `pid` the caller set
    /// (normally the requester's own correlation id via
    /// [`Package::with_pid`]). Use this instead of `send` for every
    /// response-type package (`RES_*`): `send` forces `pid = 0`, which is
    /// only correct for genuine fire-and-forget messages.
    pub fn respond(&self, pkg: Package) -> Result<(), SessionError> {
        self.write_tx
            .send(pkg.to_bytes())
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Assign a pid, register a completion, write the framed bytes, and
    /// wait up to `timeout` for a response routed back via [`Session::resolve`].
    pub async fn request(
        &self,
        pkg: Package,
        timeout: Duration,
    ) -> Result<Package, SessionError> {
        let pid = self.allocate_pid();
        let pkg = pkg.with_pid(pid);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(pid, tx);

        if self.write_tx.send(pkg.to_bytes()).is_err() {
            self.pending.lock().unwrap().remove(&pid);
            return Err(SessionError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&pid);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Route a response frame back to its waiting `request` call. Returns
    /// `false` if no pending entry was found (a late arrival after the
    /// request already timed out) — the caller should log and discard.
    pub fn resolve(&self, pid: u16, result: Result<Package, SessionError>) -> bool {
        let waiter = self.pending.lock().unwrap().remove(&pid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameDecoder, Package};
    use std::time::Duration;

    /// Wires a Session to an in-memory loopback: bytes written by the
    /// session are decoded and, if the `tp` has the response bit set,
    /// echoed back into the session via `resolve`.
    fn make_loopback_session() -> std::sync::Arc<Session> {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let session = std::sync::Arc::new(Session::new(write_tx));
        let session_clone = session.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            while let Some(bytes) = write_rx.recv().await {
                for pkg in decoder.feed(&bytes) {
                    if pkg.pid != 0 {
                        let echo = Package::make_binary(0x81, pkg.body.clone()).with_pid(pkg.pid);
                        session_clone.resolve(pkg.pid, Ok(echo));
                    }
                }
            }
        });
        session
    }

    #[tokio::test]
    async fn request_resolves_with_response() {
        let session = make_loopback_session();
        let pkg = Package::make_binary(0x01, vec![1, 2, 3]);
        let resp = session.request(pkg, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pid_never_reused_while_pending() {
        let (write_tx, _write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let session = Session::new(write_tx);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let pid = session.allocate_pid();
            assert!(pid != 0);
            assert!(seen.insert(pid));
        }
    }

    #[tokio::test]
    async fn request_times_out_when_unanswered() {
        let (write_tx, _write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let session = Session::new(write_tx);
        let pkg = Package::make_binary(0x01, vec![]);
        let result = session.request(pkg, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test]
    async fn late_resolve_after_timeout_is_reported_as_not_found() {
        let (write_tx, _write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let session = Session::new(write_tx);
        let pkg = Package::make_binary(0x01, vec![]);
        let _ = session.request(pkg, Duration::from_millis(10)).await;
        // the pending entry was already removed by the timeout path
        let found = session.resolve(1, Ok(Package::make_binary(0x81, vec![])));
        assert!(!found);
    }
}

//! TLS dial-reconnect loop, announce handshake, bounded outbound queue with
//! drop-oldest admission, and the drain/ensure-write loop that gives
//! at-least-once delivery to the hub. Also owns the reader task that
//! dispatches every frame the hub sends us (`RES_ANNOUNCE`, asset updates,
//! `REQ_INFO`, `REQ_RAPP`) back into [`SharedState`].

use crate::codec::{FrameDecoder, Package};
use crate::config::Config;
use crate::error::{CoreError, SessionError};
use crate::session::Session;
use crate::state::SharedState;
use crate::wire::{self, hub as tp, AgentcoreId, AssetRecord, PeerEntry};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_rustls::{rustls, TlsConnector};

pub const QUEUE_CAPACITY: usize = 100_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
const HUB_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_RETRY_SLEEP: Duration = Duration::from_secs(1);
const MAX_ERR: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(128);

/// Pins the hub TLS connection to a single self-signed certificate file,
/// the same trust model as the original's `check_hostname = False` +
/// `load_verify_locations(path)`: the exact certificate is trusted,
/// independent of the name the peer presents.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned_der: Vec<u8>,
    provider: rustls::crypto::CryptoProvider,
}

impl PinnedCertVerifier {
    fn new(pinned: CertificateDer<'static>) -> Self {
        PinnedCertVerifier {
            pinned_der: pinned.as_ref().to_vec(),
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned_der.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "hub certificate does not match the pinned certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn ensure_crypto_provider_installed() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn load_pinned_cert(path: &std::path::Path) -> Result<CertificateDer<'static>, CoreError> {
    let bytes = std::fs::read(path)?;
    let mut reader = std::io::Cursor::new(bytes);
    let mut certs = rustls_pemfile::certs(&mut reader);
    match certs.next() {
        Some(Ok(cert)) => Ok(cert),
        Some(Err(e)) => Err(CoreError::Io(e)),
        None => Err(CoreError::Config(format!(
            "no certificate found in {}",
            path.display()
        ))),
    }
}

fn build_tls_connector(pinned: CertificateDer<'static>) -> TlsConnector {
    ensure_crypto_provider_installed();
    let verifier = Arc::new(PinnedCertVerifier::new(pinned));
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Bounded outbound queue with drop-oldest admission on the producer side
/// only (probe sessions), per §5's resource limits.
struct BoundedQueue {
    inner: Mutex<VecDeque<Package>>,
    capacity: usize,
    notify: Notify,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        BoundedQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
        }
    }

    async fn push(&self, pkg: Package) {
        let mut q = self.inner.lock().await;
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(pkg);
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Package {
        loop {
            {
                let mut q = self.inner.lock().await;
                if let Some(pkg) = q.pop_front() {
                    return pkg;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn drain_all(&self) -> Vec<Package> {
        let mut q = self.inner.lock().await;
        q.drain(..).collect()
    }

    async fn restore(&self, items: Vec<Package>) {
        let mut q = self.inner.lock().await;
        for pkg in items.into_iter().take(self.capacity) {
            q.push_back(pkg);
        }
    }
}

/// Owns the hub TLS session, the outbound queue, and the reconnect/drain
/// background tasks. One instance lives for the process lifetime.
pub struct HubClient {
    config: Arc<Config>,
    state: Arc<SharedState>,
    build_version: String,
    queue: BoundedQueue,
    session: RwLock<Option<Arc<Session>>>,
    writer_abort: Mutex<Option<tokio::task::AbortHandle>>,
    reader_abort: Mutex<Option<tokio::task::AbortHandle>>,
    connecting: AtomicBool,
    current: Mutex<Option<Package>>,
}

impl HubClient {
    pub fn new(config: Arc<Config>, state: Arc<SharedState>, build_version: String) -> Arc<Self> {
        Arc::new(HubClient {
            config,
            state,
            build_version,
            queue: BoundedQueue::new(QUEUE_CAPACITY),
            session: RwLock::new(None),
            writer_abort: Mutex::new(None),
            reader_abort: Mutex::new(None),
            connecting: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Enqueue a package produced by a probe's `FAF_DUMP`; drop-oldest on
    /// overflow, retried once per §4.5/§7.
    pub async fn enqueue(&self, pkg: Package) {
        self.queue.push(pkg).await;
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Spawn the reconnect loop and the drain loop. Call once at startup,
    /// after an existing queue file (if any) has been restored via
    /// [`HubClient::load_queue`].
    pub fn start(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let reconnect = tokio::spawn(self.clone().reconnect_loop());
        let drain = tokio::spawn(self.drain_loop());
        (reconnect, drain)
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut step = INITIAL_BACKOFF;
        loop {
            if !self.is_connected().await && !self.connecting.load(Ordering::SeqCst) {
                tokio::spawn(self.clone().connect());
                step = (step * 2).min(MAX_BACKOFF);
            } else {
                step = INITIAL_BACKOFF;
            }
            tokio::time::sleep(step).await;
        }
    }

    async fn connect(self: Arc<Self>) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let result = tokio::time::timeout(CONNECT_TIMEOUT, self.clone().dial()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "connecting to hub failed");
                self.fall_back_to_snapshot().await;
            }
            Err(_) => {
                tracing::error!("connecting to hub timed out");
                self.fall_back_to_snapshot().await;
            }
        }

        self.connecting.store(false, Ordering::SeqCst);
    }

    /// After a failed connect, re-program probes from the last good
    /// snapshot so they keep working through a hub outage.
    async fn fall_back_to_snapshot(&self) {
        self.state.load_probe_assets().await;
        self.state.remove_assets_fn();
    }

    async fn dial(self: Arc<Self>) -> Result<(), CoreError> {
        let pinned = load_pinned_cert(&self.config.hub_crt_path)?;
        let connector = build_tls_connector(pinned);

        let tcp = TcpStream::connect((self.config.hub_host.as_str(), self.config.hub_port)).await?;
        let server_name = ServerName::try_from(self.config.hub_host.clone())
            .unwrap_or_else(|_| ServerName::try_from("hub").unwrap());
        let tls = connector.connect(server_name, tcp).await?;

        let (mut read_half, mut write_half) = tokio::io::split(tls);
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let session = Arc::new(Session::new(write_tx));

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        *self.session.write().await = Some(session.clone());
        *self.writer_abort.lock().await = Some(writer_task.abort_handle());

        let agentcore_id = self.state.agentcore_id().await;
        let announce_pkg = Package::make(
            tp::REQ_ANNOUNCE,
            &(
                agentcore_id,
                self.state.name.clone(),
                self.state.zone,
                self.state.token.clone(),
            ),
        )?;

        let announce = session.request(announce_pkg, ANNOUNCE_TIMEOUT);

        let state = self.state.clone();
        let build_version = self.build_version.clone();
        let self_for_reader = self.clone();
        let reader_session = session.clone();
        let reader_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for pkg in decoder.feed(&buf[..n]) {
                    handle_frame(&state, &reader_session, &build_version, pkg).await;
                }
            }
            self_for_reader.on_disconnected().await;
        });
        *self.reader_abort.lock().await = Some(reader_task.abort_handle());

        match announce.await {
            Ok(_) => {
                tracing::info!("hub announce succeeded");
                self.persist_agentcore_id_if_new().await?;
                self.state.remove_assets_fn();
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to announce");
                self.close_session().await;
                Err(CoreError::Session(e))
            }
        }
    }

    async fn persist_agentcore_id_if_new(&self) -> Result<(), CoreError> {
        let Some(id) = self.state.agentcore_id().await else {
            return Ok(());
        };
        let path = self.config.agentcore_json_path();
        let previous = std::fs::read(&path)
            .ok()
            .and_then(|b| serde_json::from_slice::<Option<AgentcoreId>>(&b).ok())
            .flatten();
        if previous == Some(id) {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&Some(id))?;
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    /// `.agentcore.json`'s parsed value, read once at startup so the id
    /// survives a restart; `None` before the very first successful
    /// announce.
    pub fn read_persisted_id(path: &std::path::Path) -> Option<AgentcoreId> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice::<Option<AgentcoreId>>(&bytes)
            .ok()
            .flatten()
    }

    async fn close_session(&self) {
        *self.session.write().await = None;
        if let Some(h) = self.writer_abort.lock().await.take() {
            h.abort();
        }
        if let Some(h) = self.reader_abort.lock().await.take() {
            h.abort();
        }
    }

    async fn on_disconnected(&self) {
        tracing::warn!("hub connection lost");
        self.close_session().await;
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let pkg = self.queue.pop().await;
            let wrapped = Package::make_binary(tp::REQ_DATA, pkg.body.clone()).with_partid(pkg.partid);
            *self.current.lock().await = Some(pkg);
            self.ensure_write(wrapped).await;
            *self.current.lock().await = None;
        }
    }

    /// Retry a single package until the hub acknowledges it or permanently
    /// abandons it, per §4.7's ensure-write contract. `err_count` is local
    /// to this call — each package gets its own run at the "every fifth
    /// consecutive" force-reconnect/give-up boundary.
    async fn ensure_write(&self, pkg: Package) {
        let mut err_count: u32 = 0;
        loop {
            let session = self.session.read().await.clone();
            let Some(session) = session else {
                tokio::time::sleep(DRAIN_RETRY_SLEEP).await;
                continue;
            };

            match session.request(pkg.clone(), HUB_WRITE_TIMEOUT).await {
                Ok(_) => {
                    tracing::debug!("successfully sent data to hub");
                    return;
                }
                Err(SessionError::PeerError(msg)) => {
                    tracing::error!(error = %msg, "error from hub; abandoning package");
                    return;
                }
                Err(SessionError::Timeout) => {
                    err_count += 1;
                    tracing::error!("request timed out writing to hub");
                    if err_count % MAX_ERR == 0 {
                        tracing::warn!("too many request timeout errors; forcing a re-connect");
                        self.close_session().await;
                    }
                }
                Err(e) => {
                    err_count += 1;
                    tracing::error!(error = %e, "error writing to hub");
                    if err_count % MAX_ERR == 0 {
                        tracing::error!("too many errors; skip this request");
                        return;
                    }
                }
            }
            tokio::time::sleep(DRAIN_RETRY_SLEEP).await;
        }
    }

    /// External collaborator boundary: the probe-facing upload/download
    /// primitives are implemented outside this core; here we only bridge
    /// the probe's request onto the live hub session as an opaque request.
    pub async fn upload_file(&self, data: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        self.bridge_file_request(tp::REQ_DATA, data).await
    }

    pub async fn download_file(&self, data: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        self.bridge_file_request(tp::REQ_DATA, data).await
    }

    async fn bridge_file_request(&self, tp: u8, data: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::Protocol("hub not connected".into()))?;
        let pkg = Package::make(tp, &data)?;
        let resp = session
            .request(pkg, HUB_WRITE_TIMEOUT)
            .await
            .map_err(CoreError::Session)?;
        Ok(resp.read_data().unwrap_or(serde_json::Value::Null))
    }

    pub fn queue_path(&self) -> std::path::PathBuf {
        self.config.queue_path()
    }

    /// Restore a spilled queue at startup, capped at the queue capacity,
    /// and remove the spill file.
    pub async fn load_queue(&self) {
        let path = self.queue_path();
        if !path.exists() {
            tracing::info!("no queue file");
            return;
        }
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed loading queue");
                return;
            }
        };
        let raw: Vec<Vec<u8>> = match rmp_serde::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed loading queue");
                return;
            }
        };
        let mut decoder = FrameDecoder::new();
        let mut packages = Vec::with_capacity(raw.len());
        for barray in &raw {
            for pkg in decoder.feed(barray) {
                packages.push(pkg);
            }
        }
        let count = packages.len();
        self.queue.restore(packages).await;
        tracing::info!(count, "read package(s) for queue at startup");

        if let Err(e) = std::fs::remove_file(&path) {
            tracing::error!(path = %path.display(), error = %e, "failed to remove queue file");
        } else {
            tracing::info!(path = %path.display(), "removed queue file");
        }
    }

    /// Spill the package currently being drained (if any) followed by the
    /// rest of the queue to `queue.mp`, called on shutdown.
    pub async fn dump_queue(&self) {
        let path = self.queue_path();
        tracing::info!(path = %path.display(), "write queue to disk");

        let mut raw: Vec<Vec<u8>> = Vec::new();
        if let Some(pkg) = self.current.lock().await.take() {
            raw.push(pkg.to_bytes());
        }
        for pkg in self.queue.drain_all().await {
            raw.push(pkg.to_bytes());
        }

        match rmp_serde::to_vec(&raw) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::error!(path = %path.display(), error = %e, "failed to write queue file");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode queue"),
        }
    }

    pub async fn shutdown(&self) {
        self.close_session().await;
        self.dump_queue().await;
    }
}

/// Dispatch a single frame received from the hub session. Shared between
/// the reader task and tests.
async fn handle_frame(state: &Arc<SharedState>, session: &Arc<Session>, build_version: &str, pkg: Package) {
    match pkg.tp {
        tp::RES_ANNOUNCE => on_res_announce(state, session, pkg).await,
        tp::FAF_SET_ASSETS => on_faf_set_assets(state, pkg).await,
        tp::REQ_INFO => on_req_info(state, session, build_version, pkg).await,
        tp::FAF_UPSERT_ASSET => on_faf_upsert_asset(state, pkg).await,
        tp::FAF_UNSET_ASSETS => on_faf_unset_assets(state, pkg).await,
        tp::REQ_RAPP => on_req_rapp(state, session, pkg).await,
        tp::RES_ERR => {
            let msg: String = pkg.read_data().unwrap_or_else(|_| "peer error".into());
            session.resolve(pkg.pid, Err(SessionError::PeerError(msg)));
        }
        tp::RES_OK => {
            let pid = pkg.pid;
            session.resolve(pid, Ok(pkg));
        }
        other => tracing::error!(tp = other, "unhandled package type"),
    }
}

async fn on_res_announce(state: &Arc<SharedState>, session: &Arc<Session>, pkg: Package) {
    let (agentcore_id, peers, assets): (AgentcoreId, Vec<PeerEntry>, Vec<AssetRecord>) =
        match pkg.read_data() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "ac announce failed");
                return;
            }
        };
    tracing::info!(agentcore_id, num_assets = assets.len(), num_agentcores = peers.len(), "ac announce");
    state.set_agentcore_id(agentcore_id).await;
    state.set_zones(&peers).await;
    state.set_assets(&assets).await;
    session.resolve(pkg.pid, Ok(pkg));
}

async fn on_faf_set_assets(state: &Arc<SharedState>, pkg: Package) {
    let (peers, assets): (Vec<PeerEntry>, Vec<AssetRecord>) = match pkg.read_data() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "ac set assets failed");
            return;
        }
    };
    tracing::info!(num_assets = assets.len(), "ac set assets");
    state.set_zones(&peers).await;
    state.set_assets(&assets).await;
}

async fn on_faf_upsert_asset(state: &Arc<SharedState>, pkg: Package) {
    let asset: AssetRecord = match pkg.read_data() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "ac upsert asset failed");
            return;
        }
    };
    tracing::info!(asset_id = asset.0, "ac upsert asset");
    state.upsert_asset(&asset).await;
}

async fn on_faf_unset_assets(state: &Arc<SharedState>, pkg: Package) {
    let asset_ids: Vec<wire::AssetId> = match pkg.read_data() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "ac unset assets failed");
            return;
        }
    };
    tracing::info!(num_assets = asset_ids.len(), "ac unset assets");
    state.unset_assets(&asset_ids).await;
}

async fn on_req_info(state: &Arc<SharedState>, session: &Arc<Session>, build_version: &str, pkg: Package) {
    tracing::debug!("ac heartbeat");
    let info = crate::heartbeat::collect(state, build_version).await;
    match Package::make(tp::RES_INFO, &info) {
        Ok(resp) => {
            let _ = session.respond(resp.with_pid(pkg.pid));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode heartbeat response"),
    }
}

async fn on_req_rapp(state: &Arc<SharedState>, session: &Arc<Session>, pkg: Package) {
    #[derive(serde::Deserialize)]
    struct ReqRapp {
        protocol: u8,
        data: Option<serde_json::Value>,
    }
    let req: ReqRapp = match pkg.read_data() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "ac rapp request decode failed");
            return;
        }
    };
    let envelope = crate::rapp::proxy_request(state, req.protocol, req.data).await;
    match Package::make(tp::RES_RAPP, &envelope) {
        Ok(resp) => {
            let _ = session.respond(resp.with_pid(pkg.pid));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode rapp response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pkg(tp: u8, seq: u8) -> Package {
        Package::make_binary(tp, vec![seq])
    }

    #[tokio::test]
    async fn queue_drops_oldest_beyond_capacity() {
        let queue = BoundedQueue::new(3);
        for i in 0..4u8 {
            queue.push(make_pkg(0, i)).await;
        }
        assert_eq!(queue.len().await, 3);
        let head = queue.pop().await;
        assert_eq!(head.body, vec![1]);
    }

    #[tokio::test]
    async fn queue_bound_property_100_001_enqueues() {
        let queue = BoundedQueue::new(QUEUE_CAPACITY);
        for i in 0..(QUEUE_CAPACITY + 1) {
            queue.push(Package::make_binary(0, (i as u32).to_le_bytes().to_vec())).await;
        }
        assert_eq!(queue.len().await, QUEUE_CAPACITY);
        let head = queue.pop().await;
        assert_eq!(u32::from_le_bytes(head.body.try_into().unwrap()), 1);
    }

    #[tokio::test]
    async fn dump_and_restore_round_trips() {
        let queue = BoundedQueue::new(10);
        for i in 0..5u8 {
            queue.push(make_pkg(1, i)).await;
        }
        let items = queue.drain_all().await;
        assert!(queue.len().await == 0);
        let restored = BoundedQueue::new(10);
        restored.restore(items).await;
        assert_eq!(restored.len().await, 5);
    }
}

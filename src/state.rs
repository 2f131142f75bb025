//! Authoritative in-memory asset table and its fan-out to connected probe
//! sessions. This is the busiest component: every hub-driven asset update
//! (`set_assets`/`upsert_asset`/`unset_assets`) flows through here and out
//! to whichever probe sessions are currently live.

use crate::codec::Package;
use crate::hub_client::HubClient;
use crate::session::Session;
use crate::wire::{self, AssetId, AssetRecord, CheckEntry, PeerEntry, ProbeTable, ZoneId};
use crate::zones::Zones;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A live probe collector connection, as seen by the dispatcher.
pub struct ProbeHandle {
    pub probe_key: String,
    pub version: String,
    pub session: Arc<Session>,
}

/// Process-wide singleton. Everything here is behind a lock because more
/// than one task reaches in: the hub session on asset updates, probe
/// sessions on connect/disconnect, and the heartbeat aggregator on read.
pub struct SharedState {
    pub name: String,
    pub zone: ZoneId,
    pub token: String,
    pub assets_path: PathBuf,

    agentcore_id: RwLock<Option<wire::AgentcoreId>>,
    zones: RwLock<Option<Zones>>,
    probe_assets: RwLock<ProbeTable>,
    probe_connections: RwLock<HashMap<u64, ProbeHandle>>,
    rapp: RwLock<Option<Arc<Session>>>,
    hub: RwLock<Option<Arc<HubClient>>>,
    next_conn_id: AtomicU64,
}

impl SharedState {
    pub fn new(name: String, zone: ZoneId, token: String, assets_path: PathBuf) -> Self {
        SharedState {
            name,
            zone,
            token,
            assets_path,
            agentcore_id: RwLock::new(None),
            zones: RwLock::new(None),
            probe_assets: RwLock::new(ProbeTable::new()),
            probe_connections: RwLock::new(HashMap::new()),
            rapp: RwLock::new(None),
            hub: RwLock::new(None),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub async fn set_hub(&self, hub: Arc<HubClient>) {
        *self.hub.write().await = Some(hub);
    }

    pub async fn hub(&self) -> Option<Arc<HubClient>> {
        self.hub.read().await.clone()
    }

    pub async fn agentcore_id(&self) -> Option<wire::AgentcoreId> {
        *self.agentcore_id.read().await
    }

    pub async fn set_agentcore_id(&self, id: wire::AgentcoreId) {
        *self.agentcore_id.write().await = Some(id);
    }

    /// Rebuild the peer assignment. Precondition: `agentcore_id` has
    /// already been set by a successful announce.
    pub async fn set_zones(&self, peers: &[PeerEntry]) {
        let agentcore_id = self
            .agentcore_id()
            .await
            .expect("agentcore_id must be set before set_zones");
        let zones = Zones::new(agentcore_id, self.zone, peers);
        *self.zones.write().await = Some(zones);
    }

    async fn send_to_all_probes(&self, make: impl Fn(&str) -> Option<Package>) {
        let conns = self.probe_connections.read().await;
        for handle in conns.values() {
            if let Some(pkg) = make(&handle.probe_key) {
                if let Err(e) = handle.session.send(pkg) {
                    tracing::warn!(probe_key = %handle.probe_key, error = %e, "failed to push to probe");
                }
            }
        }
    }

    /// Full replace: assets we don't own are dropped, the rest flattened
    /// into the probe table, and every connected probe gets the slice
    /// belonging to its own `probe_key` (possibly empty).
    pub async fn set_assets(&self, assets: &[AssetRecord]) {
        let owned_zones = self.zones.read().await;
        let zones = owned_zones.as_ref().expect("zones must be set after announce");

        let mut new_table = ProbeTable::new();
        for asset in assets {
            let AssetRecord(asset_id, asset_zone, ..) = asset;
            if !zones.has_asset(*asset_id, *asset_zone) {
                continue;
            }
            for (probe_key, entries) in wire::flatten_asset(asset) {
                new_table.entry(probe_key).or_default().extend(entries);
            }
        }
        drop(owned_zones);

        *self.probe_assets.write().await = new_table.clone();

        self.send_to_all_probes(|probe_key| {
            let entries = new_table.get(probe_key).cloned().unwrap_or_default();
            Package::make(wire::probe::FAF_SET_ASSETS, &entries).ok()
        })
        .await;
    }

    fn remove_asset_everywhere(table: &mut ProbeTable, asset_id: AssetId) {
        for entries in table.values_mut() {
            entries.retain(|e| e.asset_id() != asset_id);
        }
    }

    /// Update or add a single asset: first evict every existing entry for
    /// `asset_id` from every probe's list, then either broadcast an unset
    /// (if we no longer own it) or rebuild and broadcast the new entries.
    pub async fn upsert_asset(&self, asset: &AssetRecord) {
        let AssetRecord(asset_id, asset_zone, ..) = *asset;

        {
            let mut table = self.probe_assets.write().await;
            Self::remove_asset_everywhere(&mut table, asset_id);
        }

        let owns = {
            let owned_zones = self.zones.read().await;
            owned_zones
                .as_ref()
                .expect("zones must be set after announce")
                .has_asset(asset_id, asset_zone)
        };

        if !owns {
            self.send_to_all_probes(|_| {
                Package::make(wire::probe::FAF_UNSET_ASSETS, &vec![asset_id]).ok()
            })
            .await;
            return;
        }

        let flattened = wire::flatten_asset(asset);
        {
            let mut table = self.probe_assets.write().await;
            for (probe_key, entries) in &flattened {
                table
                    .entry(probe_key.clone())
                    .or_default()
                    .extend(entries.iter().cloned());
            }
        }

        self.send_to_all_probes(|probe_key| {
            let entries = flattened.get(probe_key).cloned().unwrap_or_default();
            Package::make(wire::probe::FAF_UPSERT_ASSET, &(asset_id, entries)).ok()
        })
        .await;
    }

    /// Remove every check entry for the given asset ids and broadcast the
    /// unset to every live probe session.
    pub async fn unset_assets(&self, asset_ids: &[AssetId]) {
        {
            let mut table = self.probe_assets.write().await;
            for &asset_id in asset_ids {
                Self::remove_asset_everywhere(&mut table, asset_id);
            }
        }
        let ids = asset_ids.to_vec();
        self.send_to_all_probes(move |_| Package::make(wire::probe::FAF_UNSET_ASSETS, &ids).ok())
            .await;
    }

    /// probe_keys that currently have at least one check entry.
    pub async fn required_probes(&self) -> std::collections::HashSet<String> {
        self.probe_assets
            .read()
            .await
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Current check list for a probe_key, used to answer its announce.
    pub async fn checks_for(&self, probe_key: &str) -> Vec<CheckEntry> {
        self.probe_assets
            .read()
            .await
            .get(probe_key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn dump_probe_assets(&self) {
        let table = self.probe_assets.read().await;
        tracing::info!(path = %self.assets_path.display(), "write assets to disk");
        let bytes = match rmp_serde::to_vec(&*table) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode assets");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.assets_path, bytes) {
            tracing::error!(path = %self.assets_path.display(), error = %e, "failed to write assets file");
        }
    }

    /// Fallback after a hub connect attempt fails: restore the last good
    /// snapshot so probes keep working, then push it out to whichever
    /// probes are already connected.
    pub async fn load_probe_assets(&self) {
        tracing::warn!(path = %self.assets_path.display(), "load assets from disk");
        let bytes = match std::fs::read(&self.assets_path) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(path = %self.assets_path.display(), error = %e, "failed to read assets file");
                return;
            }
        };
        let loaded: ProbeTable = match rmp_serde::from_slice(&bytes) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode assets file");
                return;
            }
        };
        {
            let mut table = self.probe_assets.write().await;
            for (k, v) in &loaded {
                table.insert(k.clone(), v.clone());
            }
        }
        self.send_to_all_probes(|probe_key| {
            loaded
                .get(probe_key)
                .map(|entries| Package::make(wire::probe::FAF_SET_ASSETS, entries).ok())
                .flatten()
        })
        .await;
    }

    pub fn remove_assets_fn(&self) {
        if self.assets_path.exists() {
            match std::fs::remove_file(&self.assets_path) {
                Ok(()) => tracing::info!(path = %self.assets_path.display(), "removed assets file"),
                Err(e) => tracing::error!(path = %self.assets_path.display(), error = %e, "failed to remove assets file"),
            }
        }
    }

    /// Register a newly-announced probe session. Returns `false` (and
    /// registers nothing) if another live session already holds this
    /// `probe_key` — the caller must close the new socket.
    pub async fn register_probe(&self, probe_key: String, version: String, session: Arc<Session>) -> Option<u64> {
        let mut conns = self.probe_connections.write().await;
        if conns.values().any(|h| h.probe_key == probe_key) {
            return None;
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        conns.insert(
            id,
            ProbeHandle {
                probe_key,
                version,
                session,
            },
        );
        Some(id)
    }

    pub async fn remove_probe(&self, conn_id: u64) {
        self.probe_connections.write().await.remove(&conn_id);
    }

    pub async fn probe_sessions(&self) -> Vec<(String, String, Arc<Session>)> {
        self.probe_connections
            .read()
            .await
            .values()
            .map(|h| (h.probe_key.clone(), h.version.clone(), h.session.clone()))
            .collect()
    }

    pub async fn set_rapp(&self, session: Arc<Session>) -> bool {
        let mut rapp = self.rapp.write().await;
        if rapp.is_some() {
            return false;
        }
        *rapp = Some(session);
        true
    }

    pub async fn clear_rapp(&self, session: &Arc<Session>) {
        let mut rapp = self.rapp.write().await;
        if let Some(current) = rapp.as_ref() {
            if Arc::ptr_eq(current, session) {
                *rapp = None;
            }
        }
    }

    pub async fn rapp(&self) -> Option<Arc<Session>> {
        self.rapp.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{AssetRecord, HubCheck, HubProbe};
    use tokio::sync::mpsc;

    fn make_state() -> SharedState {
        SharedState::new("agent-1".into(), 0, "tok".into(), PathBuf::from("/tmp/does-not-exist.mp"))
    }

    fn sample_asset(id: AssetId, zone: ZoneId) -> AssetRecord {
        AssetRecord(
            id,
            zone,
            format!("asset-{id}"),
            vec![HubProbe(
                "wmi-probe".into(),
                None,
                vec![HubCheck(1, "cpu".into(), 30, None)],
            )],
        )
    }

    #[tokio::test]
    async fn set_assets_skips_unowned_and_routes_owned() {
        let state = make_state();
        state.set_agentcore_id(10).await;
        state.set_zones(&[(10, 0), (20, 0)]).await;

        let assets = vec![sample_asset(100, 0), sample_asset(101, 0)];
        state.set_assets(&assets).await;

        let checks = state.checks_for("wmi-probe").await;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].path, (100, 1));
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let state = make_state();
        state.set_agentcore_id(10).await;
        state.set_zones(&[(10, 0)]).await;

        let asset = sample_asset(100, 0);
        state.upsert_asset(&asset).await;
        let first = state.checks_for("wmi-probe").await;
        state.upsert_asset(&asset).await;
        let second = state.checks_for("wmi-probe").await;
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].config, second[0].config);
    }

    #[tokio::test]
    async fn unset_is_inverse_of_set() {
        let state = make_state();
        state.set_agentcore_id(10).await;
        state.set_zones(&[(10, 0)]).await;

        state.set_assets(&[sample_asset(100, 0)]).await;
        assert_eq!(state.checks_for("wmi-probe").await.len(), 1);

        state.unset_assets(&[100]).await;
        assert_eq!(state.checks_for("wmi-probe").await.len(), 0);
    }

    #[tokio::test]
    async fn double_announce_with_same_probe_key_is_rejected() {
        let state = make_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(tx));
        let id1 = state
            .register_probe("wmi-probe".into(), "1.0".into(), session.clone())
            .await;
        assert!(id1.is_some());
        let id2 = state
            .register_probe("wmi-probe".into(), "1.0".into(), session)
            .await;
        assert!(id2.is_none());
    }
}

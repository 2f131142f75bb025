//! Protocol `tp` code tables and the wire-level data model shapes (asset
//! records, check entries, peer entries) shared by every link.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Hub protocol message types.
pub mod hub {
    pub const REQ_DATA: u8 = 0x00;
    pub const REQ_ANNOUNCE: u8 = 0x01;
    pub const FAF_SET_ASSETS: u8 = 0x02;
    pub const REQ_INFO: u8 = 0x03;
    pub const FAF_UPSERT_ASSET: u8 = 0x04;
    pub const FAF_UNSET_ASSETS: u8 = 0x05;
    pub const REQ_RAPP: u8 = 0x06;
    pub const RES_ANNOUNCE: u8 = 0x81;
    pub const RES_INFO: u8 = 0x82;
    pub const RES_ERR: u8 = 0xe0;
    pub const RES_OK: u8 = 0xe1;
    pub const RES_RAPP: u8 = 0xe2;
}

/// Probe-server protocol message types.
pub mod probe {
    pub const FAF_DUMP: u8 = 0x00;
    pub const REQ_ANNOUNCE: u8 = 0x01;
    pub const FAF_SET_ASSETS: u8 = 0x02;
    pub const REQ_INFO: u8 = 0x03;
    pub const FAF_UPSERT_ASSET: u8 = 0x04;
    pub const FAF_UNSET_ASSETS: u8 = 0x05;
    pub const REQ_UPLOAD_FILE: u8 = 0x07;
    pub const REQ_DOWNLOAD_FILE: u8 = 0x08;
    pub const RES_ANNOUNCE: u8 = 0x81;
    pub const RES_INFO: u8 = 0x82;
    pub const RES_ERR: u8 = 0xe0;
    pub const RES_UPLOAD_FILE: u8 = 0xe3;
    pub const RES_DOWNLOAD_FILE: u8 = 0xe4;
}

/// Rapp protocol message types.
pub mod rapp {
    pub const RAPP_PING: u8 = 0x40;
    pub const RAPP_READ: u8 = 0x41;
    pub const RAPP_PUSH: u8 = 0x42;
    pub const RAPP_UPDATE: u8 = 0x43;
    pub const RAPP_LOG: u8 = 0x44;
    pub const RAPP_RES: u8 = 0x50;
    pub const RAPP_NO_AC: u8 = 0x51;
    pub const RAPP_NO_CONNECTION: u8 = 0x52;
    pub const RAPP_BUSY: u8 = 0x53;
    pub const RAPP_ERR: u8 = 0x54;
}

pub type AssetId = i64;
pub type CheckId = i64;
pub type ZoneId = i64;
pub type AgentcoreId = i64;

/// `(agentcore_id, zone)` — one entry in the announce response's peer list.
pub type PeerEntry = (AgentcoreId, ZoneId);

/// `[check_id, check_key, interval, check_config]` as received from the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubCheck(pub CheckId, pub String, pub i64, pub Option<serde_json::Value>);

/// `[probe_key, probe_config, checks]` as received from the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubProbe(
    pub String,
    pub Option<serde_json::Value>,
    pub Vec<HubCheck>,
);

/// `[asset_id, asset_zone, asset_name, probes]` — the asset record exactly
/// as the hub sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord(
    pub AssetId,
    pub ZoneId,
    pub String,
    pub Vec<HubProbe>,
);

/// `[asset_id, check_id]`.
pub type CheckPath = (AssetId, CheckId);
/// `[asset_name, check_key]`.
pub type CheckNames = (String, String);

/// A single stored check entry: `[path, names, config]`. `config` always
/// carries `_interval` plus the merged probe/check config (check_config
/// wins on key collision).
///
/// Serialized and deserialized by hand as a 3-tuple rather than the derived
/// named-struct form, so it stays positional on the wire regardless of
/// whether the surrounding [`crate::codec::Package`] packs named structs as
/// msgpack maps or arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckEntry {
    pub path: CheckPath,
    pub names: CheckNames,
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl CheckEntry {
    pub fn asset_id(&self) -> AssetId {
        self.path.0
    }
}

impl Serialize for CheckEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.path, &self.names, &self.config).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CheckEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (path, names, config): (
            CheckPath,
            CheckNames,
            serde_json::Map<String, serde_json::Value>,
        ) = Deserialize::deserialize(deserializer)?;
        Ok(CheckEntry {
            path,
            names,
            config,
        })
    }
}

/// `probe_key -> [check entries]`, insertion order preserved per key.
pub type ProbeTable = BTreeMap<String, Vec<CheckEntry>>;

fn merged_config(
    interval: i64,
    probe_config: &Option<serde_json::Value>,
    check_config: &Option<serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut config = serde_json::Map::new();
    config.insert("_interval".to_string(), serde_json::Value::from(interval));
    if let Some(serde_json::Value::Object(m)) = probe_config {
        for (k, v) in m {
            config.insert(k.clone(), v.clone());
        }
    }
    if let Some(serde_json::Value::Object(m)) = check_config {
        for (k, v) in m {
            config.insert(k.clone(), v.clone());
        }
    }
    config
}

/// Flatten one asset record into `probe_key -> [check entries]`, per §3's
/// check-entry construction rule.
pub fn flatten_asset(asset: &AssetRecord) -> BTreeMap<String, Vec<CheckEntry>> {
    let AssetRecord(asset_id, _zone, asset_name, probes) = asset;
    let mut out: BTreeMap<String, Vec<CheckEntry>> = BTreeMap::new();
    for HubProbe(probe_key, probe_config, checks) in probes {
        let entries = out.entry(probe_key.clone()).or_default();
        for HubCheck(check_id, check_key, interval, check_config) in checks {
            entries.push(CheckEntry {
                path: (*asset_id, *check_id),
                names: (asset_name.clone(), check_key.clone()),
                config: merged_config(*interval, probe_config, check_config),
            });
        }
    }
    out
}

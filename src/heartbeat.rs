//! Parallel per-probe liveness polling, triggered by the hub's `REQ_INFO`.
//! Never fails as a whole: a single probe timing out just shows up with
//! `timestamp = 1` and in `missing`.

use crate::state::SharedState;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeInfo {
    pub key: String,
    pub version: String,
    pub timestamp: f64,
    pub roundtrip: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatInfo {
    pub missing: Vec<String>,
    pub probes: Vec<ProbeInfo>,
    pub timestamp: f64,
    pub version: String,
}

fn now_wall_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Poll every connected probe in parallel and assemble the `RES_INFO`
/// payload. `build_version` is the crate's own version string.
pub async fn collect(state: &Arc<SharedState>, build_version: &str) -> HeartbeatInfo {
    let sessions = state.probe_sessions().await;
    let required = state.required_probes().await;

    let mut tasks = Vec::with_capacity(sessions.len());
    for (probe_key, version, session) in sessions {
        tasks.push(tokio::spawn(crate::probe_server::heartbeat_one(
            probe_key, version, session,
        )));
    }

    let mut probes = Vec::with_capacity(tasks.len());
    let mut seen: HashSet<String> = HashSet::new();
    for task in tasks {
        match task.await {
            Ok(info) => {
                seen.insert(info.key.clone());
                probes.push(info);
            }
            Err(e) => tracing::error!(error = %e, "heartbeat task panicked"),
        }
    }

    let missing: Vec<String> = required.difference(&seen).cloned().collect();

    HeartbeatInfo {
        missing,
        probes,
        timestamp: now_wall_seconds(),
        version: build_version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn heartbeat_never_fails_and_reports_missing() {
        let state = Arc::new(SharedState::new(
            "agent-1".into(),
            0,
            "tok".into(),
            PathBuf::from("/tmp/does-not-exist.mp"),
        ));
        state.set_agentcore_id(1).await;
        state.set_zones(&[(1, 0)]).await;
        state
            .set_assets(&[crate::wire::AssetRecord(
                100,
                0,
                "a".into(),
                vec![crate::wire::HubProbe(
                    "wmi-probe".into(),
                    None,
                    vec![crate::wire::HubCheck(1, "cpu".into(), 30, None)],
                )],
            )])
            .await;

        // no actual probe connection: required_probes() has an entry but
        // probe_sessions() is empty, so it must appear in `missing`.
        let info = collect(&state, "0.1.0").await;
        assert_eq!(info.probes.len(), 0);
        assert_eq!(info.missing, vec!["wmi-probe".to_string()]);
    }
}

//! End-to-end scenarios against a real TCP probe server: an actual socket
//! connects, announces, and observes asset fan-out exactly as a probe
//! collector would.

use agentcore::codec::{FrameDecoder, Package};
use agentcore::state::SharedState;
use agentcore::wire::{self, probe as tp, AssetRecord, CheckEntry, HubCheck, HubProbe};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_probe_server(state: Arc<SharedState>) -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            let state = state.clone();
            tokio::spawn(async move {
                let _ = agentcore::probe_server::serve_one(state, socket).await;
            });
        }
    });
    port
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

async fn write_pkg(stream: &mut TcpStream, pkg: Package) {
    stream.write_all(&pkg.to_bytes()).await.unwrap();
}

async fn read_pkg(stream: &mut TcpStream) -> Package {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("timed out waiting for a response")
            .unwrap();
        assert!(n > 0, "connection closed before a response arrived");
        let mut pkgs = decoder.feed(&buf[..n]);
        if !pkgs.is_empty() {
            return pkgs.remove(0);
        }
    }
}

fn new_state() -> Arc<SharedState> {
    Arc::new(SharedState::new(
        "agent-1".into(),
        0,
        "tok".into(),
        std::path::PathBuf::from("/tmp/agentcore-net-test-assets.mp"),
    ))
}

/// S1: a probe announces, gets an empty check list back, and a second
/// connection announcing under the same name is closed.
#[tokio::test]
async fn s1_announce_round_trip_and_duplicate_rejected() {
    let state = new_state();
    let port = start_probe_server(state).await;

    let mut conn1 = connect(port).await;
    let announce = Package::make(tp::REQ_ANNOUNCE, &("wmi-probe", "1.2.3")).unwrap().with_pid(1);
    write_pkg(&mut conn1, announce).await;

    let resp = read_pkg(&mut conn1).await;
    assert_eq!(resp.tp, tp::RES_ANNOUNCE);
    assert_eq!(resp.pid, 1);
    let checks: Vec<CheckEntry> = resp.read_data().unwrap();
    assert!(checks.is_empty());

    let mut conn2 = connect(port).await;
    let announce2 = Package::make(tp::REQ_ANNOUNCE, &("wmi-probe", "1.2.3")).unwrap().with_pid(1);
    write_pkg(&mut conn2, announce2).await;

    // the duplicate announce gets the connection closed rather than a reply
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), conn2.read(&mut buf))
        .await
        .expect("expected the duplicate connection to close promptly");
    assert_eq!(n.unwrap(), 0, "duplicate announce must close the socket");
}

/// S2: hub-delivered assets are sharded by zone and only the owned slice
/// is routed to the probe holding the matching `probe_key`.
#[tokio::test]
async fn s2_set_assets_routes_only_owned_checks() {
    let state = new_state();
    let port = start_probe_server(state.clone()).await;

    let mut conn = connect(port).await;
    let announce = Package::make(tp::REQ_ANNOUNCE, &("wmi-probe", "1.2.3")).unwrap().with_pid(1);
    write_pkg(&mut conn, announce).await;
    let _ = read_pkg(&mut conn).await;

    state.set_agentcore_id(10).await;
    state.set_zones(&[(10, 0), (20, 0)]).await;
    state
        .set_assets(&[
            AssetRecord(100, 0, "a".into(), vec![HubProbe("wmi-probe".into(), None, vec![HubCheck(1, "cpu".into(), 30, None)])]),
            AssetRecord(101, 0, "b".into(), vec![HubProbe("wmi-probe".into(), None, vec![HubCheck(2, "cpu".into(), 30, None)])]),
        ])
        .await;

    let pushed = read_pkg(&mut conn).await;
    assert_eq!(pushed.tp, tp::FAF_SET_ASSETS);
    let entries: Vec<CheckEntry> = pushed.read_data().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, (100, 1));
}

/// S3: an upsert evicts the asset's old entries everywhere, then either
/// broadcasts an unset (if ownership was lost) or the rebuilt entries.
#[tokio::test]
async fn s3_upsert_broadcasts_rebuilt_entries() {
    let state = new_state();
    let port = start_probe_server(state.clone()).await;

    let mut conn = connect(port).await;
    write_pkg(&mut conn, Package::make(tp::REQ_ANNOUNCE, &("wmi-probe", "1.2.3")).unwrap().with_pid(1)).await;
    let _ = read_pkg(&mut conn).await;

    state.set_agentcore_id(10).await;
    state.set_zones(&[(10, 0)]).await;
    state
        .set_assets(&[AssetRecord(100, 0, "a".into(), vec![HubProbe("wmi-probe".into(), None, vec![HubCheck(1, "cpu".into(), 30, None)])])])
        .await;
    let _ = read_pkg(&mut conn).await;

    state
        .upsert_asset(&AssetRecord(
            100,
            0,
            "a".into(),
            vec![HubProbe(
                "wmi-probe".into(),
                Some(serde_json::json!({"x": 1})),
                vec![HubCheck(1, "cpu".into(), 60, Some(serde_json::json!({"y": 2})))],
            )],
        ))
        .await;

    let pushed = read_pkg(&mut conn).await;
    assert_eq!(pushed.tp, tp::FAF_UPSERT_ASSET);
    let (asset_id, entries): (wire::AssetId, Vec<CheckEntry>) = pushed.read_data().unwrap();
    assert_eq!(asset_id, 100);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].config.get("_interval"), Some(&serde_json::json!(60)));
    assert_eq!(entries[0].config.get("x"), Some(&serde_json::json!(1)));
    assert_eq!(entries[0].config.get("y"), Some(&serde_json::json!(2)));
}

//! Process sharding against `sh` children that speak the line protocol.

#![cfg(unix)]

use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use ws_gateway_cluster::{Error, ProcessCluster, ProcessConfig, ProcessEvent};

/// Reports its range start with the credential, then echoes send lines back
/// as events. Arguments arrive as `--min A --max B --fork`.
const ECHO_CHILD: &str = r#"
read -r credential
printf '{"type":"event","shard":%s,"event":"ready","data":%s}\n' "$2" "$credential"
while read -r line; do
  printf '%s\n' "$line" | sed 's/"type":"send"/"type":"event","event":"echo"/'
done
"#;

fn config(script: &str) -> ProcessConfig {
    ProcessConfig {
        program: "sh".into(),
        args: vec!["-c".into(), script.into(), "child".into()],
        token: "child-token".to_string(),
        shard_count: Some(4),
        event_buffer: 64,
    }
}

async fn next_event(events: &mut broadcast::Receiver<ProcessEvent>) -> ProcessEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("no event within 10s")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_children_receive_credential_and_route_sends() {
    let mut processes = ProcessCluster::new(config(ECHO_CHILD), [2..4, 0..2]).unwrap();
    let mut events = processes.subscribe();

    assert!(matches!(
        processes.send(0, json!({})).await,
        Err(Error::Ipc(_))
    ));

    processes.start().await.unwrap();

    let mut ready = Vec::new();
    while ready.len() < 2 {
        if let ProcessEvent::Shard { shard_id, event, data } = next_event(&mut events).await {
            assert_eq!(event, "ready");
            assert_eq!(data["type"], "credential");
            assert_eq!(data["token"], "child-token");
            assert_eq!(data["shard_count"], 4);
            ready.push(shard_id);
        }
    }
    ready.sort();
    assert_eq!(ready, vec![0, 2]);

    processes
        .send(3, json!({"op": 3, "d": {"status": "idle"}}))
        .await
        .unwrap();
    let echo = next_event(&mut events).await;
    assert_eq!(
        echo,
        ProcessEvent::Shard {
            shard_id: 3,
            event: "echo".to_string(),
            data: json!({"op": 3, "d": {"status": "idle"}}),
        }
    );

    assert!(matches!(
        processes.send(4, json!({})).await,
        Err(Error::NoRoute(4))
    ));
}

#[tokio::test]
async fn test_child_exit_is_reported_without_restart() {
    let mut processes = ProcessCluster::new(config("read -r credential; exit 3"), [0..1]).unwrap();
    let mut events = processes.subscribe();
    processes.start().await.unwrap();

    let exited = next_event(&mut events).await;
    assert_eq!(
        exited,
        ProcessEvent::ChildExited {
            range: 0..1,
            status: Some(3),
        }
    );

    let nothing = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
    assert!(nothing.is_err());

    for _ in 0..2 {
        assert!(matches!(
            processes.send(0, json!({"op": 1, "d": null})).await,
            Err(Error::Ipc(_))
        ));
    }
}

#[test]
fn test_overlapping_ranges_rejected() {
    let result = ProcessCluster::new(config(ECHO_CHILD), [0..4, 3..6]);
    assert!(matches!(result, Err(Error::OverlappingRanges(_))));
}

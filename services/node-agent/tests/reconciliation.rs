//! Integration tests for the reconciliation flow.
//!
//! These drive the agent the way the orchestrator and the background loop
//! do, against the in-memory compositor:
//! 1. Pushed settings are converged immediately
//! 2. The periodic loop repairs drift and compositor restarts
//! 3. Playback survives a compositor restart

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use babel_id::CorrelationId;
use babel_node_agent::compositor::InputState;
use babel_node_agent::config::Config;
use babel_node_agent::media::PlaybackState;
use babel_node_agent::{MockCompositor, NodeAgent};
use babel_protocol::{commands, RpcRequest};
use serde_json::{json, Value};
use tokio::sync::watch;

fn test_config() -> Config {
    Config {
        lang: "Ita".to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        log_level: "debug".to_string(),
        media_dir: PathBuf::from("/srv/media"),
        reconcile_interval: Duration::from_secs(3),
    }
}

fn request(command: &str, details: Option<Value>) -> RpcRequest {
    RpcRequest {
        id: CorrelationId::new(),
        command: command.to_string(),
        details,
    }
}

fn feeds() -> Value {
    json!({
        "source": {"original_url": "srt://floor", "translation_url": "srt://booth"},
        "audio": {"original_volume": -6.0},
    })
}

#[tokio::test(start_paused = true)]
async fn loop_repairs_drift() {
    let mock = Arc::new(MockCompositor::with_defaults());
    let agent = NodeAgent::new(&test_config(), mock.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = agent.spawn(shutdown_rx);

    let applied = agent
        .handle(&request(commands::node::SET_CONFIG, Some(feeds())))
        .await;
    assert!(applied.status, "{}", applied.message);

    // Someone adds an input and changes a volume by hand.
    mock.seed_input("Browser", InputState::new("browser_source", json!({})));
    let mut original = mock.input("original").unwrap();
    original.volume = 0.0;
    mock.seed_input("original", original);
    mock.clear_calls();

    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(mock.input("Browser").is_none());
    assert_eq!(mock.input("original").unwrap().volume, -6.0);
    assert_eq!(
        mock.calls(),
        vec!["remove_input Browser", "set_input_volume original -6"]
    );

    shutdown_tx.send(true).unwrap();
    for (_, handle) in workers {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_compositor_is_retried_every_tick() {
    let mock = Arc::new(MockCompositor::with_defaults());
    let agent = NodeAgent::new(&test_config(), mock.clone());
    mock.set_reachable(false);

    let refused = agent
        .handle(&request(commands::node::SET_CONFIG, Some(feeds())))
        .await;
    assert!(!refused.status);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _workers = agent.spawn(shutdown_rx);
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(mock.input("original").is_none());

    mock.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(mock.input("original").is_some());
    assert!(mock.input("translation").is_some());
}

#[tokio::test(start_paused = true)]
async fn playback_survives_compositor_restart() {
    let mock = Arc::new(MockCompositor::with_defaults());
    mock.set_media_duration("talk.mp4", Duration::from_secs(60));
    let agent = NodeAgent::new(&test_config(), mock.clone());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _workers = agent.spawn(shutdown_rx);

    agent
        .handle(&request(commands::node::SET_CONFIG, Some(feeds())))
        .await;
    let played = agent
        .handle(&request(commands::node::RUN_MEDIA, Some(json!({"name": "talk.mp4"}))))
        .await;
    assert!(played.status, "{}", played.message);

    tokio::time::sleep(Duration::from_secs(20)).await;
    mock.restart();
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(mock.input("media").is_some());
    assert!(mock.input("original").unwrap().muted);
    let seeks = mock.seeks();
    assert_eq!(seeks.len(), 1);
    assert!(seeks[0].1 >= Duration::from_secs(20));

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(agent.player().state(), PlaybackState::Idle);
    assert!(mock.input("media").is_none());
    assert!(!mock.input("original").unwrap().muted);
}

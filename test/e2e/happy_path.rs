//! End-to-end happy path.
//!
//! A real orchestrator drives a real node agent (backed by the mock
//! compositor) over the control channel, while an operator session:
//!
//! 1. Logs in as admin
//! 2. Is refused media playback while the server sleeps
//! 3. Pulls the configuration file, which wakes the server, connects the
//!    node and pushes the settings
//! 4. Plays a clip and sees the node's start event as a broadcast
//! 5. Queries node info, stops the clip and disposes
//!
//! ## Running
//!
//! ```bash
//! cargo test -p babel-e2e --test happy_path
//! ```

use std::sync::Arc;
use std::time::Duration;

use babel_node_agent::{config::Config as NodeConfig, server, MockCompositor, NodeAgent};
use babel_orchestrator::{
    api,
    auth::{hash_password, Credential, Permissions},
    broadcast::{Broadcaster, NODE_EVENT},
    config::Config,
    importer::JsonFileSource,
    infrastructure::StaticProvisioner,
    logring::LogRing,
    state::AppState,
};
use babel_protocol::{Broadcast, CommandResult, Hello, SessionFrame};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const ADMIN: &str = "root";
const PASSWORD: &str = "pw";

/// Start a node agent for `lang`; returns its `host:port`.
async fn start_node(
    lang: &str,
    compositor: Arc<MockCompositor>,
    shutdown: watch::Receiver<bool>,
) -> String {
    let config = NodeConfig {
        lang: lang.to_string(),
        reconcile_interval: Duration::from_millis(200),
        ..NodeConfig::default()
    };
    let agent = Arc::new(NodeAgent::new(&config, compositor));
    agent.spawn(shutdown);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::create_router(agent);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr.to_string()
}

/// Start an orchestrator that knows one node; returns the session URL.
async fn start_orchestrator(
    nodes: Vec<(String, String)>,
    config_file: &std::path::Path,
    data_dir: &std::path::Path,
    shutdown: watch::Receiver<bool>,
) -> String {
    let config = Config {
        data_dir: data_dir.to_path_buf(),
        rpc_timeout: Duration::from_secs(3),
        provision_timeout: Duration::from_secs(3),
        broadcast_interval: Duration::from_millis(100),
        hook_workers: 1,
        ..Config::default()
    };
    let state = AppState::new(
        config.clone(),
        LogRing::new(256),
        Box::new(StaticProvisioner::new(nodes)),
        Some(Arc::new(JsonFileSource::new(config_file))),
    );
    state.users().replace(vec![Credential {
        login: ADMIN.into(),
        password_hash: hash_password(PASSWORD),
        permissions: Permissions::Admin,
    }]);

    let broadcaster = Broadcaster::new(
        state.registry().clone(),
        state.fleet().clone(),
        state.broadcasts().clone(),
        config.broadcast_interval,
    );
    tokio::spawn(broadcaster.run(shutdown));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/session")
}

/// An operator session. Broadcasts seen while waiting for a reply are kept.
struct Operator {
    client: Client,
    broadcasts: Vec<Broadcast>,
}

impl Operator {
    async fn login(url: &str) -> (Self, CommandResult) {
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let hello = serde_json::to_string(&Hello::credentials(ADMIN, PASSWORD)).unwrap();
        client.send(Message::Text(hello.into())).await.unwrap();
        let mut operator = Self {
            client,
            broadcasts: Vec::new(),
        };
        let welcome = operator.next_result().await;
        (operator, welcome)
    }

    async fn next_frame(&mut self) -> SessionFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), self.client.next())
                .await
                .expect("frame before timeout")
                .expect("socket open")
                .expect("valid frame");
            if let Message::Text(text) = msg {
                return SessionFrame::parse(text.as_str()).unwrap();
            }
        }
    }

    async fn next_result(&mut self) -> CommandResult {
        loop {
            match self.next_frame().await {
                SessionFrame::Result(result) => return result,
                SessionFrame::Broadcast(b) => self.broadcasts.push(b),
            }
        }
    }

    async fn send(&mut self, command: Value) -> CommandResult {
        self.client
            .send(Message::Text(command.to_string().into()))
            .await
            .unwrap();
        self.next_result().await
    }

    /// Wait for a forwarded node event named `event`.
    async fn node_event(&mut self, event: &str) -> Broadcast {
        let matches = |b: &Broadcast| b.broadcast == NODE_EVENT && b.data["event"] == event;
        if let Some(pos) = self.broadcasts.iter().position(matches) {
            return self.broadcasts.remove(pos);
        }
        loop {
            if let SessionFrame::Broadcast(b) = self.next_frame().await {
                if matches(&b) {
                    return b;
                }
            }
        }
    }
}

#[tokio::test]
async fn operator_drives_a_node_through_its_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config_file = dir.path().join("config.json");
    tokio::fs::write(
        &config_file,
        json!({
            "Fra": {
                "source": {"original_url": "srt://floor:9000"},
                "audio": {"original_volume": -6},
                "stream": {"server": "rtmp://cdn/live", "key": "fra"},
            }
        })
        .to_string(),
    )
    .await
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let compositor = Arc::new(MockCompositor::with_defaults());
    let endpoint = start_node("Fra", compositor.clone(), shutdown_rx.clone()).await;
    let url = start_orchestrator(
        vec![("Fra".to_string(), endpoint)],
        &config_file,
        &dir.path().join("data"),
        shutdown_rx,
    )
    .await;

    // 1. Login
    let (mut operator, welcome) = Operator::login(&url).await;
    assert!(welcome.status, "{}", welcome.message);

    // 2. Nothing reaches the node while sleeping
    let early = operator
        .send(json!({"command": "play media", "lang": "Fra", "details": {"name": "intro.mp4"}}))
        .await;
    assert!(!early.status);
    assert!(compositor.input("original").is_none());

    // 3. Pulling the configuration wakes the server, connects and pushes
    let pulled = operator.send(json!({"command": "pull config"})).await;
    assert!(pulled.status, "{}", pulled.message);
    assert_eq!(compositor.current_scene_name().as_deref(), Some("main"));
    let original = compositor.input("original").expect("original feed created");
    assert_eq!(original.settings["input"], "srt://floor:9000");
    assert!((original.volume - -6.0).abs() < 0.01);
    assert_eq!(
        compositor.current_stream().map(|s| s.server),
        Some("rtmp://cdn/live".to_string())
    );

    let info = operator.send(json!({"command": "get info"})).await;
    let info = info.serializable_object.unwrap();
    assert_eq!(info["lifecycle"], "running");
    assert_eq!(info["languages"]["Fra"]["reachable"], true);
    assert_eq!(info["languages"]["Fra"]["subjects"]["source"], "active");

    // 4. Play a clip
    let played = operator
        .send(json!({"command": "play media", "lang": "Fra", "details": {"name": "intro.mp4"}}))
        .await;
    assert!(played.status, "{}", played.message);
    let started = operator.node_event("media started").await;
    assert_eq!(started.data["lang"], "Fra");
    assert_eq!(started.data["data"]["name"], "intro.mp4");
    assert!(compositor.input("media").is_some());

    // 5. Inspect, stop, dispose
    let node_info = operator.send(json!({"command": "node info", "lang": "Fra"})).await;
    assert!(node_info.status, "{}", node_info.message);
    let per_lang = node_info.serializable_object.unwrap();
    assert_eq!(
        per_lang["Fra"]["serializable_object"]["playback"],
        json!({"state": "playing", "name": "intro.mp4"})
    );

    let stopped = operator.send(json!({"command": "stop media", "lang": "Fra"})).await;
    assert!(stopped.status, "{}", stopped.message);
    assert!(compositor.input("media").is_none());

    let disposed = operator.send(json!({"command": "dispose"})).await;
    assert!(disposed.status, "{}", disposed.message);
    let info = operator.send(json!({"command": "get info"})).await;
    assert_eq!(info.serializable_object.unwrap()["lifecycle"], "sleeping");
}

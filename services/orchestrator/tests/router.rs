mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use babel_orchestrator::auth::Session;
use babel_orchestrator::hooks::{CommandCompleted, CommandHook};
use babel_orchestrator::registry::Lifecycle;
use babel_protocol::commands;
use babel_settings::{ObjectState, SubjectKind};
use babel_testing::Behavior;
use common::{Harness, ADMIN, FRA_OPERATOR};
use serde_json::json;

fn admin() -> Session {
    Session::user(ADMIN)
}

#[tokio::test]
async fn activation_reports_the_silent_node() {
    let h = Harness::start(&[
        ("Deu", Behavior::Succeed),
        ("Fra", Behavior::Silent),
        ("Ita", Behavior::Succeed),
    ])
    .await;
    h.running();

    let result = h
        .send(
            &admin(),
            json!({"command": "set settings", "lang": "*", "details": {"stream": {"key": "live"}}}),
        )
        .await;

    assert!(!result.status);
    let per_lang = result.serializable_object.unwrap();
    assert_eq!(per_lang["Deu"]["status"], true);
    assert_eq!(per_lang["Ita"]["status"], true);
    assert!(per_lang["Fra"]["message"]
        .as_str()
        .unwrap()
        .starts_with("NodeDidNotRespond: Fra"));

    assert_eq!(h.received("Deu", commands::node::SET_CONFIG).len(), 1);
    let pushed = &h.received("Deu", commands::node::SET_CONFIG)[0];
    assert_eq!(pushed["stream"]["key"], "live");
}

#[tokio::test]
async fn denied_language_leaves_registry_untouched() {
    let h = Harness::start(&[("Fra", Behavior::Succeed), ("Ita", Behavior::Succeed)]).await;
    h.running();
    let before = h.state.registry().persisted();

    let result = h
        .send(
            &Session::user(FRA_OPERATOR),
            json!({"command": "set settings", "lang": "Ita", "details": {"audio": {"original_volume": -3.0}}}),
        )
        .await;

    assert!(!result.status);
    assert_eq!(result.message, "LanguageDenied: Ita");
    assert_eq!(h.state.registry().persisted(), before);
    assert!(h.received("Ita", commands::node::SET_CONFIG).is_empty());
}

#[tokio::test]
async fn operator_broad_request_only_touches_permitted_languages() {
    let h = Harness::start(&[("Fra", Behavior::Succeed), ("Ita", Behavior::Succeed)]).await;
    h.running();

    let result = h
        .send(
            &Session::user(FRA_OPERATOR),
            json!({"command": "set settings", "lang": "*", "details": {"gain": {"enabled": true}}}),
        )
        .await;

    assert!(result.status, "{}", result.message);
    let per_lang = result.serializable_object.unwrap();
    assert!(per_lang.get("Ita").is_none());
    let gain = h.state.registry().language("Ita").unwrap().subject(SubjectKind::Gain).state();
    assert_eq!(gain, ObjectState::Unset);
}

#[tokio::test]
async fn unknown_key_is_rejected_without_mutation() {
    let h = Harness::start(&[("Fra", Behavior::Succeed)]).await;
    h.running();
    let before = h.state.registry().persisted();

    let result = h
        .send(
            &admin(),
            json!({"command": "set settings", "lang": "Fra", "details": {"audio": {"loudness": 3}}}),
        )
        .await;

    assert!(!result.status);
    assert!(result.message.starts_with("InvalidKey"));
    assert_eq!(h.state.registry().persisted(), before);
}

#[tokio::test]
async fn lifecycle_gates_commands() {
    let h = Harness::start(&[("Fra", Behavior::Succeed)]).await;

    let result = h
        .send(&admin(), json!({"command": "stop media", "lang": "*"}))
        .await;
    assert!(!result.status);
    assert!(result.message.contains("sleeping"));

    let info = h.send(&admin(), json!({"command": "get info"})).await;
    assert!(info.status);
    assert_eq!(info.serializable_object.unwrap()["lifecycle"], "sleeping");
}

fn stream_config(langs: &[&str]) -> serde_json::Value {
    langs
        .iter()
        .map(|lang| (lang.to_string(), json!({"stream": {"server": "rtmp://ingest"}})))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

#[tokio::test]
async fn pull_config_wakes_the_server_then_dispose() {
    let h = Harness::start_with_config(
        &[("Deu", Behavior::Succeed), ("Fra", Behavior::Succeed)],
        Some(stream_config(&["Deu", "Fra"])),
    )
    .await;

    let early = h.send(&admin(), json!({"command": "initialize"})).await;
    assert!(!early.status);
    assert!(early.message.contains("sleeping"));

    let result = h.send(&admin(), json!({"command": "pull config"})).await;
    assert!(result.status, "{}", result.message);
    assert_eq!(h.state.registry().lifecycle(), Lifecycle::Running);
    assert_eq!(h.received("Fra", commands::node::SET_CONFIG).len(), 1);
    assert_eq!(h.received("Fra", commands::node::SET_CONFIG)[0]["stream"]["server"], "rtmp://ingest");

    let repushed = h.send(&admin(), json!({"command": "initialize"})).await;
    assert!(repushed.status, "{}", repushed.message);

    h.send(&admin(), json!({"command": "infrastructure lock"})).await;
    let refused = h.send(&admin(), json!({"command": "dispose"})).await;
    assert!(!refused.status);
    assert_eq!(h.state.registry().lifecycle(), Lifecycle::Running);

    h.send(&admin(), json!({"command": "infrastructure unlock"})).await;
    let disposed = h.send(&admin(), json!({"command": "dispose"})).await;
    assert!(disposed.status, "{}", disposed.message);
    assert_eq!(h.state.registry().lifecycle(), Lifecycle::Sleeping);
    assert!(h.state.fleet().records().is_empty());
}

#[tokio::test]
async fn failed_wake_up_reverts_to_sleeping() {
    let h = Harness::start_with_config(
        &[("Deu", Behavior::Fail("compositor down".into()))],
        Some(stream_config(&["Deu"])),
    )
    .await;

    let result = h.send(&admin(), json!({"command": "pull config"})).await;
    assert!(!result.status);
    assert_eq!(h.state.registry().lifecycle(), Lifecycle::Sleeping);
    assert_eq!(
        h.state.registry().language("Deu").unwrap().subject(SubjectKind::Stream).get("server").unwrap(),
        &json!("rtmp://ingest")
    );
}

#[tokio::test]
async fn active_console_plays_media_everywhere() {
    let h = Harness::start(&[("Deu", Behavior::Succeed), ("Fra", Behavior::Succeed)]).await;
    h.running();
    let langs = h.langs();
    for lang in &langs {
        let endpoint = h.nodes[lang].endpoint();
        h.state.fleet().connect(lang, &endpoint).await.unwrap();
    }

    let console = Session::anonymous();
    let before = h
        .send(&console, json!({"command": "play media", "lang": "*", "details": {"name": "intro.mp4"}}))
        .await;
    assert!(!before.status);

    let selected = h
        .send(
            &admin(),
            json!({"command": "select active console", "details": {"session_id": console.id}}),
        )
        .await;
    assert!(selected.status, "{}", selected.message);

    let played = h
        .send(
            &console,
            json!({"command": "play media", "lang": "*", "details": {"name": "intro.mp4", "mode": "check_same"}}),
        )
        .await;
    assert!(played.status, "{}", played.message);
    for lang in &langs {
        let runs = h.received(lang, commands::node::RUN_MEDIA);
        assert_eq!(runs, vec![json!({"name": "intro.mp4", "mode": "check_same"})]);
    }

    let stop = h
        .send(&console, json!({"command": "stop media", "lang": "Fra"}))
        .await;
    assert!(!stop.status);
}

#[tokio::test]
async fn revoked_user_is_unauthenticated() {
    let h = Harness::start(&[]).await;
    h.state.users().clear();

    let result = h.send(&admin(), json!({"command": "get info"})).await;
    assert!(!result.status);
    assert_eq!(result.message, "session is not authenticated");
}

#[tokio::test]
async fn malformed_and_unknown_commands_fail() {
    let h = Harness::start(&[]).await;
    let session = admin();

    let malformed = babel_orchestrator::router::handle_frame(&h.state, &session, "{not json").await;
    assert!(!malformed.status);

    let unknown = h.send(&session, json!({"command": "reboot"})).await;
    assert!(!unknown.status);
    assert!(unknown.message.contains("reboot"));
}

struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl CommandHook for Counter {
    fn id(&self) -> &str {
        "counter"
    }

    async fn on_command_completed(&self, _event: &CommandCompleted) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn every_command_notifies_hooks() {
    let h = Harness::start(&[]).await;
    let seen = Arc::new(AtomicUsize::new(0));
    h.state.hooks().register(Arc::new(Counter(seen.clone())));

    h.send(&admin(), json!({"command": "get info"})).await;
    h.send(&admin(), json!({"command": "dispose"})).await;
    h.send(&Session::anonymous(), json!({"command": "get logs"})).await;

    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn timeline_plays_media_on_every_language() {
    let h = Harness::start(&[("Deu", Behavior::Succeed), ("Fra", Behavior::Succeed)]).await;
    h.running();
    for lang in h.langs() {
        let endpoint = h.nodes[&lang].endpoint();
        h.state.fleet().connect(&lang, &endpoint).await.unwrap();
    }
    let (_tx, shutdown) = tokio::sync::watch::channel(false);
    h.state.timing().spawn(shutdown);

    let set = h
        .send(
            &admin(),
            json!({"command": "timing set", "details": {"entries": [["b.mp4", 0.4], ["a.mp4", 0.2]]}}),
        )
        .await;
    assert!(set.status, "{}", set.message);
    let started = h.send(&admin(), json!({"command": "timing start"})).await;
    assert!(started.status, "{}", started.message);

    tokio::time::sleep(Duration::from_millis(1_000)).await;

    for lang in h.langs() {
        let names: Vec<_> = h
            .received(&lang, commands::node::RUN_MEDIA)
            .into_iter()
            .map(|d| d["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("a.mp4"), json!("b.mp4")]);
    }

    let timeline = h.send(&admin(), json!({"command": "timing get"})).await;
    let entries = &timeline.serializable_object.as_ref().unwrap()["entries"];
    assert_eq!(entries[0]["played"], true);
    assert_eq!(entries[1]["failed"], false);
    assert_eq!(timeline.serializable_object.as_ref().unwrap()["pending"], 0);
}

#[tokio::test]
async fn out_of_range_timeline_is_rejected_whole() {
    let h = Harness::start(&[]).await;

    let set = h
        .send(
            &admin(),
            json!({"command": "timing set", "details": {"entries": [["a.mp4", 5.0], ["b.mp4", 10.0]]}}),
        )
        .await;
    assert!(set.status, "{}", set.message);
    let started = h.send(&admin(), json!({"command": "timing start"})).await;
    assert!(started.status, "{}", started.message);

    let huge = h
        .send(
            &admin(),
            json!({"command": "timing set", "details": {"entries": [["a.mp4", 1.0], ["b.mp4", 1e300]]}}),
        )
        .await;
    assert!(!huge.status);
    assert!(huge.message.contains("invalid detail 'entries'"), "{}", huge.message);

    let rewound = h
        .send(&admin(), json!({"command": "timing start", "details": {"offset": -1e300}}))
        .await;
    assert!(!rewound.status);

    let timeline = h.send(&admin(), json!({"command": "timing get"})).await;
    let timeline = timeline.serializable_object.unwrap();
    assert_eq!(timeline["entries"].as_array().unwrap().len(), 2);
    assert_eq!(timeline["pending"], 2);
}

#[tokio::test]
async fn snapshot_round_trip() {
    let h = Harness::start(&[("Fra", Behavior::Succeed)]).await;
    h.running();
    h.state
        .registry()
        .update_language("Fra", &json!({"stream": {"key": "abc"}}))
        .unwrap();

    let saved = h.send(&admin(), json!({"command": "save snapshot"})).await;
    assert!(saved.status, "{}", saved.message);
    assert!(h.dir.path().join("registry.json").exists());

    h.state.registry().delete_language("Fra");
    h.state.restore_snapshot().await;
    let tree = h.state.registry().language("Fra").unwrap();
    assert_eq!(tree.subject(SubjectKind::Stream).get("key").unwrap(), &json!("abc"));
}

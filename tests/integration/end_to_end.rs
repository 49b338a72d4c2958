//! End-to-end scenarios through the public facade

mod support;

use std::fs::{self, OpenOptions};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde_json::json;

use plughost::bus::{topics, Message};
use plughost::lifecycle::{HookPoint, Outcome};
use plughost::plugin::PluginHandle;
use plughost::{ErrorKind, PluginLoadOptions, PluginState};

use support::TestHost;

#[tokio::test]
async fn basic_load_run_unload() {
    let host = TestHost::new();
    let path = host.artifact("a", &[]);

    let id = host
        .manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();
    assert_eq!(id, "a");
    assert_eq!(host.state("a"), Some(PluginState::Running));
    assert_eq!(host.manager.loaded(), vec!["a".to_string()]);

    host.manager.unload_plugin("a", false).await.unwrap();
    assert!(host.manager.loaded().is_empty());
    assert_eq!(host.journal.calls(), vec!["a:initialize", "a:shutdown"]);
}

#[tokio::test]
async fn initialize_all_follows_dependency_order() {
    let host = TestHost::new();
    // registered out of order on purpose
    let c = host.artifact("c", &["b"]);
    let b = host.artifact("b", &["a"]);
    let a = host.artifact("a", &[]);
    let unchecked = PluginLoadOptions {
        check_dependencies: false,
        ..PluginLoadOptions::default()
    };
    for path in [&c, &b, &a] {
        host.manager.load_plugin(path, unchecked.clone()).await.unwrap();
    }

    let report = host.manager.initialize_all().await;
    assert!(report.is_success());
    assert_eq!(report.order(), vec!["a", "b", "c"]);
    assert_eq!(host.journal.ids_for("initialize"), vec!["a", "b", "c"]);

    let report = host.manager.stop_all().await;
    assert_eq!(report.order(), vec!["c", "b", "a"]);
    assert_eq!(host.journal.ids_for("shutdown"), vec!["c", "b", "a"]);
    for id in ["a", "b", "c"] {
        assert_eq!(host.state(id), Some(PluginState::Stopped));
    }
}

#[tokio::test]
async fn failed_initialize_skips_dependents() {
    let host = TestHost::new();
    let a = host.artifact("a", &[]);
    let b = host.artifact("b", &["a"]);
    let c = host.artifact("c", &["b"]);
    for path in [&a, &b, &c] {
        host.manager.load_plugin(path, PluginLoadOptions::default()).await.unwrap();
    }
    host.journal.fail_initialize("b", true);

    let report = host.manager.initialize_all().await;
    assert!(matches!(report.outcome("a"), Some(Outcome::Ok)));
    match report.outcome("b") {
        Some(Outcome::Failed(e)) => assert_eq!(e.kind(), ErrorKind::InitializationFailed),
        other => panic!("unexpected outcome for b: {:?}", other),
    }
    match report.outcome("c") {
        Some(Outcome::Skipped(e)) => assert_eq!(e.kind(), ErrorKind::DependencyUnsatisfied),
        other => panic!("unexpected outcome for c: {:?}", other),
    }

    assert_eq!(host.state("a"), Some(PluginState::Running));
    assert_eq!(host.state("b"), Some(PluginState::Failed));
    assert_eq!(host.state("c"), Some(PluginState::Loaded));
    assert!(host.manager.get_plugin("b").unwrap().last_error.is_some());
    assert_eq!(host.journal.count("c", "initialize"), 0);

    // a failed plugin stays registered until explicitly unloaded
    host.manager.unload_plugin("b", true).await.unwrap();
    assert!(host.state("b").is_none());
}

#[tokio::test]
async fn touched_artifact_keeps_cached_metadata() {
    let host = TestHost::new();
    let path = host.artifact("a", &[]);
    let loader = host.manager.loader();

    assert!(loader.can_load(&path));
    let first = loader.cache_stats();
    assert_eq!(first.misses, 1);
    assert_eq!(first.hits, 0);
    assert_eq!(first.size, 1);

    // new mtime, same content
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();

    assert!(loader.can_load(&path));
    let second = loader.cache_stats();
    assert_eq!(second.misses, 1);
    assert_eq!(second.hits, 1);
    assert_eq!(second.size, 1);

    // different content invalidates the entry
    fs::write(&path, "rebuilt artifact").unwrap();
    assert!(loader.can_load(&path));
    assert_eq!(loader.cache_stats().misses, 2);
}

#[tokio::test]
async fn lifecycle_events_reach_subscribers() {
    let host = TestHost::new();
    let path = host.artifact("a", &[]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    host.manager.bus().subscribe(
        "observer",
        plughost::bus::ALL_TYPES,
        move |message: &Message| {
            sink.lock().push(message.message_type.clone());
            Ok(())
        },
        None,
    );

    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();
    host.manager.unload_plugin("a", false).await.unwrap();

    let seen = seen.lock().clone();
    assert!(seen.iter().any(|t| t == topics::LOADED));
    assert!(seen.iter().any(|t| t == topics::UNLOADED));
    assert!(seen.iter().filter(|t| *t == topics::STATE_CHANGED).count() >= 4);
}

#[tokio::test]
async fn pre_load_hook_can_veto() {
    let host = TestHost::new();
    let path = host.artifact("a", &[]);
    let token = host.manager.register_hook(HookPoint::PreLoad, |id: &str, _handle: Option<&PluginHandle>| {
        if id == "a" {
            Err(plughost::PluginError::load_failed("vetoed by policy"))
        } else {
            Ok(())
        }
    });

    let err = host
        .manager
        .load_plugin(&path, PluginLoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailed);
    assert!(host.manager.loaded().is_empty());

    assert!(host.manager.unregister_hook(token));
    host.manager.load_plugin(&path, PluginLoadOptions::default()).await.unwrap();
}

#[tokio::test]
async fn commands_and_configuration() {
    let host = TestHost::new();
    let path = host.artifact("a", &[]);
    let options = PluginLoadOptions {
        initial_configuration: Some(json!({"mode": "fast"})),
        ..PluginLoadOptions::initialized()
    };
    host.manager.load_plugin(&path, options).await.unwrap();

    assert_eq!(host.manager.get_configuration("a").await.unwrap(), json!({"mode": "fast"}));
    let err = host.manager.configure("a", json!("not an object")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    assert_eq!(host.manager.get_plugin("a").unwrap().live_config, json!({"mode": "fast"}));

    let echoed = host
        .manager
        .execute_command("a", "echo", json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"n": 1}));
    let err = host
        .manager
        .execute_command("a", "missing", json!(null))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandNotFound);

    host.manager.pause("a").await.unwrap();
    let err = host.manager.execute_command("a", "echo", json!(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    host.manager.resume("a").await.unwrap();
    assert_eq!(host.state("a"), Some(PluginState::Running));
}

#[tokio::test]
async fn independent_hosts_do_not_share_plugins() {
    let first = TestHost::new();
    let second = TestHost::new();
    let path = first.artifact("a", &[]);
    first.manager.load_plugin(&path, PluginLoadOptions::initialized()).await.unwrap();

    assert_eq!(first.manager.loaded(), vec!["a".to_string()]);
    assert!(second.manager.loaded().is_empty());
    assert_eq!(second.manager.system_metrics().total_plugins, 0);
}

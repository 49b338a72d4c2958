//! Artifact changes reloading running plugins

mod support;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plughost::bus::{topics, Message};
use plughost::config::HostConfig;
use plughost::hot_reload::HotReloadConfig;
use plughost::{ErrorKind, PluginLoadOptions, PluginState};

use support::{eventually, TestHost};

fn host() -> TestHost {
    TestHost::with_config(HostConfig {
        hot_reload: HotReloadConfig {
            enabled: true,
            debounce: Duration::from_millis(250),
        },
        ..HostConfig::default()
    })
}

fn reload_counter(host: &TestHost) -> Arc<AtomicUsize> {
    let reloads = Arc::new(AtomicUsize::new(0));
    let counter = reloads.clone();
    host.manager.bus().subscribe(
        "reload-observer",
        topics::RELOAD,
        move |message: &Message| {
            if message.payload["success"] == true {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        },
        None,
    );
    reloads
}

fn watched_options() -> PluginLoadOptions {
    PluginLoadOptions {
        enable_hot_reload: true,
        ..PluginLoadOptions::initialized()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_writes_reloads_once() {
    let host = host();
    let path = host.reloadable_artifact("a");
    let reloads = reload_counter(&host);
    host.manager.load_plugin(&path, watched_options()).await.unwrap();
    assert!(host.manager.get_plugin("a").unwrap().reload_enabled);

    for round in 0..3 {
        fs::write(&path, format!("rebuilt artifact, pass {}", round)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert!(eventually(Duration::from_secs(5), || reloads.load(Ordering::SeqCst) >= 1).await);
    assert!(eventually(Duration::from_secs(2), || host.state("a") == Some(PluginState::Running)).await);
    // quiet period: the final digest is already adopted
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
    assert_eq!(host.journal.count("a", "hot_reload"), 1);
    assert_eq!(host.journal.count("a", "initialize"), 2);
    assert!(host.manager.get_plugin("a").unwrap().reload_enabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_content_is_ignored() {
    let host = host();
    let path = host.reloadable_artifact("a");
    let reloads = reload_counter(&host);
    host.manager.load_plugin(&path, watched_options()).await.unwrap();

    // same bytes, new mtime
    let content = fs::read(&path).unwrap();
    fs::write(&path, content).unwrap();
    host.manager.hot_reload().notify_path_changed(&path);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    assert!(host.manager.hot_reload().stats().unchanged >= 1);
    assert_eq!(host.journal.count("a", "initialize"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn globally_disabled_reload_does_nothing() {
    let host = host();
    let path = host.reloadable_artifact("a");
    let reloads = reload_counter(&host);
    host.manager.load_plugin(&path, watched_options()).await.unwrap();
    host.manager.set_hot_reload_enabled(false);

    fs::write(&path, "rebuilt artifact").unwrap();
    host.manager.hot_reload().notify_path_changed(&path);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    assert_eq!(host.journal.count("a", "hot_reload"), 0);
}

#[tokio::test]
async fn reload_requires_capability() {
    let host = host();
    let path = host.artifact("plain", &[]);
    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();

    let err = host.manager.enable_hot_reload("plain").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    assert!(host.manager.hot_reload().watched().is_empty());
}

#[tokio::test]
async fn explicit_reload_replaces_instance() {
    let host = host();
    let path = host.reloadable_artifact("a");
    host.manager.load_plugin(&path, watched_options()).await.unwrap();
    host.manager
        .configure("a", serde_json::json!({"mode": "kept"}))
        .await
        .unwrap();

    host.manager.reload_plugin("a").await.unwrap();

    let snapshot = host.manager.get_plugin("a").unwrap();
    assert_eq!(snapshot.state, PluginState::Running);
    assert_eq!(snapshot.live_config, serde_json::json!({"mode": "kept"}));
    assert_eq!(host.journal.count("a", "shutdown"), 1);
    assert_eq!(host.journal.count("a", "initialize"), 2);

    assert!(host.manager.disable_hot_reload("a"));
    assert!(host.manager.hot_reload().watched().is_empty());
}

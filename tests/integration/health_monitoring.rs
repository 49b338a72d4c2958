//! Health probing through the manager

mod support;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use plughost::bus::{topics, Message};
use plughost::config::HostConfig;
use plughost::lifecycle::health::{HealthAction, HealthConfig};
use plughost::{PluginLoadOptions, PluginState};

use support::{eventually, TestHost};

fn host(interval_ms: u64, auto_restart: bool) -> TestHost {
    TestHost::with_config(HostConfig {
        health: HealthConfig {
            enabled: true,
            interval: Duration::from_millis(interval_ms),
            failure_threshold: 2,
            auto_restart,
            check_timeout: Duration::from_millis(100),
        },
        ..HostConfig::default()
    })
}

fn health_events(host: &TestHost) -> Arc<Mutex<Vec<Value>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    host.manager.bus().subscribe(
        "health-observer",
        topics::HEALTH,
        move |message: &Message| {
            sink.lock().push(message.payload.clone());
            Ok(())
        },
        None,
    );
    events
}

#[tokio::test]
async fn threshold_marks_plugin_failed() {
    // long interval: the background loop stays out of the way
    let host = host(60_000, false);
    let path = host.artifact("a", &[]);
    let events = health_events(&host);
    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();
    host.journal.set_healthy("a", false);

    let health = host.manager.health();
    let first = health.check_once().await;
    assert_eq!(first.len(), 1);
    assert!(!first[0].healthy);
    assert_eq!(first[0].action, HealthAction::None);
    assert_eq!(host.state("a"), Some(PluginState::Running));

    let second = health.check_once().await;
    assert_eq!(second[0].consecutive_failures, 2);
    assert_eq!(second[0].action, HealthAction::MarkedFailed);
    assert_eq!(host.state("a"), Some(PluginState::Failed));
    assert!(host.manager.get_plugin("a").unwrap().last_error.is_some());

    // failed plugins are no longer probed
    assert!(health.check_once().await.is_empty());
    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["plugin_id"], "a");
    assert_eq!(events[1]["action"], "marked_failed");
}

#[tokio::test]
async fn recovery_resets_the_count() {
    let host = host(60_000, false);
    let path = host.artifact("a", &[]);
    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();
    let health = host.manager.health();

    host.journal.set_healthy("a", false);
    health.check_once().await;
    assert_eq!(health.failure_count("a"), 1);

    host.journal.set_healthy("a", true);
    let reports = health.check_once().await;
    assert!(reports[0].healthy);
    assert_eq!(health.failure_count("a"), 0);

    host.journal.set_healthy("a", false);
    health.check_once().await;
    assert_eq!(host.state("a"), Some(PluginState::Running));
}

#[tokio::test]
async fn unhealthy_plugin_is_restarted() {
    let host = host(60_000, true);
    let path = host.artifact("a", &[]);
    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();
    host.journal.set_healthy("a", false);

    let health = host.manager.health();
    health.check_once().await;
    let reports = health.check_once().await;
    assert_eq!(reports[0].action, HealthAction::Restarted);
    assert_eq!(host.state("a"), Some(PluginState::Running));
    assert_eq!(host.journal.count("a", "shutdown"), 1);
    assert_eq!(host.journal.count("a", "initialize"), 2);
    assert_eq!(health.failure_count("a"), 0);
}

#[tokio::test]
async fn hung_check_counts_as_failure() {
    let host = host(60_000, false);
    let path = host.artifact("a", &[]);
    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();

    host.journal.block_health(true);
    let reports = host.manager.health().check_once().await;
    host.journal.block_health(false);
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].healthy);
    assert_eq!(reports[0].consecutive_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_loop_acts_on_its_own() {
    let host = host(20, false);
    let path = host.artifact("a", &[]);
    let events = health_events(&host);
    host.manager
        .load_plugin(&path, PluginLoadOptions::initialized())
        .await
        .unwrap();
    assert!(host.manager.health().is_running());

    host.journal.set_healthy("a", false);
    assert!(eventually(Duration::from_secs(3), || host.state("a") == Some(PluginState::Failed)).await);
    assert!(events.lock().len() >= 2);

    host.manager.shutdown().await;
    assert!(!host.manager.health().is_running());
}

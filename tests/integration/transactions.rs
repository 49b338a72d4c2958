//! Two-phase transactions over real lifecycle operations

mod support;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use plughost::bus::{topics, Message};
use plughost::config::HostConfig;
use plughost::plugin::Priority;
use plughost::transaction::{
    IsolationLevel, Operation, OperationKind, TransactionConfig, TransactionState,
};
use plughost::{ErrorKind, PluginError, PluginLoadOptions, PluginState};

use support::{eventually, TestHost};

#[tokio::test]
async fn failed_load_rolls_back_whole_transaction() {
    let host = TestHost::new();
    let x = host.artifact("x", &[]);
    let y = host.artifact("y", &[]);
    host.journal.fail_initialize("y", true);

    let manager = &host.manager;
    let tx = manager.begin_transaction(IsolationLevel::Serializable, None);
    manager
        .add_operation(tx, manager.load_operation(&x, PluginLoadOptions::initialized()).unwrap())
        .await
        .unwrap();
    manager
        .add_operation(tx, manager.configure_operation("x", json!({"threads": 4})))
        .await
        .unwrap();
    manager
        .add_operation(tx, manager.load_operation(&y, PluginLoadOptions::initialized()).unwrap())
        .await
        .unwrap();

    let err = manager.commit(tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionAborted);
    let cause = err.cause().expect("original error is preserved");
    assert_eq!(cause.kind(), ErrorKind::InitializationFailed);

    assert!(manager.loaded().is_empty());
    let info = manager.transactions().info(tx).unwrap();
    assert_eq!(info.state, TransactionState::RolledBack);
    assert!(info.error.is_some());

    // x was configured, then undone: configure rollback before the unload
    let x_calls: Vec<String> = host
        .journal
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("x:"))
        .collect();
    assert_eq!(x_calls.first().map(String::as_str), Some("x:initialize"));
    assert_eq!(x_calls.last().map(String::as_str), Some("x:shutdown"));
    assert!(x_calls.iter().filter(|c| *c == "x:configure").count() >= 1);
}

#[tokio::test]
async fn committed_transaction_applies_every_operation() {
    let host = TestHost::new();
    let a = host.artifact("a", &[]);
    let b = host.artifact("b", &["a"]);
    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = completed.clone();
    host.manager.bus().subscribe(
        "observer",
        topics::TRANSACTION_COMPLETED,
        move |message: &Message| {
            sink.lock().push(message.payload.clone());
            Ok(())
        },
        None,
    );

    let manager = &host.manager;
    let tx = manager.begin_transaction(IsolationLevel::ReadCommitted, None);
    manager
        .add_operation(tx, manager.load_operation(&a, PluginLoadOptions::initialized()).unwrap())
        .await
        .unwrap();
    manager
        .add_operation(tx, manager.load_operation(&b, PluginLoadOptions::initialized()).unwrap())
        .await
        .unwrap();
    manager
        .add_operation(tx, manager.execute_operation("b", "echo", json!({"ping": true})))
        .await
        .unwrap();
    manager.prepare(tx).await.unwrap();
    manager.commit(tx).await.unwrap();

    assert_eq!(host.state("a"), Some(PluginState::Running));
    assert_eq!(host.state("b"), Some(PluginState::Running));
    assert_eq!(host.journal.count("b", "echo"), 1);
    assert_eq!(manager.transactions().stats().committed, 1);
    assert_eq!(completed.lock().len(), 1);

    // finished transactions ignore rollback
    manager.rollback(tx).await.unwrap();
    assert_eq!(manager.transactions().state(tx), Some(TransactionState::Committed));
}

#[tokio::test]
async fn unload_is_undone_when_a_later_step_fails() {
    let host = TestHost::new();
    let a = host.artifact("a", &[]);
    let options = PluginLoadOptions {
        initial_configuration: Some(json!({"mode": "steady"})),
        ..PluginLoadOptions::initialized()
    };
    host.manager.load_plugin(&a, options).await.unwrap();

    let manager = &host.manager;
    let tx = manager.begin_transaction(IsolationLevel::Serializable, None);
    manager
        .add_operation(tx, manager.unload_operation("a", false).unwrap())
        .await
        .unwrap();
    manager
        .add_operation(
            tx,
            Operation::new(OperationKind::Custom, "gate", || async {
                Err(PluginError::internal("gate closed"))
            }),
        )
        .await
        .unwrap();

    let err = manager.commit(tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionAborted);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::InternalError);

    let restored = manager.get_plugin("a").expect("a is loaded again");
    assert_eq!(restored.state, PluginState::Running);
    assert_eq!(restored.live_config, json!({"mode": "steady"}));
    assert_eq!(host.journal.count("a", "initialize"), 2);
}

#[tokio::test]
async fn prepare_rejects_invalid_plans() {
    let host = TestHost::new();
    let manager = &host.manager;

    let tx = manager.begin_transaction(IsolationLevel::ReadCommitted, None);
    manager
        .add_operation(tx, manager.configure_operation("ghost", json!({})))
        .await
        .unwrap();
    let err = manager.prepare(tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLoaded);
    assert_eq!(manager.transactions().state(tx), Some(TransactionState::Failed));
    assert!(manager.commit(tx).await.is_err());
}

/// Two transactions on the same plugin under `Serializable` never interleave
#[tokio::test]
async fn serializable_transactions_do_not_interleave() {
    let host = TestHost::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let step = |name: &'static str| {
        let log = log.clone();
        Operation::new(OperationKind::Custom, "shared", move || {
            let log = log.clone();
            async move {
                log.lock().push(format!("{} start", name));
                tokio::time::sleep(Duration::from_millis(40)).await;
                log.lock().push(format!("{} end", name));
                Ok(())
            }
        })
    };

    let manager = host.manager.clone();
    let first = manager.begin_transaction(IsolationLevel::Serializable, None);
    let second = manager.begin_transaction(IsolationLevel::Serializable, None);
    manager.add_operation(first, step("first")).await.unwrap();
    manager.add_operation(second, step("second")).await.unwrap();

    let one = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.commit(first).await })
    };
    let two = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.commit(second).await })
    };
    one.await.unwrap().unwrap();
    two.await.unwrap().unwrap();

    let log = log.lock().clone();
    assert_eq!(log.len(), 4);
    // each transaction's start is immediately followed by its own end
    assert_eq!(log[0].replace("start", "end"), log[1]);
    assert_eq!(log[2].replace("start", "end"), log[3]);
    assert_eq!(manager.transactions().locks().lock_count(), 0);
}

/// Opposite lock orders either serialize or abort the low-priority side
#[tokio::test]
async fn crossing_lock_orders_resolve() {
    let host = TestHost::new();
    let manager = host.manager.clone();
    let noop = |target: &str| Operation::new(OperationKind::Custom, target, || async { Ok(()) });

    let blocker = manager.begin_transaction(IsolationLevel::Serializable, None);
    manager.add_operation(blocker, noop("b")).await.unwrap();
    manager.prepare(blocker).await.unwrap();

    let high = manager
        .transactions()
        .begin_with_priority(IsolationLevel::Serializable, None, Priority::High);
    let low = manager
        .transactions()
        .begin_with_priority(IsolationLevel::Serializable, None, Priority::Low);
    manager.add_operation(high, noop("a")).await.unwrap();
    manager.add_operation(high, noop("b")).await.unwrap();
    manager.add_operation(low, noop("b")).await.unwrap();
    manager.add_operation(low, noop("a")).await.unwrap();

    let high_commit = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.commit(high).await })
    };
    let transactions = manager.transactions();
    assert!(eventually(Duration::from_secs(2), || transactions.locks().holder_of("a") == Some(high)).await);
    let low_commit = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.commit(low).await })
    };

    // releasing "b" lets the waiters race for it
    manager.rollback(blocker).await.unwrap();

    high_commit.await.unwrap().unwrap();
    match low_commit.await.unwrap() {
        Ok(()) => assert_eq!(transactions.state(low), Some(TransactionState::Committed)),
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::TransactionAborted);
            assert_eq!(transactions.state(low), Some(TransactionState::RolledBack));
        }
    }
    assert_eq!(transactions.state(high), Some(TransactionState::Committed));
    assert_eq!(transactions.locks().lock_count(), 0);
}

/// An abandoned prepared transaction is rolled back by the host once its
/// deadline passes, freeing its locks for the next writer
#[tokio::test]
async fn abandoned_transaction_is_reaped() {
    let host = TestHost::with_config(HostConfig {
        transactions: TransactionConfig {
            reap_interval: Duration::from_millis(20),
            ..TransactionConfig::default()
        },
        ..HostConfig::default()
    });
    let manager = host.manager.clone();
    let noop = |target: &str| Operation::new(OperationKind::Custom, target, || async { Ok(()) });

    let abandoned = manager.begin_transaction(IsolationLevel::Serializable, Some(Duration::from_millis(100)));
    manager.add_operation(abandoned, noop("a")).await.unwrap();
    manager.prepare(abandoned).await.unwrap();

    let next = manager.begin_transaction(IsolationLevel::Serializable, Some(Duration::from_secs(5)));
    manager.add_operation(next, noop("a")).await.unwrap();
    manager.commit(next).await.unwrap();

    let transactions = manager.transactions();
    assert_eq!(transactions.state(abandoned), Some(TransactionState::RolledBack));
    assert!(transactions.info(abandoned).unwrap().error.is_some());
    assert_eq!(transactions.state(next), Some(TransactionState::Committed));
    assert_eq!(transactions.locks().lock_count(), 0);
}

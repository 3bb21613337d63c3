mod common;

use std::sync::Arc;
use std::time::Duration;

use hostrun_exec::*;

use common::{LoopbackProvider, SudoProvider, providers};

fn options() -> ConnectOptions {
    ConnectOptions {
        user: Some("deploy".to_string()),
        ..ConnectOptions::default()
    }
}

fn quiet() -> RunOptions {
    RunOptions::new().hide(true)
}

#[tokio::test]
async fn test_identical_members_keep_separate_entries() {
    let provider = LoopbackProvider::new();
    let counters = Arc::clone(&provider.counters);
    let group = Group::from_hosts_with_providers(
        ["web1", "deploy@web1:22"],
        &options(),
        &providers(Arc::new(provider)),
    )
    .unwrap();

    let results = group.run("echo hi", &quiet()).await;

    assert_eq!(results.len(), 2);
    assert!(results.ok());
    let first = group[0].id();
    let second = group[1].id();
    assert_eq!(first.endpoint, second.endpoint);
    assert_ne!(first, second);
    assert_eq!(results[first].as_ref().unwrap().stdout(), "hi\n");
    assert_eq!(results[second].as_ref().unwrap().stdout(), "hi\n");

    // each member owns its channel
    assert_eq!(counters.opens(), 2);
    group.close().await;
    assert_eq!(counters.closes(), 2);
}

#[tokio::test]
async fn test_failed_member_does_not_block_siblings() {
    let provider = LoopbackProvider::new().unreachable("down");
    let group = Group::from_hosts_with_providers(
        ["web1", "down", "web2"],
        &options(),
        &providers(Arc::new(provider)),
    )
    .unwrap()
    .with_concurrency(2);

    let results = group.run("echo up", &quiet()).await;

    assert_eq!(results.len(), 3);
    assert!(!results.ok());
    assert_eq!(results.successes().count(), 2);

    let failures: Vec<_> = results.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, group[1].id());
    assert_eq!(failures[0].1.kind(), ErrorKind::Connect);

    let up = results[group[2].id()].as_ref().unwrap();
    assert!(up.ok());
    assert_eq!(up.stdout(), "up\n");
}

#[tokio::test]
async fn test_entries_follow_construction_order() {
    let group = Group::from_hosts_with_providers(
        ["c", "a", "b", "a"],
        &options(),
        &providers(Arc::new(LoopbackProvider::new())),
    )
    .unwrap()
    .with_concurrency(3);

    let results = group.run("true", &quiet()).await;

    let order: Vec<&TargetId> = results.iter().map(|(id, _)| id).collect();
    let expected: Vec<&TargetId> = group.iter().map(Member::id).collect();
    assert_eq!(order, expected);
    assert_eq!(order[3].ordinal, 1);
}

#[tokio::test]
async fn test_nonzero_exit_is_recorded_per_member() {
    let group = Group::from_hosts_with_providers(
        ["web1", "web2"],
        &options(),
        &providers(Arc::new(LoopbackProvider::new())),
    )
    .unwrap();

    let results = group.run("exit 4", &quiet()).await;
    assert!(!results.ok());
    for (_, outcome) in results.iter() {
        let err = outcome.as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailure);
        assert_eq!(err.result().map(CommandResult::exited), Some(4));
    }
}

#[tokio::test]
async fn test_local_fan_out_never_connects() {
    let provider = LoopbackProvider::new();
    let counters = Arc::clone(&provider.counters);
    let group = Group::from_hosts_with_providers(
        ["web1", "web2"],
        &options(),
        &providers(Arc::new(provider)),
    )
    .unwrap();

    let results = group.local("echo local", &quiet()).await;
    assert!(results.ok());
    assert_eq!(counters.opens(), 0);
    assert!(group.iter().all(|m| !m.connection().is_connected()));
}

#[tokio::test]
async fn test_sudo_fans_out_per_member() {
    let provider = Arc::new(SudoProvider::with_password("hunter2"));
    let counters = Arc::clone(&provider.counters);
    let member = |password: &str| {
        let options = ConnectOptions {
            sudo: SudoConfig {
                password: Some(password.to_string()),
                ..SudoConfig::default()
            },
            ..options()
        };
        Connection::new("db1", options)
            .unwrap()
            .with_providers(providers(provider.clone()))
    };
    let group = Group::new([member("hunter2"), member("letmein")]);

    let results = group
        .sudo("whoami", &quiet().timeout(Duration::from_secs(10)))
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(group[0].id().endpoint, group[1].id().endpoint);
    assert!(!results.ok());

    let elevated = results[group[0].id()].as_ref().unwrap();
    assert_eq!(elevated.stdout(), "root\n");
    let refused = results[group[1].id()].as_ref().unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Escalation);

    assert_eq!(counters.opens(), 2);
    assert!(
        counters
            .commands()
            .iter()
            .all(|c| c == "sudo -S -p '[sudo] password: ' whoami")
    );
}

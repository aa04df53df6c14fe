//! End-to-end lifecycle scenarios driving real `/bin/sh` stub servers
//! through the full harness: control facade, interlock, supervisors,
//! stdout scraping and the verdict sink.

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::*;
use corral::{Event, EventAssert, HarnessError, ServerState, Verdict};

const EVENT_WAIT: Duration = Duration::from_secs(10);

/// Starting a stub that exits on its own races the post-start
/// running-wait: the crash can land first, in which case the wait
/// legitimately short-circuits with the recorded failure.
async fn start_crashing_server(cluster: &TestCluster) {
    match cluster.control.start_one_server().await {
        Ok(()) => {}
        Err(HarnessError::HarnessFailed(_)) => {}
        Err(other) => panic!("start should only fail via the short-circuit, got {other:?}"),
    }
}

fn terminated_index(events: &[Event], name: &str) -> usize {
    events
        .iter()
        .position(|ev| matches!(ev, Event::ServerTerminated(data, _) if data.name == name))
        .unwrap_or_else(|| panic!("no termination event for {name} in {events:?}"))
}

#[tokio::test]
async fn test_single_server_happy_path() {
    let mut cluster = TestCluster::new();
    let s1 = cluster.register("testServer0", ACTIVE_SCRIPT);

    cluster.control.start_one_server().await.expect("start should succeed");
    cluster.control.wait_for_active().await.expect("an active should appear");

    let pid = s1.wait_for_pid().await;
    assert!(pid > 0, "the stub must have reported its PID");

    // every server is running now, so another start has nothing to pick
    match cluster.control.start_one_server().await {
        Err(HarnessError::Precondition(_)) => {}
        other => panic!("expected Precondition, got {other:?}"),
    }

    cluster
        .control
        .terminate_active()
        .await
        .expect("terminating the active should succeed");
    assert_eq!(
        cluster.interlock.server_state("testServer0"),
        Some(ServerState::Terminated)
    );

    cluster.sink.test_did_pass();
    assert!(cluster.sink.await_verdict().await.passed());

    cluster
        .events
        .wait_till(EventAssert::server_terminated("testServer0", true), EVENT_WAIT)
        .await
        .expect("termination event should arrive");
    cluster.events.assert_exact(vec![
        EventAssert::server_started("testServer0"),
        EventAssert::pid_discovered("testServer0"),
        EventAssert::server_active("testServer0"),
        EventAssert::server_terminated("testServer0", true),
    ]);

    // the observability contract: stdout landed in the working directory
    let stdout_log = std::fs::read_to_string(cluster.workdir("testServer0").join("stdout.log"))
        .expect("stdout.log should exist");
    assert!(stdout_log.contains("PID is"), "{stdout_log}");
    assert!(
        cluster.workdir("testServer0").join("stderr.log").exists(),
        "stderr.log should exist"
    );
}

#[tokio::test]
async fn test_unexpected_crash_fails_the_test() {
    let mut cluster = TestCluster::new();
    cluster.register("testServer0", CRASH_AFTER_ACTIVE_SCRIPT);

    start_crashing_server(&cluster).await;

    let record = match cluster.sink.await_verdict().await {
        Verdict::Failed(record) => record,
        Verdict::Passed => panic!("an unprompted exit must fail the test"),
    };
    assert!(record.message.contains("Unexpected server crash"), "{record}");
    assert!(record.message.contains("(PID "), "{record}");
    assert!(record.message.contains("status: 137"), "{record}");
    assert_eq!(record.exit_status, Some(137));

    // every blocking wait now short-circuits so shutdown code can run
    match cluster.control.wait_for_active().await {
        Err(HarnessError::HarnessFailed(reason)) => {
            assert!(reason.contains("Unexpected server crash"), "{reason}")
        }
        other => panic!("expected HarnessFailed, got {other:?}"),
    }

    cluster
        .events
        .wait_till(
            EventAssert::server_terminated("testServer0", false),
            EVENT_WAIT,
        )
        .await
        .expect("termination event should arrive");
}

#[tokio::test]
async fn test_crash_before_pid_fails_the_test() {
    let mut cluster = TestCluster::new();
    cluster.register("testServer0", CRASH_BEFORE_PID_SCRIPT);

    start_crashing_server(&cluster).await;

    let record = match cluster.sink.await_verdict().await {
        Verdict::Failed(record) => record,
        Verdict::Passed => panic!("a crash before the PID must fail the test"),
    };
    assert!(
        record.message.contains("Server crashed before reporting PID"),
        "{record}"
    );
    assert_eq!(record.exit_status, Some(1));
}

#[tokio::test]
async fn test_terminate_all_stops_passives_before_active() {
    let mut cluster = TestCluster::new();
    cluster.register("testServer0", ACTIVE_SCRIPT);
    cluster.register("testServer1", PASSIVE_SCRIPT);

    cluster.control.start_all_servers().await.expect("both should start");
    cluster
        .control
        .wait_for_running_passives_in_standby()
        .await
        .expect("the stripe should settle");

    cluster
        .control
        .terminate_all_servers()
        .await
        .expect("shutdown should succeed");

    assert_eq!(
        cluster.interlock.server_state("testServer0"),
        Some(ServerState::Terminated)
    );
    assert_eq!(
        cluster.interlock.server_state("testServer1"),
        Some(ServerState::Terminated)
    );

    cluster.sink.test_did_pass();
    assert!(cluster.sink.await_verdict().await.passed());

    cluster
        .events
        .wait_till(EventAssert::server_terminated("testServer0", true), EVENT_WAIT)
        .await
        .expect("active termination event should arrive");
    cluster
        .events
        .wait_till(EventAssert::server_terminated("testServer1", true), EVENT_WAIT)
        .await
        .expect("passive termination event should arrive");

    let events = cluster.events.events();
    let passive_down = terminated_index(&events, "testServer1");
    let active_down = terminated_index(&events, "testServer0");
    assert!(
        passive_down < active_down,
        "the passive must terminate before the active: {events:?}"
    );
}

#[tokio::test]
async fn test_zap_then_exit_without_fresh_pid_is_a_crash() {
    let mut cluster = TestCluster::new();
    let s1 = cluster.register("testServer0", ZAP_THEN_EXIT_SCRIPT);

    start_crashing_server(&cluster).await;

    let record = match cluster.sink.await_verdict().await {
        Verdict::Failed(record) => record,
        Verdict::Passed => panic!("a ZAP with no fresh PID before exit must fail the test"),
    };
    assert!(
        record.message.contains("Server crashed before reporting PID"),
        "{record}"
    );

    cluster
        .events
        .wait_till(
            EventAssert::server_terminated("testServer0", false),
            EVENT_WAIT,
        )
        .await
        .expect("termination event should arrive");
    cluster.events.assert_exact(vec![
        EventAssert::server_started("testServer0"),
        EventAssert::pid_discovered("testServer0"),
        EventAssert::server_active("testServer0"),
        EventAssert::server_zapped("testServer0"),
        EventAssert::server_terminated("testServer0", false),
    ]);

    assert_eq!(
        cluster.interlock.server_state("testServer0"),
        Some(ServerState::Terminated)
    );
    assert!(s1.was_zapped());
}

#[tokio::test]
async fn test_concurrent_terminate_active_serializes() {
    let mut cluster = TestCluster::new();
    cluster.register("testServer0", ACTIVE_SCRIPT);

    cluster.control.start_one_server().await.expect("start should succeed");
    cluster.control.wait_for_active().await.expect("an active should appear");

    let first = {
        let control = cluster.control.clone();
        tokio::spawn(async move { control.terminate_active().await })
    };
    let second = {
        let control = cluster.control.clone();
        tokio::spawn(async move { control.terminate_active().await })
    };
    let results = [
        first.await.expect("task should not panic"),
        second.await.expect("task should not panic"),
    ];

    let ok_count = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(ok_count, 1, "exactly one caller wins: {results:?}");
    let loser = results
        .iter()
        .find(|result| result.is_err())
        .expect("one caller loses");
    match loser {
        Err(HarnessError::Precondition(msg)) => assert!(msg.contains("active"), "{msg}"),
        other => panic!("the loser must fail its precondition, got {other:?}"),
    }

    cluster
        .events
        .wait_till(EventAssert::server_terminated("testServer0", true), EVENT_WAIT)
        .await
        .expect("termination event should arrive");
    let terminations = cluster
        .events
        .events()
        .iter()
        .filter(|ev| matches!(ev, Event::ServerTerminated(_, _)))
        .count();
    assert_eq!(terminations, 1, "the same PID must not be stopped twice");

    cluster.sink.test_did_pass();
    assert!(cluster.sink.await_verdict().await.passed());
}

#[tokio::test]
async fn test_terminate_one_passive_without_passive_is_a_noop() {
    let mut cluster = TestCluster::new();
    cluster.register("testServer0", ACTIVE_SCRIPT);

    cluster.control.start_one_server().await.expect("start should succeed");
    cluster.control.wait_for_active().await.expect("an active should appear");

    cluster
        .control
        .terminate_one_passive()
        .await
        .expect("no passive to stop is a legal outcome");
    assert_eq!(
        cluster.interlock.server_state("testServer0"),
        Some(ServerState::Active)
    );

    cluster.control.terminate_active().await.expect("cleanup should succeed");
    cluster.sink.test_did_pass();
    assert!(cluster.sink.await_verdict().await.passed());
}

#[tokio::test]
async fn test_server_restarts_after_termination() {
    let mut cluster = TestCluster::new();
    cluster.register("testServer0", ACTIVE_SCRIPT);

    cluster.control.start_one_server().await.expect("first start should succeed");
    cluster.control.wait_for_active().await.expect("an active should appear");
    cluster.control.terminate_active().await.expect("stop should succeed");

    cluster.control.start_one_server().await.expect("restart should succeed");
    cluster.control.wait_for_active().await.expect("the restart should go active");
    cluster.control.terminate_active().await.expect("final stop should succeed");

    cluster.sink.test_did_pass();
    assert!(cluster.sink.await_verdict().await.passed());
}

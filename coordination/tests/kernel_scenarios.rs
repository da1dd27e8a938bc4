//! End-to-end scenarios for the coordination kernel
//!
//! Each test wires the real components together over a throwaway RocksDB
//! directory: no mocks, no injected clocks.

use std::sync::Arc;
use std::time::Duration;

use fleet_coordination::blackboard::{BlackboardCoordination, BlackboardError, HintMatcher};
use fleet_coordination::consensus::{ConsensusError, ConsensusGating, Proposal};
use fleet_coordination::events::{event_types, EventBus, SharedEventBus};
use fleet_coordination::lifecycle::{AgentLifecycleManager, LifecycleState, StatusChange};
use fleet_coordination::state::{
    ConsensusStatus, RetrieveOptions, SharedStateStore, StateStore, StoreError, StoreOptions,
};
use serde_json::json;
use tempfile::TempDir;

fn kernel() -> (TempDir, SharedEventBus, SharedStateStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = StateStore::open(dir.path().join("state"))
        .expect("Failed to open store")
        .shared();
    let bus = EventBus::new().shared();
    bus.initialize();
    (dir, bus, store)
}

#[tokio::test]
async fn scenario_a_store_without_ttl_is_readable() {
    let (_dir, _bus, store) = kernel();

    store
        .store("k1", json!({ "v": 1 }), StoreOptions::partition("p1"))
        .unwrap();

    let value = store
        .retrieve("k1", RetrieveOptions::partition("p1"))
        .unwrap();
    assert_eq!(value, Some(json!({ "v": 1 })));
    assert!(store
        .retrieve("k1", RetrieveOptions::partition("p2"))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn scenario_b_ttl_expires_without_sweep() {
    let (_dir, _bus, store) = kernel();

    store
        .store(
            "k2",
            json!({ "v": 2 }),
            StoreOptions::partition("p1").with_ttl(Duration::from_secs(1)),
        )
        .unwrap();
    assert!(store
        .retrieve("k2", RetrieveOptions::partition("p1"))
        .unwrap()
        .is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(store
        .retrieve("k2", RetrieveOptions::partition("p1"))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn scenario_c_unmet_quorum_times_out_conservatively() {
    let (_dir, bus, store) = kernel();
    let gating = ConsensusGating::new(bus, Some(store));

    let id = gating
        .open_proposal(
            Proposal::new("merge", "coordinator", 2).with_eligible_voters(["a", "b", "c"]),
        )
        .unwrap();
    gating.cast_vote(&id, "a", true, None).unwrap();

    let started = std::time::Instant::now();
    let decision = gating
        .await_decision(&id, Duration::from_millis(50))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(decision.status, ConsensusStatus::TimedOut);
    assert!(!decision.approved);
    assert_eq!(decision.approvals, 1);
}

#[tokio::test]
async fn scenario_d_waiter_registered_while_idle_sees_active() {
    let agent = Arc::new(AgentLifecycleManager::new("agent-d"));
    agent
        .transition_to(LifecycleState::Idle, Some("ready"))
        .unwrap();

    let waiter = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .wait_for_status(LifecycleState::Active, Duration::from_secs(5))
                .await
        })
    };
    while agent.pending_waiters() == 0 {
        tokio::task::yield_now().await;
    }

    let started = std::time::Instant::now();
    agent
        .transition_to(LifecycleState::Active, Some("go"))
        .unwrap();
    let reached = waiter.await.unwrap().unwrap();

    assert_eq!(reached, LifecycleState::Active);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn scenario_e_hint_is_consumed_once() {
    let (_dir, bus, store) = kernel();
    let blackboard = Arc::new(BlackboardCoordination::new(bus, store));

    let first = {
        let blackboard = blackboard.clone();
        tokio::spawn(async move {
            blackboard
                .await_hint(&HintMatcher::key("build-done"), Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    blackboard
        .post_hint("build-done", json!({ "artifact": "target/app" }), "builder", None)
        .unwrap();

    let hint = first.await.unwrap().unwrap().expect("hint delivered");
    assert_eq!(hint.payload, json!({ "artifact": "target/app" }));

    let second = blackboard
        .await_hint(&HintMatcher::key("build-done"), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn closed_store_errors_reach_callers() {
    let (_dir, bus, store) = kernel();
    let gating = ConsensusGating::new(bus.clone(), Some(store.clone()));
    let blackboard = BlackboardCoordination::new(bus, store.clone());
    let id = gating
        .open_proposal(Proposal::new("deploy", "coordinator", 1))
        .unwrap();

    store.close().unwrap();

    assert!(matches!(
        store.store("k", json!(1), StoreOptions::partition("p")),
        Err(StoreError::NotInitialized)
    ));
    assert!(matches!(
        gating.cast_vote(&id, "a", true, None),
        Err(ConsensusError::Store(StoreError::NotInitialized))
    ));
    assert_eq!(gating.status(&id).unwrap(), ConsensusStatus::Pending);
    assert!(matches!(
        blackboard.post_hint("k", json!(1), "a", None),
        Err(BlackboardError::Store(StoreError::NotInitialized))
    ));
}

#[tokio::test]
async fn status_callbacks_follow_transition_order_across_threads() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let agent = {
        let seen = seen.clone();
        Arc::new(AgentLifecycleManager::with_callback(
            "agent-race",
            Arc::new(move |change: &StatusChange| {
                seen.lock().unwrap().push((change.from, change.to));
            }),
        ))
    };
    agent.transition_to(LifecycleState::Idle, None).unwrap();

    let threads: Vec<_> = [LifecycleState::Active, LifecycleState::Busy, LifecycleState::Idle]
        .into_iter()
        .map(|target| {
            let agent = agent.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = agent.transition_to(target, None);
                }
            })
        })
        .collect();
    let terminator = {
        let agent = agent.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1));
            agent.terminate("done")
        })
    };
    for t in threads {
        t.join().unwrap();
    }
    terminator.join().unwrap().unwrap();

    let seen = seen.lock().unwrap();
    for pair in seen.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
    assert_eq!(
        seen.last(),
        Some(&(LifecycleState::Terminating, LifecycleState::Terminated))
    );
    assert_eq!(agent.current_state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn consensus_decision_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state");

    let id = {
        let store = StateStore::open(&path).unwrap().shared();
        let bus = EventBus::new().shared();
        bus.initialize();
        let gating = ConsensusGating::new(bus, Some(store.clone()));
        let id = gating
            .open_proposal(Proposal::new("deploy", "coordinator", 2))
            .unwrap();
        gating.cast_vote(&id, "a", true, Some("looks good")).unwrap();
        drop(gating);
        store.close().unwrap();
        id
    };

    let store = StateStore::open(&path).unwrap().shared();
    let bus = EventBus::new().shared();
    bus.initialize();
    let gating = ConsensusGating::new(bus, Some(store));
    assert_eq!(gating.restore().unwrap(), 1);
    assert_eq!(gating.status(&id).unwrap(), ConsensusStatus::Pending);

    gating.cast_vote(&id, "b", true, None).unwrap();
    let decision = gating
        .await_decision(&id, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(decision.approved);
    assert_eq!(decision.approvals, 2);
}

#[tokio::test]
async fn hints_outlive_the_process_that_posted_them() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state");

    {
        let store = StateStore::open(&path).unwrap().shared();
        let bus = EventBus::new().shared();
        bus.initialize();
        BlackboardCoordination::new(bus, store.clone())
            .post_hint("coverage:low", json!({ "module": "parser" }), "analyzer", None)
            .unwrap();
        store.close().unwrap();
    }

    let store = StateStore::open(&path).unwrap().shared();
    let bus = EventBus::new().shared();
    bus.initialize();
    let mut consumed = bus.subscribe();
    let blackboard = BlackboardCoordination::new(bus, store);

    let hint = blackboard
        .await_hint(&HintMatcher::prefix("coverage:"), Duration::from_millis(100))
        .await
        .unwrap()
        .expect("persisted hint delivered");
    assert_eq!(hint.posted_by, "analyzer");

    let event = consumed.recv().await.unwrap();
    assert_eq!(event.event_type, event_types::HINT_CONSUMED);
}

//! Acquisitions driven by a master channel on a simulated counter card.

mod common;

use std::time::Duration;

use common::*;
use motion_pool::{AcquisitionSpec, ElementState, PoolError, SessionOutcome};

fn timed(preset: f64) -> AcquisitionSpec {
    AcquisitionSpec {
        master: "timer".to_string(),
        preset,
    }
}

#[tokio::test(start_paused = true)]
async fn test_master_started_after_the_others() {
    let pool = pool();
    pool.engine
        .registry()
        .create_group("mntgrp", &["timer", "ct01", "ct02"])
        .unwrap();
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.acquire("mntgrp", timed(0.5), true).await.unwrap();
    assert_eq!(
        pool.counters.calls(),
        vec![
            "pre_op_all",
            "pre_op_one(0)",
            "pre_op_one(1)",
            "pre_op_one(2)",
            "op_all",
            "op_one(1)",
            "op_one(2)",
            "start_one(0, 0.5)",
        ]
    );

    let status = pool.engine.current_state("mntgrp").await.unwrap();
    assert_eq!(status.state, ElementState::Moving);
    assert!(status.diagnostic.contains("CounterTimer timer is MOVING"));

    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    assert_close(last_position(&events, pool.id("timer")).unwrap(), 0.5, "timer");
    assert_close(last_position(&events, pool.id("ct01")).unwrap(), 1000.0, "ct01");
    assert_close(last_position(&events, pool.id("ct02")).unwrap(), 1500.0, "ct02");
    for name in ["timer", "ct01", "ct02"] {
        assert_eq!(pool.state(name), ElementState::Idle);
    }
    assert!(pool.motors.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abort_hits_master_first() {
    let pool = pool();
    pool.engine
        .registry()
        .create_group("mntgrp", &["ct01", "timer", "ct02"])
        .unwrap();
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.acquire("mntgrp", timed(10.0), true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.engine.abort("mntgrp").await.unwrap();

    collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Aborted);

    let aborts: Vec<String> = pool
        .counters
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("abort_one"))
        .collect();
    assert_eq!(aborts, vec!["abort_one(0)", "abort_one(1)", "abort_one(2)"]);
    let elapsed = pool.engine.current_user_vector("mntgrp").await.unwrap()[1];
    assert!(elapsed > 0.0 && elapsed < 10.0, "timer stopped at {elapsed}");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_acquisitions_are_rejected() {
    let pool = pool();
    pool.engine
        .registry()
        .create_group("mntgrp", &["ct01", "ct02"])
        .unwrap();

    let err = pool.engine.acquire("mntgrp", timed(1.0), true).await.unwrap_err();
    assert!(matches!(err, PoolError::ElementNotFound(_)));

    let spec = AcquisitionSpec {
        master: "ct01".to_string(),
        preset: 0.0,
    };
    let err = pool.engine.acquire("mntgrp", spec, true).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidGroupState(_)));
    assert!(pool.counters.calls().is_empty());
}

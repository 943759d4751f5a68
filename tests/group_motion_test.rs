//! Group moves end to end on simulated motors.

mod common;

use std::time::Duration;

use common::*;
use motion_pool::config::EngineConfig;
use motion_pool::error::Phase;
use motion_pool::state::IDLE_DIAGNOSTIC;
use motion_pool::{ElementState, PoolError, PoolEvent, SessionOutcome};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn test_two_motor_move() {
    let pool = pool();
    let g = pool.engine.registry().create_group("g", &["a", "b"]).unwrap();
    let (a, b) = (pool.id("a"), pool.id("b"));
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[10.0, 20.0], true).await.unwrap();
    assert_eq!(
        pool.motors.calls(),
        vec![
            "pre_op_all",
            "pre_op_one(0)",
            "pre_op_one(1)",
            "op_all",
            "start_one(0, 10)",
            "start_one(1, 20)",
        ]
    );

    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    assert_eq!(
        state_changes(&events, a),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
    assert_eq!(
        state_changes(&events, b),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
    assert_eq!(
        group_state_changes(&events),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );

    // positions confirmed before the group goes idle, which comes before the end
    let group_idle = index_of(&events, |e| {
        matches!(e, PoolEvent::GroupStateChanged { new: ElementState::Idle, .. })
    })
    .unwrap();
    assert!(forced_read_of(&events, a).unwrap() < group_idle);
    assert!(forced_read_of(&events, b).unwrap() < group_idle);
    let b_idle = last_index_of(&events, |e| {
        matches!(e, PoolEvent::ElementStateChanged { element, new: ElementState::Idle, .. } if *element == b)
    })
    .unwrap();
    assert!(forced_read_of(&events, b).unwrap() < b_idle);
    assert!(matches!(events.last(), Some(PoolEvent::GroupOperationEnded { group }) if *group == g));

    assert_close(last_position(&events, a).unwrap(), 10.0, "a");
    assert_close(last_position(&events, b).unwrap(), 20.0, "b");
    let final_group_position = events.iter().rev().find_map(|e| match e {
        PoolEvent::GroupPositionChanged { positions, .. } => Some(positions.clone()),
        _ => None,
    });
    assert_eq!(final_group_position, Some(vec![10.0, 20.0]));

    let status = pool.engine.current_state("g").await.unwrap();
    assert_eq!(status.state, ElementState::Idle);
    assert_eq!(status.diagnostic, IDLE_DIAGNOSTIC);
    assert_eq!(pool.engine.current_user_vector("g").await.unwrap(), vec![10.0, 20.0]);
}

#[tokio::test(start_paused = true)]
async fn test_pseudo_move_commands_physical_targets() {
    let pool = pool();
    pool.engine.registry().create_group("slit", &["gap", "offset"]).unwrap();

    let handle = pool.engine.execute("slit", &[4.0, 0.5], true).await.unwrap();
    assert_eq!(
        pool.motors.calls_named("start_one"),
        vec!["start_one(0, 2.5)", "start_one(1, 1.5)"]
    );
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    let user = pool.engine.current_user_vector("slit").await.unwrap();
    assert_close(user[0], 4.0, "gap");
    assert_close(user[1], 0.5, "offset");
}

#[tokio::test(start_paused = true)]
async fn test_pre_op_all_failure_commands_nothing() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["gap"]).unwrap();
    pool.motors.fail_pre_op_all();
    let mut rx = pool.engine.subscribe();

    let err = pool.engine.execute("g", &[5.0], true).await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::ControllerCallFailed { phase: Phase::PreOpAll, .. }
    ));

    assert!(pool.motors.calls_named("start_one").is_empty());
    for name in ["a", "b"] {
        assert_eq!(pool.state(name), ElementState::Idle);
        let snapshot = pool.engine.registry().snapshot();
        assert!(snapshot.element_by_name(name).unwrap().runtime().owner().is_none());
    }
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_refused_element_unwinds_started_ones() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["c", "d"]).unwrap();
    pool.motors.fail_start(3);
    let c = pool.id("c");
    let mut rx = pool.engine.subscribe();

    let err = pool.engine.execute("g", &[10.0, 10.0], true).await.unwrap_err();
    assert!(matches!(err, PoolError::ControllerCallFailed { phase: Phase::StartOne, .. }));
    assert_eq!(pool.motors.calls_named("abort_one"), vec!["abort_one(2)"]);
    assert_eq!(pool.state("c"), ElementState::Idle);

    // c was announced moving, then reverted
    let mut changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        changes.push(event);
    }
    assert_eq!(
        state_changes(&changes, c),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backlash_follow_up() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["c"]).unwrap();
    pool.engine.registry().set_backlash("c", -2.0).unwrap();
    pool.motors.set_position(2, 100.0);
    let c = pool.id("c");
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[80.0], true).await.unwrap();
    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    assert_eq!(
        pool.motors.calls_named("start_one"),
        vec!["start_one(2, 82)", "start_one(2, 80)"]
    );
    // the intermediate stop is not reported
    assert_eq!(
        state_changes(&events, c),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
    assert_close(last_position(&events, c).unwrap(), 80.0, "c");
}

#[tokio::test(start_paused = true)]
async fn test_abort_never_reverts_to_moving() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a", "b"]).unwrap();
    let (a, b) = (pool.id("a"), pool.id("b"));
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[100.0, 100.0], true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    pool.engine.abort("g").await.unwrap();

    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Aborted);

    for element in [a, b] {
        let changes = state_changes(&events, element);
        let stopped = changes
            .iter()
            .position(|(_, new)| *new != ElementState::Moving)
            .unwrap();
        assert!(changes[stopped..].iter().all(|(_, new)| *new != ElementState::Moving));
        let position = last_position(&events, element).unwrap();
        assert!(position > 0.0 && position < 100.0, "stopped at {position}");
    }
    assert_eq!(pool.engine.current_state("g").await.unwrap().state, ElementState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_abort_without_session_reaches_every_element() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a", "b", "c"]).unwrap();
    pool.motors.fail_abort(1);

    let err = pool.engine.abort("g").await.unwrap_err();
    assert!(matches!(err, PoolError::AbortFailed(errors) if errors.len() == 1));
    assert_eq!(
        pool.motors.calls_named("abort_one"),
        vec!["abort_one(0)", "abort_one(1)", "abort_one(2)"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_limit_switch_aborts_the_rest() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a", "b"]).unwrap();
    pool.motors.hit_limit_after(0, Duration::from_millis(30));
    let (a, b) = (pool.id("a"), pool.id("b"));
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[10.0, 100.0], true).await.unwrap();
    let events = collect_until_ended(&mut rx).await;

    let SessionOutcome::Failed(diagnostic) = handle.wait().await else {
        panic!("expected a failed session");
    };
    assert!(diagnostic.contains("Motor a is in ALARM"), "{diagnostic}");
    assert_eq!(pool.motors.calls_named("abort_one"), vec!["abort_one(1)"]);

    assert_eq!(state_changes(&events, a).last(), Some(&(ElementState::Moving, ElementState::Alarm)));
    assert_eq!(state_changes(&events, b).last(), Some(&(ElementState::Moving, ElementState::Idle)));
    assert!(last_position(&events, b).unwrap() < 100.0);
    assert_eq!(
        group_state_changes(&events).last(),
        Some(&(ElementState::Moving, ElementState::Alarm))
    );
}

#[tokio::test(start_paused = true)]
async fn test_busy_elements_are_rejected() {
    let pool = pool();
    let registry = pool.engine.registry();
    registry.create_group("g", &["a", "b"]).unwrap();
    registry.create_group("h", &["b", "c"]).unwrap();

    let handle = pool.engine.execute("g", &[50.0, 50.0], true).await.unwrap();

    let err = pool.engine.execute("h", &[1.0, 1.0], true).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidGroupState(msg) if msg.contains("busy")));
    let err = pool.engine.execute("g", &[1.0, 1.0], true).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidGroupState(_)));
    let err = pool.engine.move_element("a", 1.0, true).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidGroupState(_)));

    assert_eq!(pool.motors.calls_named("start_one").len(), 2);
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    // free again once the first session ended
    let handle = pool.engine.execute("h", &[1.0, 1.0], true).await.unwrap();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_publishes_nothing() {
    let pool = pool();
    let g = pool.engine.registry().create_group("g", &["a", "b"]).unwrap();
    let (a, b) = (pool.id("a"), pool.id("b"));
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[1.0, 2.0], false).await.unwrap();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_eq!(pool.motors.calls_named("start_one").len(), 2);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    // stored states are untouched
    assert_eq!(pool.state("a"), ElementState::Idle);
    assert_eq!(pool.state("b"), ElementState::Idle);

    // nothing stays claimed, and the next monitored move is announced in full
    tokio::time::sleep(Duration::from_millis(100)).await;
    let handle = pool.engine.execute("g", &[0.0, 0.0], true).await.unwrap();
    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    for element in [a, b] {
        assert_eq!(
            state_changes(&events, element),
            vec![
                (ElementState::Idle, ElementState::Moving),
                (ElementState::Moving, ElementState::Idle)
            ]
        );
    }
    assert_eq!(
        group_state_changes(&events),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
    assert!(matches!(events.last(), Some(PoolEvent::GroupOperationEnded { group }) if *group == g));
}

#[tokio::test(start_paused = true)]
async fn test_element_abort_cancels_backlash_follow_up() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["c"]).unwrap();
    pool.engine.registry().set_backlash("c", -2.0).unwrap();
    pool.motors.set_position(2, 100.0);
    let c = pool.id("c");
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[80.0], true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.engine.abort_element("c").await.unwrap();

    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Aborted);
    assert_eq!(pool.motors.calls_named("start_one"), vec!["start_one(2, 82)"]);
    let position = last_position(&events, c).unwrap();
    assert!(position > 82.0 && position < 100.0, "stopped at {position}");
    assert_eq!(
        state_changes(&events, c),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_enclosing_group_abort_cancels_backlash_follow_up() {
    let pool = pool();
    let registry = pool.engine.registry();
    registry.create_group("g", &["c"]).unwrap();
    registry.create_group("p", &["g", "d"]).unwrap();
    registry.set_backlash("c", -2.0).unwrap();
    pool.motors.set_position(2, 100.0);
    let c = pool.id("c");
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[80.0], true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.engine.abort("p").await.unwrap();

    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Aborted);
    assert_eq!(pool.motors.calls_named("start_one"), vec!["start_one(2, 82)"]);
    assert_eq!(
        pool.motors.calls_named("abort_one"),
        vec!["abort_one(2)", "abort_one(3)"]
    );
    assert!(last_position(&events, c).unwrap() > 82.0);

    // a later move is not affected by the old abort
    let handle = pool.engine.execute("g", &[90.0], true).await.unwrap();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_close(pool.motors.position(2), 90.0, "c");
}

#[tokio::test(start_paused = true)]
async fn test_group_settle_delay_holds_back_the_end() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a"]).unwrap();
    pool.engine
        .registry()
        .set_settle_delay("g", Some(Duration::from_millis(500)))
        .unwrap();
    let mut rx = pool.engine.subscribe();

    let started = tokio::time::Instant::now();
    let handle = pool.engine.execute("g", &[10.0], true).await.unwrap();
    let events = collect_until_ended(&mut rx).await;
    let elapsed = started.elapsed();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    // 100 ms of motion, then the delay
    assert!(elapsed >= Duration::from_millis(600), "ended after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "ended after {elapsed:?}");
    assert_eq!(
        group_state_changes(&events),
        vec![
            (ElementState::Idle, ElementState::Moving),
            (ElementState::Moving, ElementState::Idle)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_configured_settle_delay_applies_to_single_moves() {
    let pool = pool_with(EngineConfig {
        settle_delay_ms: 300,
        ..EngineConfig::default()
    });

    let started = tokio::time::Instant::now();
    let handle = pool.engine.move_element("d", 5.0, true).await.unwrap();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(350), "ended after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "ended after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_failed_reads_reported_without_group_position() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a", "b"]).unwrap();
    pool.motors.fail_read(1);
    let (a, b) = (pool.id("a"), pool.id("b"));
    let mut rx = pool.engine.subscribe();

    let handle = pool.engine.execute("g", &[10.0, 20.0], true).await.unwrap();
    let events = collect_until_ended(&mut rx).await;
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    let b_errors: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            PoolEvent::ElementPositionChanged {
                element,
                position: Err(err),
                ..
            } if *element == b => Some(err),
            _ => None,
        })
        .collect();
    assert!(!b_errors.is_empty());
    assert!(b_errors.iter().all(|err| err.contains("not responding")), "{b_errors:?}");
    assert!(forced_read_of(&events, b).is_some());

    assert!(!events
        .iter()
        .any(|e| matches!(e, PoolEvent::GroupPositionChanged { .. })));
    assert_close(last_position(&events, a).unwrap(), 10.0, "a");
    assert_eq!(
        state_changes(&events, b).last(),
        Some(&(ElementState::Moving, ElementState::Idle))
    );
}

#[tokio::test(start_paused = true)]
async fn test_arity_checked_before_hardware() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a", "b"]).unwrap();

    let err = pool.engine.execute("g", &[1.0], true).await.unwrap_err();
    assert!(matches!(err, PoolError::ArityMismatch { expected: 2, actual: 1 }));
    assert!(pool.motors.calls().is_empty());
    assert_eq!(pool.motors.read_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_uninstantiated_controller_is_fault() {
    let pool = pool();
    pool.engine.registry().create_group("g", &["a", "b"]).unwrap();
    pool.engine.registry().set_instantiated("motctrl", false).unwrap();

    let status = pool.engine.current_state("g").await.unwrap();
    assert_eq!(status.state, ElementState::Fault);
    assert!(status.diagnostic.contains("(motctrl)"));

    let err = pool.engine.execute("g", &[1.0, 2.0], true).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidGroupState(_)));
    assert!(pool.motors.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_single_element_move() {
    let pool = pool();
    let d = pool.id("d");

    let handle = pool.engine.move_element("d", 5.0, true).await.unwrap();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_eq!(pool.motors.calls_named("start_one"), vec!["start_one(3, 5)"]);
    assert_close(pool.motors.position(3), 5.0, "d");

    let snapshot = pool.engine.registry().snapshot();
    let status = snapshot.element(d).unwrap().runtime().status();
    assert_eq!(status.state, ElementState::Idle);
    assert_eq!(status.position, Some(5.0));
    assert!(status.owner.is_none());
}

//! Common test utilities for motion_pool integration tests
//!
//! This module provides reusable test helpers for:
//! - Building a simulated pool on mock hardware
//! - Collecting notifications until an operation ends
//! - Querying collected notifications

#![allow(dead_code)] // Utilities may not all be used by every test binary

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};

use motion_pool::config::EngineConfig;
use motion_pool::element::{ElementId, Family, GroupId};
use motion_pool::hardware::{MockCounterController, MockMotorController, SlitController};
use motion_pool::{ElementState, PoolEngine, PoolEvent};

/// Simulated pool with direct access to the mock controllers.
///
/// Layout:
/// - `motctrl`: axes `a`, `b`, `c`, `d` (0..=3), 100 units/sec
/// - `slitctrl`: pseudo `gap` (role 0) and `offset` (role 1) over `a`, `b`
/// - `ctctrl`: channels `timer`, `ct01`, `ct02` (0..=2)
pub struct TestPool {
    pub engine: PoolEngine,
    pub motors: Arc<MockMotorController>,
    pub counters: Arc<MockCounterController>,
}

impl TestPool {
    pub fn id(&self, name: &str) -> ElementId {
        self.engine
            .registry()
            .snapshot()
            .element_by_name(name)
            .unwrap()
            .id
    }

    pub fn group_id(&self, name: &str) -> GroupId {
        self.engine
            .registry()
            .snapshot()
            .group_by_name(name)
            .unwrap()
            .id
    }

    /// Engine-side state of an element.
    pub fn state(&self, name: &str) -> ElementState {
        self.engine
            .registry()
            .snapshot()
            .element_by_name(name)
            .unwrap()
            .runtime()
            .state()
    }
}

/// Build the standard test pool with the default engine configuration.
pub fn pool() -> TestPool {
    pool_with(EngineConfig::default())
}

pub fn pool_with(config: EngineConfig) -> TestPool {
    let engine = PoolEngine::new(config);
    let motors = Arc::new(MockMotorController::new(4));
    let counters = Arc::new(MockCounterController::new(3));
    let registry = engine.registry();

    let motctrl = registry.register_hardware("motctrl", motors.clone()).unwrap();
    for (axis, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
        registry
            .register_physical(name, motctrl, axis, Family::Motor)
            .unwrap();
    }
    let slit = registry
        .register_pseudo("slitctrl", Arc::new(SlitController))
        .unwrap();
    registry
        .register_pseudo_element("gap", slit, 0, &["a", "b"])
        .unwrap();
    registry
        .register_pseudo_element("offset", slit, 1, &["a", "b"])
        .unwrap();

    let ctctrl = registry.register_hardware("ctctrl", counters.clone()).unwrap();
    for (axis, name) in ["timer", "ct01", "ct02"].into_iter().enumerate() {
        registry
            .register_physical(name, ctctrl, axis, Family::CounterTimer)
            .unwrap();
    }

    TestPool {
        engine,
        motors,
        counters,
    }
}

/// Receive notifications until `GroupOperationEnded` (included).
///
/// Panics if nothing ends the operation within a minute of (virtual) time.
pub async fn collect_until_ended(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("operation did not end");
        match next {
            Ok(event) => {
                let ended = matches!(event, PoolEvent::GroupOperationEnded { .. });
                events.push(event);
                if ended {
                    return events;
                }
            }
            Err(RecvError::Lagged(missed)) => panic!("missed {missed} notifications"),
            Err(RecvError::Closed) => panic!("event bus closed"),
        }
    }
}

/// `(old, new)` of every state notification of `element`, in order.
pub fn state_changes(events: &[PoolEvent], element: ElementId) -> Vec<(ElementState, ElementState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PoolEvent::ElementStateChanged { element: id, old, new } if *id == element => {
                Some((*old, *new))
            }
            _ => None,
        })
        .collect()
}

/// `(old, new)` of every group state notification, in order.
pub fn group_state_changes(events: &[PoolEvent]) -> Vec<(ElementState, ElementState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PoolEvent::GroupStateChanged { old, new, .. } => Some((*old, *new)),
            _ => None,
        })
        .collect()
}

/// Index of the first notification matching `pred`.
pub fn index_of(events: &[PoolEvent], pred: impl Fn(&PoolEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

/// Index of the last notification matching `pred`.
pub fn last_index_of(events: &[PoolEvent], pred: impl Fn(&PoolEvent) -> bool) -> Option<usize> {
    events.iter().rposition(pred)
}

/// Index of the forced (final) position read of `element`.
pub fn forced_read_of(events: &[PoolEvent], element: ElementId) -> Option<usize> {
    last_index_of(events, |e| {
        matches!(e, PoolEvent::ElementPositionChanged { element: id, forced: true, .. } if *id == element)
    })
}

/// Last position notified for `element`.
pub fn last_position(events: &[PoolEvent], element: ElementId) -> Option<f64> {
    events.iter().rev().find_map(|e| match e {
        PoolEvent::ElementPositionChanged {
            element: id,
            position: Ok(value),
            ..
        } if *id == element => Some(*value),
        _ => None,
    })
}

/// Assert two floats are equal within `1e-6`.
pub fn assert_close(actual: f64, expected: f64, context: &str) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "{context}: expected {expected}, got {actual}"
    );
}

//! Integration tests for command gating, emergency stop escalation and
//! token-guarded recovery against a running supervisor.

use std::sync::Arc;

use async_trait::async_trait;
use coach_bootable::Bootable;
use coach_safety::{
    Error, Interlock, InterlockEngine, InterlockEngineOptions, StateValue, keys,
    standard_interlocks,
};
use coach_supervisor::{
    LifecycleState, SafetyClass, ServiceDescriptor, ServiceDescriptorOptions, Supervisor,
    SupervisorOptions,
};

const TOKEN: &str = "jacks-up-slides-in";

struct Noop(String);

#[async_trait]
impl Bootable for Noop {
    fn name(&self) -> &str {
        &self.0
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

fn descriptor(name: &str, safety_class: SafetyClass) -> ServiceDescriptor {
    ServiceDescriptor::new(ServiceDescriptorOptions {
        name: name.to_string(),
        body: Arc::new(Noop(name.to_string())),
        dependencies: Vec::new(),
        tags: Vec::new(),
        safety_class,
        description: format!("{name} test service"),
        heartbeat: None,
    })
}

fn guard_interlocks() -> Vec<Interlock> {
    vec![
        Interlock::new(
            "parking-brake",
            SafetyClass::PositionCritical,
            "parking brake must be engaged",
            |view| view.flag(keys::PARKING_BRAKE_ENGAGED) == Some(true),
        ),
        Interlock::new(
            "slides-retracted",
            SafetyClass::PositionCritical,
            "all slide-outs must be retracted",
            |view| view.flag(keys::SLIDES_RETRACTED) == Some(true),
        ),
        Interlock::new(
            "jacks-down",
            SafetyClass::PositionCritical,
            "leveling jacks must be down",
            |view| view.flag("jacks_down") == Some(true),
        ),
    ]
}

async fn engine_with_fleet() -> (Supervisor, InterlockEngine) {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    supervisor
        .register(descriptor("can-bus", SafetyClass::Critical))
        .unwrap();
    supervisor
        .register(descriptor("slide-controller", SafetyClass::PositionCritical))
        .unwrap();
    supervisor
        .register(descriptor("logger", SafetyClass::Operational))
        .unwrap();
    supervisor.startup_all().await.unwrap();

    let engine = InterlockEngine::new(
        supervisor.clone(),
        InterlockEngineOptions {
            emergency_stop_threshold: 3,
            authorization_token: TOKEN.to_string(),
            forensic_retention: 4,
        },
    );
    engine.update_system_state("jacks_down", StateValue::Bool(true));
    for interlock in guard_interlocks() {
        engine.register_interlock(interlock);
    }
    (supervisor, engine)
}

#[tokio::test]
async fn test_commands_gated_by_matching_interlocks() {
    let (_supervisor, engine) = engine_with_fleet().await;

    // Safe baseline: everything allowed.
    engine.evaluate_command("slide-controller", "extend-slide").unwrap();
    engine.evaluate_command("logger", "rotate-logs").unwrap();

    engine.update_system_state(keys::PARKING_BRAKE_ENGAGED, StateValue::Bool(false));
    let err = engine
        .evaluate_command("slide-controller", "extend-slide")
        .unwrap_err();
    match err {
        Error::InterlockViolation {
            interlock, message, ..
        } => {
            assert_eq!(interlock, "parking-brake");
            assert_eq!(message, "parking brake must be engaged");
        }
        other => panic!("expected interlock violation, got {other:?}"),
    }

    // Interlocks guard position-critical services, not operational ones.
    engine.evaluate_command("logger", "rotate-logs").unwrap();
    assert!(!engine.emergency_stop_active());
}

#[tokio::test]
async fn test_emergency_stop_on_simultaneous_violations() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (supervisor, engine) = engine_with_fleet().await;

    engine.update_system_state(keys::PARKING_BRAKE_ENGAGED, StateValue::Bool(false));
    engine.update_system_state(keys::SLIDES_RETRACTED, StateValue::Bool(false));
    assert!(!engine.emergency_stop_active());

    engine.update_system_state("jacks_down", StateValue::Bool(false));
    assert!(engine.emergency_stop_active());

    // Guarded services are forced into safe shutdown; others are untouched.
    assert_eq!(
        supervisor.get_state("slide-controller").unwrap(),
        LifecycleState::SafeShutdown
    );
    assert_eq!(
        supervisor.get_state("can-bus").unwrap(),
        LifecycleState::SafeShutdown
    );
    assert_eq!(
        supervisor.get_state("logger").unwrap(),
        LifecycleState::Healthy
    );

    // Commands against guarded services are rejected while engaged.
    assert!(matches!(
        engine.evaluate_command("slide-controller", "extend-slide"),
        Err(Error::EmergencyStopActive { .. })
    ));

    // Further updates do not raise a second stop.
    engine.update_system_state(keys::VEHICLE_SPEED, StateValue::Number(20.0));
    assert_eq!(engine.forensic_snapshots().len(), 1);
}

#[tokio::test]
async fn test_forensic_snapshot_captures_the_moment() {
    let (_supervisor, engine) = engine_with_fleet().await;

    engine.update_system_state(keys::PARKING_BRAKE_ENGAGED, StateValue::Bool(false));
    engine.update_system_state(keys::SLIDES_RETRACTED, StateValue::Bool(false));
    engine.update_system_state("jacks_down", StateValue::Bool(false));

    let snapshot = engine.last_forensic_snapshot().unwrap();
    assert_eq!(
        snapshot.violated,
        vec!["jacks-down", "parking-brake", "slides-retracted"]
    );
    assert_eq!(
        snapshot.system_state.get(keys::PARKING_BRAKE_ENGAGED),
        Some(&StateValue::Bool(false))
    );
    assert!(snapshot.forced_services.contains(&"slide-controller".to_string()));
    serde_json::to_string(&snapshot).unwrap();
}

#[tokio::test]
async fn test_clear_requires_authorization_token() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (supervisor, engine) = engine_with_fleet().await;

    engine.update_system_state(keys::PARKING_BRAKE_ENGAGED, StateValue::Bool(false));
    engine.update_system_state(keys::SLIDES_RETRACTED, StateValue::Bool(false));
    engine.update_system_state("jacks_down", StateValue::Bool(false));
    assert!(engine.emergency_stop_active());

    // Restore a safe state before attempting to clear.
    engine.update_system_state(keys::PARKING_BRAKE_ENGAGED, StateValue::Bool(true));
    engine.update_system_state(keys::SLIDES_RETRACTED, StateValue::Bool(true));
    engine.update_system_state("jacks_down", StateValue::Bool(true));

    assert!(matches!(
        engine.clear_emergency_stop("wrong-token"),
        Err(Error::Authorization)
    ));
    assert!(engine.emergency_stop_active());

    engine.clear_emergency_stop(TOKEN).unwrap();
    assert!(!engine.emergency_stop_active());

    // Released services may re-initialize.
    assert_eq!(
        supervisor.get_state("slide-controller").unwrap(),
        LifecycleState::Stopped
    );
    supervisor
        .start_service("slide-controller", "restart after emergency stop")
        .await;
    assert_eq!(
        supervisor.get_state("slide-controller").unwrap(),
        LifecycleState::Healthy
    );
}

#[tokio::test]
async fn test_clear_without_active_stop_is_rejected() {
    let (_supervisor, engine) = engine_with_fleet().await;
    assert!(matches!(
        engine.clear_emergency_stop(TOKEN),
        Err(Error::NotActive)
    ));
}

#[tokio::test]
async fn test_manual_trigger_and_baseline_interlocks() {
    let supervisor = Supervisor::new(SupervisorOptions::default());
    supervisor
        .register(descriptor("jack-controller", SafetyClass::PositionCritical))
        .unwrap();
    supervisor.startup_all().await.unwrap();

    let engine = InterlockEngine::new(
        supervisor.clone(),
        InterlockEngineOptions {
            emergency_stop_threshold: 3,
            authorization_token: TOKEN.to_string(),
            forensic_retention: 4,
        },
    );
    for interlock in standard_interlocks() {
        engine.register_interlock(interlock);
    }
    // The safe baseline violates nothing.
    assert!(engine.violated_interlocks().is_empty());

    engine.trigger_emergency_stop("operator hit the big red button");
    assert!(engine.emergency_stop_active());
    assert_eq!(
        supervisor.get_state("jack-controller").unwrap(),
        LifecycleState::SafeShutdown
    );
    let snapshot = engine.last_forensic_snapshot().unwrap();
    assert_eq!(snapshot.cause, "operator hit the big red button");
}

//! Graph construction rules: typed connectors, interfaces, layout and locking.

#![cfg(feature = "robot")]

use alembic::prelude::*;
use alembic::robot::{self, ROBOT, ROBOT_ADD_ON, RobotState};

async fn spawn(lab: &Arc<Lab>, type_name: &str) -> Arc<Process> {
    lab.create_process(type_name).await.unwrap()
}

#[tokio::test]
async fn test_connectors_follow_the_type_lattice() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let create = spawn(&lab, "Create").await;
    let addon = spawn(&lab, "AddOnCreate").await;
    let add = spawn(&lab, "Add").await;
    let walk = spawn(&lab, "Move").await;
    for (name, process) in [("create", &create), ("addon", &addon), ("add", &add), ("walk", &walk)] {
        protocol.add_process(name, process).unwrap();
    }

    assert!(matches!(
        protocol.connect(&addon, "addon", &walk, "robot"),
        Err(EngineError::TypeMismatch { .. })
    ));

    protocol.connect(&create, "robot", &add, "robot").unwrap();
    protocol.connect(&addon, "addon", &add, "addon").unwrap();
    // A mega robot is still a robot.
    protocol.connect(&add, "mega_robot", &walk, "robot").unwrap();
    assert_eq!(protocol.connectors().len(), 3);
    assert!(walk.in_port("robot").unwrap().is_connected());
}

#[tokio::test]
async fn test_bad_endpoints_are_rejected() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let first = spawn(&lab, "Move").await;
    let second = spawn(&lab, "Move").await;
    let stranger = spawn(&lab, "Create").await;
    protocol.add_process("first", &first).unwrap();
    protocol.add_process("second", &second).unwrap();

    assert!(matches!(
        protocol.connect(&first, "robot", &first, "robot"),
        Err(EngineError::Configuration(_))
    ));
    assert!(matches!(
        protocol.connect(&first, "wheel", &second, "robot"),
        Err(EngineError::PortNotFound { .. })
    ));
    assert!(matches!(
        protocol.connect(&stranger, "robot", &second, "robot"),
        Err(EngineError::ProcessNotFound(_))
    ));
    assert!(protocol.connectors().is_empty());
}

#[tokio::test]
async fn test_an_input_port_takes_a_single_link() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let a = spawn(&lab, "Create").await;
    let b = spawn(&lab, "Create").await;
    let eat = spawn(&lab, "Eat").await;
    protocol.add_process("a", &a).unwrap();
    protocol.add_process("b", &b).unwrap();
    protocol.add_process("eat", &eat).unwrap();

    protocol.connect(&a, "robot", &eat, "robot").unwrap();
    assert!(matches!(
        protocol.connect(&a, "robot", &eat, "robot"),
        Err(EngineError::Configuration(_))
    ));
    assert!(matches!(
        protocol.connect(&b, "robot", &eat, "robot"),
        Err(EngineError::Configuration(_))
    ));
    assert_eq!(protocol.connectors().len(), 1);
    assert!(!b.out_port("robot").unwrap().is_connected());
}

#[tokio::test]
async fn test_interfaces_and_connectors_exclude_each_other() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let create = spawn(&lab, "Create").await;
    let walk = spawn(&lab, "Move").await;
    let eat = spawn(&lab, "Eat").await;
    protocol.add_process("create", &create).unwrap();
    protocol.add_process("walk", &walk).unwrap();
    protocol.add_process("eat", &eat).unwrap();

    protocol.connect(&create, "robot", &walk, "robot").unwrap();
    assert!(matches!(
        protocol.set_interface("robot", &walk, "robot"),
        Err(EngineError::Configuration(_))
    ));

    protocol.set_interface("robot", &eat, "robot").unwrap();
    assert!(protocol.in_port("robot").is_ok());
    assert!(protocol.is_interfaced_with(&eat));
    assert!(matches!(
        protocol.connect(&walk, "robot", &eat, "robot"),
        Err(EngineError::Configuration(_))
    ));
    assert!(matches!(
        protocol.set_interface("robot", &walk, "robot"),
        Err(EngineError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_outerface_exposes_an_output_port() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let create = spawn(&lab, "Create").await;
    protocol.add_process("create", &create).unwrap();

    assert!(protocol.out_port("robot").is_err());
    protocol.set_outerface("robot", &create, "robot").unwrap();
    let port = protocol.out_port("robot").unwrap();
    assert!(port.spec().accepts(&ROBOT));
    assert!(protocol.is_outerfaced_with(&create));
    assert!(protocol.validate().warnings().is_empty());
}

#[tokio::test]
async fn test_validation_locks_the_structure() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let walk = spawn(&lab, "Move").await;
    protocol.add_process("walk", &walk).unwrap();

    let result = protocol.validate();
    assert!(!result.is_safe());
    assert_eq!(result.errors().len(), 1);
    assert!(result.errors()[0].contains("walk"));
    assert!(result.has_warnings());
    assert!(matches!(protocol.mark_validated(), Err(EngineError::Graph(_))));
    assert!(!protocol.is_validated());

    let create = spawn(&lab, "Create").await;
    protocol.add_process("create", &create).unwrap();
    protocol.connect(&create, "robot", &walk, "robot").unwrap();
    protocol.mark_validated().unwrap();
    assert!(protocol.is_validated());

    let late = spawn(&lab, "Eat").await;
    assert!(matches!(
        protocol.add_process("late", &late),
        Err(EngineError::ProtocolLocked(_))
    ));
    assert!(matches!(
        protocol.set_outerface("robot", &walk, "robot"),
        Err(EngineError::ProtocolLocked(_))
    ));
}

#[tokio::test]
async fn test_inputs_filled_by_hand_count_as_fed() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let walk = spawn(&lab, "Move").await;
    protocol.add_process("walk", &walk).unwrap();
    assert!(!protocol.validate().is_safe());

    let robot = Arc::new(RobotState::default().into_resource(&ROBOT));
    walk.set_input("robot", robot).unwrap();
    let result = protocol.validate();
    assert!(result.is_safe());
    assert!(result.errors().is_empty());
    protocol.mark_validated().unwrap();
    assert!(protocol.is_validated());
}

#[tokio::test]
async fn test_nested_validation_reports_paths() {
    let lab = Lab::in_memory();
    let outer = Protocol::new(&lab).await.unwrap();
    let inner = Protocol::new(&lab).await.unwrap();
    let eat = spawn(&lab, "Eat").await;
    inner.add_process("eat", &eat).unwrap();
    outer.add_process("inner", inner.process()).unwrap();

    let errors = outer.validate().errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("inner.eat"));
}

#[tokio::test]
async fn test_children_belong_to_one_protocol_under_one_name() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let other = Protocol::new(&lab).await.unwrap();
    let create = spawn(&lab, "Create").await;
    protocol.add_process("create", &create).unwrap();

    assert!(matches!(
        protocol.add_process("again", &create),
        Err(EngineError::Configuration(_))
    ));
    assert!(matches!(
        other.add_process("create", &create),
        Err(EngineError::Configuration(_))
    ));
    let twin = spawn(&lab, "Create").await;
    assert!(matches!(
        protocol.add_process("create", &twin),
        Err(EngineError::Configuration(_))
    ));
    assert!(matches!(
        protocol.add_process("self", protocol.process()),
        Err(EngineError::Configuration(_))
    ));

    assert_eq!(create.instance_name(), "create");
    assert!(Arc::ptr_eq(&create.parent().unwrap(), protocol.process()));
    assert!(protocol.is_child(&create));
    assert!(!other.is_child(&create));
}

#[tokio::test]
async fn test_layout_defaults_to_the_origin() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let create = spawn(&lab, "Create").await;
    protocol.add_process("create", &create).unwrap();

    assert_eq!(protocol.position("create"), [0.0, 0.0]);
    protocol.set_position("create", 3.0, -4.5).unwrap();
    assert_eq!(protocol.position("create"), [3.0, -4.5]);
    assert!(matches!(
        protocol.set_position("ghost", 1.0, 1.0),
        Err(EngineError::ProcessNotFound(_))
    ));
}

#[tokio::test]
async fn test_manual_inputs_are_type_checked() {
    let lab = Lab::in_memory();
    let eat = Process::create(&lab, robot::Eat).await.unwrap();
    assert!(!eat.is_ready());

    let addon = Arc::new(Resource::new(&ROBOT_ADD_ON, serde_json::json!({})));
    assert!(matches!(
        eat.set_input("robot", addon),
        Err(EngineError::TypeMismatch { .. })
    ));
    assert!(!eat.is_ready());

    let robot = Arc::new(RobotState::default().into_resource(&ROBOT));
    eat.set_input("robot", robot).unwrap();
    assert!(eat.is_ready());
    assert!(matches!(
        eat.set_input("fuel", Arc::new(Resource::new(&ROBOT, serde_json::json!({})))),
        Err(EngineError::PortNotFound { .. })
    ));
}

#[tokio::test]
async fn test_params_are_checked_against_their_specs() {
    let lab = Lab::in_memory();
    let wait = spawn(&lab, "Wait").await;
    assert_eq!(wait.get_f64("waiting_time").unwrap(), 0.5);

    assert!(matches!(
        wait.set_param("waiting_time", 7200.0),
        Err(EngineError::InvalidParameter { .. })
    ));
    assert!(matches!(
        wait.set_param("speed", 1.0),
        Err(EngineError::InvalidParameter { .. })
    ));
    wait.set_param("waiting_time", 2.0).unwrap();
    assert_eq!(wait.get_f64("waiting_time").unwrap(), 2.0);
}

#[tokio::test]
async fn test_behaviours_downcast_to_their_concrete_type() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let eat = spawn(&lab, "Eat").await;
    protocol.add_process("eat", &eat).unwrap();

    assert!(eat.behaviour().as_any().downcast_ref::<robot::Eat>().is_some());
    assert!(eat.behaviour().as_any().downcast_ref::<robot::Move>().is_none());
    assert!(eat.as_protocol().is_none());

    let view = protocol.process().as_protocol().unwrap();
    assert!(view.is_child(&eat));
}

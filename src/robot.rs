//! Robot demo bricks.
//!
//! A small set of process types moving a robot around, used by the tests and
//! as a worked example of [`ProcessLogic`] implementations. Enabled by the
//! `robot` feature.

use crate::core::config::{ConfigSpecs, ParamSpec, ParamType, config_specs};
use crate::core::error::{EngineError, Result};
use crate::core::io::{PortSpec, PortSpecs, port_specs};
use crate::core::process::{Process, ProcessLogic, ProcessRegistry};
use crate::core::protocol::Protocol;
use crate::core::resource::{RESOURCE, Resource, ResourceType};
use crate::lab::Lab;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Resource types
// ============================================================================

pub static ROBOT: ResourceType = ResourceType::derived("Robot", &RESOURCE);
pub static ROBOT_ADD_ON: ResourceType = ResourceType::derived("RobotAddOn", &RESOURCE);
pub static MEGA_ROBOT: ResourceType = ResourceType::derived("MegaRobot", &ROBOT);

const DIRECTIONS: [&str; 4] = ["north", "south", "east", "west"];

/// The state of a robot as carried in resource data.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    pub age: i64,
    pub position: [f64; 2],
    pub weight: f64,
}

impl Default for RobotState {
    fn default() -> Self {
        Self {
            age: 9,
            position: [0.0, 0.0],
            weight: 70.0,
        }
    }
}

impl RobotState {
    /// Reads a robot from a resource, falling back to the defaults for
    /// missing fields.
    pub fn of(resource: &Resource) -> Self {
        let defaults = Self::default();
        let data = resource.data();
        let position = data
            .get("position")
            .and_then(Value::as_array)
            .map(|coords| coords.iter().filter_map(Value::as_f64).collect::<Vec<_>>());
        Self {
            age: data.get("age").and_then(Value::as_i64).unwrap_or(defaults.age),
            position: match position.as_deref() {
                Some([x, y]) => [*x, *y],
                _ => defaults.position,
            },
            weight: resource.get_f64("weight").unwrap_or(defaults.weight),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "age": self.age,
            "position": self.position,
            "weight": self.weight,
        })
    }

    pub fn into_resource(self, kind: &'static ResourceType) -> Resource {
        Resource::new(kind, self.to_json())
    }
}

fn robot_port() -> PortSpecs {
    port_specs([("robot", PortSpec::new(&ROBOT))])
}

fn moving_specs(step: f64, direction: &str, what: &str) -> ConfigSpecs {
    config_specs([
        (
            "moving_step",
            ParamSpec::new(ParamType::Float)
                .with_default(step)
                .with_description(format!("The {} step of the robot", what)),
        ),
        (
            "direction",
            ParamSpec::new(ParamType::Str)
                .with_default(direction)
                .with_allowed_values(DIRECTIONS)
                .with_description(format!("The {} direction", what)),
        ),
    ])
}

/// Moves the input robot one step and reports progress along the way.
async fn move_robot(process: &Arc<Process>) -> Result<()> {
    let mut robot = RobotState::of(&*process.input_resource("robot")?);
    let step = process.get_f64("moving_step")?;
    let direction = process.get_str("direction")?;
    match direction.as_str() {
        "north" => robot.position[1] += step,
        "south" => robot.position[1] -= step,
        "east" => robot.position[0] += step,
        "west" => robot.position[0] -= step,
        other => {
            return Err(EngineError::InvalidParameter {
                name: "direction".into(),
                reason: format!("unknown direction '{}'", other),
            });
        }
    }
    for i in 0..100 {
        process.update_progress(i as f64, &format!("Moving iteration {}", i)).await?;
    }
    process.set_output("robot", robot.into_resource(&ROBOT))
}

// ============================================================================
// Processes
// ============================================================================

#[derive(Debug, Default)]
pub struct Create;

#[async_trait]
impl ProcessLogic for Create {
    fn type_name(&self) -> &'static str {
        "Create"
    }

    fn title(&self) -> String {
        "Create robot".into()
    }

    fn description(&self) -> String {
        "This process creates a robot".into()
    }

    fn output_specs(&self) -> PortSpecs {
        robot_port()
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        process.set_output("robot", RobotState::default().into_resource(&ROBOT))
    }
}

#[derive(Debug, Default)]
pub struct Move;

#[async_trait]
impl ProcessLogic for Move {
    fn type_name(&self) -> &'static str {
        "Move"
    }

    fn title(&self) -> String {
        "Move robot".into()
    }

    fn description(&self) -> String {
        "This process emulates a short moving step of the robot".into()
    }

    fn input_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn output_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn config_specs(&self) -> ConfigSpecs {
        moving_specs(0.1, "north", "moving")
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        move_robot(process).await
    }
}

#[derive(Debug, Default)]
pub struct Eat;

#[async_trait]
impl ProcessLogic for Eat {
    fn type_name(&self) -> &'static str {
        "Eat"
    }

    fn title(&self) -> String {
        "Eat process".into()
    }

    fn description(&self) -> String {
        "This process emulates the meal of the robot before its flight!".into()
    }

    fn input_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn output_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn config_specs(&self) -> ConfigSpecs {
        config_specs([("food_weight", ParamSpec::new(ParamType::Float).with_default(3.14))])
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        let mut robot = RobotState::of(&*process.input_resource("robot")?);
        robot.weight += process.get_f64("food_weight")?;
        process.set_output("robot", robot.into_resource(&ROBOT))
    }
}

#[derive(Debug, Default)]
pub struct Wait;

#[async_trait]
impl ProcessLogic for Wait {
    fn type_name(&self) -> &'static str {
        "Wait"
    }

    fn title(&self) -> String {
        "Wait process".into()
    }

    fn description(&self) -> String {
        "This process emulates the resting time of the robot before its flight!".into()
    }

    fn input_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn output_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn config_specs(&self) -> ConfigSpecs {
        config_specs([(
            "waiting_time",
            ParamSpec::new(ParamType::Float)
                .with_default(0.5)
                .with_range(0.0, 3600.0)
                .with_unit("s"),
        )])
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        let robot = RobotState::of(&*process.input_resource("robot")?);
        process.set_output("robot", robot.into_resource(&ROBOT))?;
        let waiting_time = process.get_f64("waiting_time")?;
        tokio::time::sleep(Duration::from_secs_f64(waiting_time)).await;
        Ok(())
    }
}

/// A long move, with its own defaults.
#[derive(Debug, Default)]
pub struct Fly;

#[async_trait]
impl ProcessLogic for Fly {
    fn type_name(&self) -> &'static str {
        "Fly"
    }

    fn title(&self) -> String {
        "Fly process".into()
    }

    fn description(&self) -> String {
        "This process emulates the fly of the robot. It moves like Move, only further.".into()
    }

    fn input_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn output_specs(&self) -> PortSpecs {
        robot_port()
    }

    fn config_specs(&self) -> ConfigSpecs {
        let mut specs = moving_specs(1000.0, "west", "flying");
        if let Some(step) = specs.get_mut("moving_step") {
            step.unit = Some("km".into());
        }
        specs
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        move_robot(process).await
    }
}

/// Fits an add-on onto a robot, producing a mega robot.
#[derive(Debug, Default)]
pub struct Add;

#[async_trait]
impl ProcessLogic for Add {
    fn type_name(&self) -> &'static str {
        "Add"
    }

    fn input_specs(&self) -> PortSpecs {
        port_specs([
            ("robot", PortSpec::new(&ROBOT)),
            ("addon", PortSpec::new(&ROBOT_ADD_ON)),
        ])
    }

    fn output_specs(&self) -> PortSpecs {
        port_specs([("mega_robot", PortSpec::new(&MEGA_ROBOT))])
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        let robot = RobotState::of(&*process.input_resource("robot")?);
        let addon = process.input_resource("addon")?;
        let mut data = robot.to_json();
        data["addon_uri"] = Value::from(addon.uri());
        process.set_output("mega_robot", Resource::new(&MEGA_ROBOT, data))
    }
}

#[derive(Debug, Default)]
pub struct AddOnCreate;

#[async_trait]
impl ProcessLogic for AddOnCreate {
    fn type_name(&self) -> &'static str {
        "AddOnCreate"
    }

    fn output_specs(&self) -> PortSpecs {
        port_specs([("addon", PortSpec::new(&ROBOT_ADD_ON))])
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        process.set_output("addon", Resource::new(&ROBOT_ADD_ON, json!({})))
    }
}

/// Registers the robot process and resource types.
pub fn register(registry: &mut ProcessRegistry) {
    registry
        .register::<Create>()
        .register::<Move>()
        .register::<Eat>()
        .register::<Wait>()
        .register::<Fly>()
        .register::<Add>()
        .register::<AddOnCreate>();
    registry
        .register_resource(&ROBOT)
        .register_resource(&ROBOT_ADD_ON)
        .register_resource(&MEGA_ROBOT);
}

// ============================================================================
// Protocols
// ============================================================================

async fn add_all(lab: &Arc<Lab>, protocol: &Protocol, children: Vec<(&str, &str)>) -> Result<()> {
    for (name, type_name) in children {
        let process = lab.create_process(type_name).await?;
        protocol.add_process(name, &process)?;
    }
    Ok(())
}

fn connect_all(protocol: &Protocol, links: &[(&str, &str, &str, &str)]) -> Result<()> {
    for (source, source_port, target, target_port) in links {
        protocol.connect(
            &protocol.get_process(source)?,
            source_port,
            &protocol.get_process(target)?,
            target_port,
        )?;
    }
    Ok(())
}

/// The travel of Astro: a self-contained protocol starting from `Create`.
///
/// ```text
/// facto -> move_1 -> eat_1 -> wait_1 -> move_2 -> move_3
///                      \-> eat_2 -> fly_1
/// ```
pub async fn travel_protocol(lab: &Arc<Lab>) -> Result<Protocol> {
    let protocol = Protocol::new(lab).await?;
    add_all(
        lab,
        &protocol,
        vec![
            ("facto", "Create"),
            ("move_1", "Move"),
            ("eat_1", "Eat"),
            ("move_2", "Move"),
            ("move_3", "Move"),
            ("eat_2", "Eat"),
            ("fly_1", "Fly"),
            ("wait_1", "Wait"),
        ],
    )
    .await?;
    connect_all(
        &protocol,
        &[
            ("facto", "robot", "move_1", "robot"),
            ("move_1", "robot", "eat_1", "robot"),
            ("eat_1", "robot", "wait_1", "robot"),
            ("wait_1", "robot", "move_2", "robot"),
            ("move_2", "robot", "move_3", "robot"),
            ("eat_1", "robot", "eat_2", "robot"),
            ("eat_2", "robot", "fly_1", "robot"),
        ],
    )?;
    protocol.set_title("The travel of `Astro`");
    protocol.set_description("This is the travel of astro composed of several steps: move, eat, wait and fly.");
    Ok(protocol)
}

/// A travel fed from outside: interface `robot` feeds `move_1`, outerface
/// `robot` exposes `eat_2`. A mega robot is assembled on the way.
pub async fn mini_travel_protocol(lab: &Arc<Lab>) -> Result<Protocol> {
    let protocol = Protocol::new(lab).await?;
    add_all(
        lab,
        &protocol,
        vec![
            ("move_1", "Move"),
            ("eat_1", "Eat"),
            ("move_2", "Move"),
            ("move_3", "Move"),
            ("eat_2", "Eat"),
            ("wait_1", "Wait"),
            ("add_1", "Add"),
            ("addon_create_1", "AddOnCreate"),
        ],
    )
    .await?;
    connect_all(
        &protocol,
        &[
            ("move_1", "robot", "eat_1", "robot"),
            ("eat_1", "robot", "wait_1", "robot"),
            ("addon_create_1", "addon", "add_1", "addon"),
            ("wait_1", "robot", "add_1", "robot"),
            ("add_1", "mega_robot", "move_2", "robot"),
            ("move_2", "robot", "move_3", "robot"),
            ("eat_1", "robot", "eat_2", "robot"),
        ],
    )?;
    protocol.set_interface("robot", &protocol.get_process("move_1")?, "robot")?;
    protocol.set_outerface("robot", &protocol.get_process("eat_2")?, "robot")?;
    protocol.set_title("The mini travel of Astro");
    Ok(protocol)
}

/// Nests the mini travel between a move and a flight.
pub async fn super_travel_protocol(lab: &Arc<Lab>) -> Result<Protocol> {
    let protocol = Protocol::new(lab).await?;
    let sub_travel = mini_travel_protocol(lab).await?;
    protocol.add_process("sub_travel", sub_travel.process())?;
    add_all(
        lab,
        &protocol,
        vec![("move_4", "Move"), ("fly_1", "Fly"), ("eat_3", "Eat"), ("wait_2", "Wait")],
    )
    .await?;
    connect_all(
        &protocol,
        &[
            ("move_4", "robot", "sub_travel", "robot"),
            ("sub_travel", "robot", "fly_1", "robot"),
            ("sub_travel", "robot", "eat_3", "robot"),
            ("fly_1", "robot", "wait_2", "robot"),
        ],
    )?;
    protocol.set_interface("robot", &protocol.get_process("move_4")?, "robot")?;
    protocol.set_outerface("robot", &protocol.get_process("eat_3")?, "robot")?;
    protocol.set_title("The super travel of Astro");
    Ok(protocol)
}

/// Two levels of nesting, starting from `Create`.
pub async fn world_travel_protocol(lab: &Arc<Lab>) -> Result<Protocol> {
    let protocol = Protocol::new(lab).await?;
    let super_travel = super_travel_protocol(lab).await?;
    protocol.add_process("super_travel", super_travel.process())?;
    add_all(lab, &protocol, vec![("facto", "Create"), ("fly_1", "Fly"), ("wait_2", "Wait")]).await?;
    connect_all(
        &protocol,
        &[
            ("facto", "robot", "super_travel", "robot"),
            ("super_travel", "robot", "fly_1", "robot"),
            ("fly_1", "robot", "wait_2", "robot"),
        ],
    )?;
    protocol.set_title("The world trip of Astro");
    Ok(protocol)
}

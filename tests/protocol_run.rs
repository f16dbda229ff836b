//! End-to-end runs of robot protocols inside experiments.

#![cfg(feature = "robot")]

use alembic::prelude::*;
use alembic::RecordKind;
use alembic::robot::{self, ROBOT, RobotState};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `p0 -> p1 -> p2`, with `p2` feeding two branches.
async fn fan_out_protocol(lab: &Arc<Lab>) -> (Protocol, Vec<Arc<Process>>) {
    let protocol = Protocol::new(lab).await.unwrap();
    let processes = vec![
        Process::create(lab, robot::Create).await.unwrap(),
        Process::create(lab, robot::Move).await.unwrap(),
        Process::create(lab, robot::Eat).await.unwrap(),
        Process::create(lab, robot::Wait).await.unwrap(),
        Process::create(lab, robot::Fly).await.unwrap(),
    ];
    for (i, process) in processes.iter().enumerate() {
        protocol.add_process(&format!("p{}", i), process).unwrap();
    }
    let p = &processes;
    protocol.connect(&p[0], "robot", &p[1], "robot").unwrap();
    protocol.connect(&p[1], "robot", &p[2], "robot").unwrap();
    protocol.connect(&p[2], "robot", &p[3], "robot").unwrap();
    protocol.connect(&p[2], "robot", &p[4], "robot").unwrap();
    (protocol, processes)
}

#[tokio::test(start_paused = true)]
async fn test_food_weight_flows_downstream() {
    let lab = Lab::in_memory();
    let (protocol, p) = fan_out_protocol(&lab).await;
    p[2].set_param("food_weight", 5.6).unwrap();

    let user = User::new("astro");
    let experiment = Experiment::new(&lab, Study::new("Travel"), user.clone(), Some(protocol.clone()))
        .await
        .unwrap();
    experiment.run(&user).await.unwrap();

    let created = RobotState::of(&p[0].output_resource("robot").unwrap());
    assert_eq!(created.weight, 70.0);

    let before_meal = RobotState::of(&p[2].input_resource("robot").unwrap());
    let after_meal = RobotState::of(&p[2].output_resource("robot").unwrap());
    assert_eq!(before_meal.weight, 70.0);
    assert_eq!(after_meal.weight, before_meal.weight + 5.6);

    let flown = RobotState::of(&p[4].output_resource("robot").unwrap());
    assert_eq!(flown.position, [-1000.0, 0.1]);

    assert!(p.iter().all(|process| process.is_finished()));
    assert!(protocol.is_finished());
    assert!(experiment.is_finished().await.unwrap());
    assert!(!experiment.is_running().await.unwrap());
    assert!(!experiment.has_failed());
}

#[derive(Default)]
struct Counting {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessLogic for Counting {
    fn type_name(&self) -> &'static str {
        "Counting"
    }

    async fn task(&self, _process: &Arc<Process>) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_task_runs_once_however_often_triggered() {
    let lab = Lab::in_memory();
    let runs = Arc::new(AtomicUsize::new(0));
    let process = Process::create(
        &lab,
        Counting {
            runs: Arc::clone(&runs),
        },
    )
    .await
    .unwrap();

    let (a, b, c) = tokio::join!(process.run(), process.run(), process.run());
    a.unwrap();
    b.unwrap();
    c.unwrap();
    process.run().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(process.is_finished());
    assert!(!process.is_ready());
}

/// Reports progress twice and records what the store holds after each report.
#[derive(Default)]
struct Reporting {
    stored: Arc<Mutex<Vec<JsonValue>>>,
}

impl Reporting {
    async fn stored_bar(&self, process: &Arc<Process>) {
        let uri = process.job().progress_bar().uri().to_string();
        let record = process
            .lab()
            .store()
            .get_by_uri(RecordKind::ProgressBar, &uri)
            .await
            .unwrap()
            .unwrap();
        self.stored.lock().unwrap().push(record.body);
    }
}

#[async_trait]
impl ProcessLogic for Reporting {
    fn type_name(&self) -> &'static str {
        "Reporting"
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        assert!(process.update_progress(40.0, "halfway").await?);
        self.stored_bar(process).await;
        assert!(!process.update_progress(20.0, "backwards").await?);
        self.stored_bar(process).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_accepted_progress_is_visible_in_the_store() {
    let lab = Lab::with_settings(LabSettings::default().with_progress_min_delta(0.0));
    let stored = Arc::new(Mutex::new(Vec::new()));
    let process = Process::create(
        &lab,
        Reporting {
            stored: Arc::clone(&stored),
        },
    )
    .await
    .unwrap();
    process.run().await.unwrap();

    let stored = stored.lock().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0]["value"], 40.0);
    assert_eq!(stored[0]["messages"].as_array().unwrap().len(), 1);
    assert_eq!(stored[0]["messages"][0]["text"], "halfway");
    // A dropped update leaves the stored bar untouched.
    assert_eq!(stored[1], stored[0]);
    assert!(process.job().is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_nested_completion_percolates_level_by_level() {
    let lab = Lab::in_memory();
    let world = robot::world_travel_protocol(&lab).await.unwrap();
    let super_travel = world.get_process("super_travel").unwrap().as_protocol().unwrap();
    let sub_travel = super_travel.get_process("sub_travel").unwrap().as_protocol().unwrap();

    let ends: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    for protocol in [&sub_travel, &super_travel, &world] {
        let ends = Arc::clone(&ends);
        let handle = protocol.clone();
        protocol.events().on(Event::End, move |process: &Process| {
            ends.lock()
                .unwrap()
                .push((process.title(), handle.all_children_finished()));
        });
    }

    let user = User::new("astro");
    let experiment = Experiment::new(&lab, Study::new("World"), user.clone(), Some(world.clone()))
        .await
        .unwrap();
    experiment.run(&user).await.unwrap();

    let ends = ends.lock().unwrap().clone();
    assert_eq!(
        ends,
        vec![
            ("The mini travel of Astro".to_string(), true),
            ("The super travel of Astro".to_string(), true),
            ("The world trip of Astro".to_string(), true),
        ]
    );

    let arrived = RobotState::of(&world.get_process("wait_2").unwrap().output_resource("robot").unwrap());
    assert_eq!(arrived.weight, 70.0 + 3.14 + 3.14 + 3.14);
    assert_eq!(arrived.position, [-1000.0, 0.1 + 0.1]);

    let mega = sub_travel.get_process("add_1").unwrap().output_resource("mega_robot").unwrap();
    assert_eq!(mega.kind().name(), "MegaRobot");
    assert!(mega.data()["addon_uri"].is_string());
    assert!(experiment.is_finished().await.unwrap());
}

#[derive(Default)]
struct Explode;

#[async_trait]
impl ProcessLogic for Explode {
    fn type_name(&self) -> &'static str {
        "Explode"
    }

    fn input_specs(&self) -> PortSpecs {
        port_specs([("robot", PortSpec::new(&ROBOT))])
    }

    async fn task(&self, process: &Arc<Process>) -> Result<()> {
        Err(EngineError::task(process.instance_name(), "the robot exploded"))
    }
}

#[tokio::test]
async fn test_failed_branch_leaves_the_other_one_complete() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let a_create = Process::create(&lab, robot::Create).await.unwrap();
    let a_boom = Process::create(&lab, Explode).await.unwrap();
    let b_create = Process::create(&lab, robot::Create).await.unwrap();
    let b_eat = Process::create(&lab, robot::Eat).await.unwrap();
    protocol.add_process("a_create", &a_create).unwrap();
    protocol.add_process("a_boom", &a_boom).unwrap();
    protocol.add_process("b_create", &b_create).unwrap();
    protocol.add_process("b_eat", &b_eat).unwrap();
    protocol.connect(&a_create, "robot", &a_boom, "robot").unwrap();
    protocol.connect(&b_create, "robot", &b_eat, "robot").unwrap();

    let user = User::new("astro");
    let experiment = Experiment::new(&lab, Study::new("Crash"), user.clone(), Some(protocol.clone()))
        .await
        .unwrap();
    let err = experiment.run(&user).await.unwrap_err();
    assert!(matches!(err, EngineError::Task { .. }));

    assert!(b_eat.is_finished());
    let meal = b_eat.output_resource("robot").unwrap();
    let persisted = Resource::load(&lab, meal.uri()).await.unwrap().unwrap();
    assert_eq!(persisted.job_uri().as_deref(), Some(b_eat.job().uri()));
    assert_eq!(persisted.experiment_uri().as_deref(), Some(experiment.uri()));

    assert!(a_create.is_finished());
    assert!(a_boom.is_running());
    assert!(!a_boom.is_finished());
    assert!(!protocol.is_finished());

    assert!(experiment.has_failed());
    assert!(experiment.error().unwrap().contains("exploded"));
    assert!(!experiment.is_finished().await.unwrap());
    assert!(experiment.is_running().await.unwrap());
    assert_eq!(Experiment::count_of_running_experiments(&lab).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_record_provenance() {
    let lab = Lab::in_memory();
    let (protocol, p) = fan_out_protocol(&lab).await;
    let user = User::new("astro");
    let experiment = Experiment::new(&lab, Study::new("Lineage"), user.clone(), Some(protocol.clone()))
        .await
        .unwrap();
    experiment.run(&user).await.unwrap();

    let eat_job = p[2].job();
    assert_eq!(eat_job.experiment_uri().as_deref(), Some(experiment.uri()));
    assert_eq!(eat_job.parent_job_uri().as_deref(), Some(protocol.job().uri()));
    assert!(eat_job.is_finished());

    let inputs = eat_job.inputs();
    assert_eq!(inputs.len(), 1);
    let trace = &inputs[0];
    assert_eq!(trace.port, "robot");
    assert_eq!(
        trace.resource_uri.as_deref(),
        Some(p[1].output_resource("robot").unwrap().uri())
    );
    let upstream = trace.upstream.as_ref().unwrap();
    assert_eq!(upstream.instance_name, "p1");
    assert_eq!(upstream.job_uri, p[1].job().uri());

    let source = eat_job.source().unwrap().unwrap();
    assert_eq!(source["type"], "Eat");
    assert!(source["config_specs"]["food_weight"].is_object());

    let flow = protocol.job_flow();
    assert_eq!(flow["jobs"].as_object().unwrap().len(), 5);
    let flows = flow["flows"].as_array().unwrap();
    assert_eq!(flows.len(), 4);
    assert!(flows.iter().all(|f| f["resource_uri"].is_string()));
    assert_eq!(flow["job_uri"], protocol.job().uri());
}

#[tokio::test]
async fn test_protocol_without_experiment_refuses_to_run() {
    let lab = Lab::in_memory();
    let protocol = Protocol::new(&lab).await.unwrap();
    let create = Process::create(&lab, robot::Create).await.unwrap();
    protocol.add_process("create", &create).unwrap();

    let err = protocol.run().await.unwrap_err();
    assert!(matches!(err, EngineError::MissingExperiment(_)));
    assert!(!create.is_running());
    assert!(!create.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_finished_protocol_is_locked() {
    let lab = Lab::in_memory();
    let (protocol, _) = fan_out_protocol(&lab).await;
    let user = User::new("astro");
    let experiment = Experiment::new(&lab, Study::new("Lock"), user.clone(), Some(protocol.clone()))
        .await
        .unwrap();
    experiment.run(&user).await.unwrap();

    let late = Process::create(&lab, robot::Eat).await.unwrap();
    assert!(matches!(
        protocol.add_process("late", &late),
        Err(EngineError::ProtocolLocked(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_and_end_events_fire_once() {
    let lab = Lab::in_memory();
    let (protocol, p) = fan_out_protocol(&lab).await;
    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    {
        let starts = Arc::clone(&starts);
        p[2].events().on(Event::Start, move |_: &Process| {
            starts.fetch_add(1, Ordering::SeqCst);
        });
        let ends = Arc::clone(&ends);
        protocol.events().on(Event::End, move |_: &Process| {
            ends.fetch_add(1, Ordering::SeqCst);
        });
    }

    let user = User::new("astro");
    let experiment = Experiment::new(&lab, Study::new("Events"), user.clone(), Some(protocol.clone()))
        .await
        .unwrap();
    experiment.run(&user).await.unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}

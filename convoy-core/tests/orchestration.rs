//! End-to-end orchestration tests against a recording mock runtime.

use convoy_core::compose::ComposeParser;
use convoy_core::lifecycle::ControllerSettings;
use convoy_core::manifest::ServiceId;
use convoy_core::runtime::HealthStatus;
use convoy_core::testing::MockRuntime;
use convoy_core::{
    ConvoyError, DriverSettings, Manifest, Orchestrator, ParseErrorKind, ServiceState, StopOutcome,
    UpOptions,
};
use proptest::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const THREE_TIER: &str = r#"
services:
  frontend:
    build: ./frontend
    ports:
      - "3000:3000"
    stdin_open: true
    tty: true
    depends_on:
      - backend
  backend:
    build: ./backend
    environment:
      MONGO_URL: mongodb://mongodb:27017/app
    depends_on:
      - mongodb
  mongodb:
    image: mongo:7
    volumes:
      - mongo-data:/data/db
      - /data/configdb
volumes:
  mongo-data:
"#;

const DETACHED: UpOptions = UpOptions { detached: true, build: false };

fn settings() -> DriverSettings {
    DriverSettings {
        max_parallel: 4,
        level_timeout: Duration::from_secs(5),
        controller: ControllerSettings {
            stop_grace: Duration::from_millis(50),
            stop_slack: Duration::from_millis(50),
            health_timeout: Duration::from_secs(2),
            health_poll_interval: Duration::from_millis(10),
        },
    }
}

fn manifest(yaml: &str) -> Manifest {
    let compose = ComposeParser::parse(yaml).unwrap();
    Manifest::load(compose, Path::new("/srv/mern"), "mern").unwrap()
}

fn orchestrator(yaml: &str, runtime: &Arc<MockRuntime>) -> Orchestrator {
    Orchestrator::with_settings(manifest(yaml), runtime.clone(), settings())
}

fn id(orchestrator: &Orchestrator, name: &str) -> ServiceId {
    orchestrator.manifest().service_by_name(name).unwrap().id
}

async fn state(orchestrator: &Orchestrator, name: &str) -> ServiceState {
    orchestrator.state().state(id(orchestrator, name)).await
}

#[tokio::test]
async fn test_three_tier_up_detached() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let report = orchestrator.up(DETACHED).await.unwrap();

    assert_eq!(report.levels, vec![vec!["mongodb"], vec!["backend"], vec!["frontend"]]);
    for name in ["mongodb", "backend", "frontend"] {
        assert_eq!(state(&orchestrator, name).await, ServiceState::Running, "{}", name);
    }

    assert_eq!(
        runtime.calls_of("create_container"),
        vec![
            "create_container mern-mongodb-1",
            "create_container mern-backend-1",
            "create_container mern-frontend-1",
        ]
    );
    assert_eq!(runtime.calls_of("pull_image"), vec!["pull_image mongo:7"]);
    assert_eq!(
        runtime.calls_of("build_image"),
        vec!["build_image mern-backend:latest", "build_image mern-frontend:latest"]
    );
    assert_eq!(runtime.calls_of("create_network"), vec!["create_network mern_default"]);
    assert_eq!(runtime.calls_of("create_volume"), vec!["create_volume mern_mongo-data"]);

    // Shared resources exist before the first container
    let calls = runtime.calls();
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
    assert!(position("create_network mern_default") < position("create_container mern-mongodb-1"));
    assert!(position("create_volume mern_mongo-data") < position("create_container mern-mongodb-1"));
}

#[tokio::test]
async fn test_container_spec_carries_env_network_and_flags() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    orchestrator.up(DETACHED).await.unwrap();

    let backend = runtime.spec("mern-backend-1").unwrap();
    assert_eq!(backend.image, "mern-backend:latest");
    assert_eq!(backend.env["MONGO_URL"], "mongodb://mongodb:27017/app");
    assert_eq!(backend.networks.len(), 1);
    assert_eq!(backend.networks[0].network, "mern_default");
    assert!(backend.networks[0].aliases.contains(&"backend".to_string()));

    let frontend = runtime.spec("mern-frontend-1").unwrap();
    assert!(frontend.tty);
    assert!(frontend.stdin_open);
    assert_eq!(frontend.ports[0].host_port, 3000);

    let mongodb = runtime.spec("mern-mongodb-1").unwrap();
    assert_eq!(mongodb.mounts.len(), 2);
}

#[tokio::test]
async fn test_creation_failure_stops_progression() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.fail_on("create_container mern-backend-1");
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    let ConvoyError::PartialFailure { failures } = &err else {
        panic!("expected partial failure, got {:?}", err);
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service, "backend");
    assert_eq!(failures[0].state, ServiceState::Pending);
    assert_eq!(err.exit_code(), 5);

    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Running);
    assert_eq!(state(&orchestrator, "backend").await, ServiceState::Failed);
    assert_eq!(state(&orchestrator, "frontend").await, ServiceState::Pending);
    assert!(!runtime.calls().iter().any(|c| c.contains("mern-frontend-1")));
}

#[tokio::test]
async fn test_image_failure_is_reported_per_service() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.fail_on("pull_image mongo:7");
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    let ConvoyError::PartialFailure { failures } = err else {
        panic!("expected partial failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service, "mongodb");
    assert!(failures[0].reason.contains("pulling mongo:7"));

    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Failed);
    assert!(runtime.calls_of("create_container").is_empty());
}

#[tokio::test]
async fn test_cycle_makes_no_runtime_calls() {
    let yaml = r#"
services:
  backend:
    image: api
    depends_on: [frontend]
  frontend:
    image: web
    depends_on: [backend]
"#;
    let compose = ComposeParser::parse(yaml).unwrap();
    let manifest = Manifest::resolve(compose, Path::new("/srv/mern"), "mern").unwrap();
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = Orchestrator::with_settings(manifest, runtime.clone(), settings());

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    match &err {
        ConvoyError::CycleDetected { participants } => {
            assert_eq!(participants, &vec!["backend".to_string(), "frontend".to_string()]);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 3);
    assert!(runtime.calls().is_empty());

    // Loading validates acyclicity too
    let compose = ComposeParser::parse(yaml).unwrap();
    match Manifest::load(compose, Path::new("/srv/mern"), "mern") {
        Err(ConvoyError::Parse(e)) => assert_eq!(e.kind, ParseErrorKind::CyclicDependency),
        other => panic!("expected parse error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_provisioning_conflict_is_fatal() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.add_network("mern_default", "overlay");
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    assert!(matches!(err, ConvoyError::Provisioning { .. }), "{:?}", err);
    assert_eq!(err.exit_code(), 4);
    assert!(runtime.calls_of("create_container").is_empty());
}

#[tokio::test]
async fn test_teardown_is_reverse_of_startup() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    orchestrator.up(DETACHED).await.unwrap();

    let report = orchestrator.stop().await.unwrap();

    assert_eq!(
        runtime.calls_of("stop"),
        vec!["stop mern-frontend-1", "stop mern-backend-1", "stop mern-mongodb-1"]
    );
    assert_eq!(
        report.stopped,
        vec![
            ("frontend".to_string(), StopOutcome::Graceful),
            ("backend".to_string(), StopOutcome::Graceful),
            ("mongodb".to_string(), StopOutcome::Graceful),
        ]
    );
    for name in ["mongodb", "backend", "frontend"] {
        assert_eq!(state(&orchestrator, name).await, ServiceState::Stopped);
    }
    // Resources untouched
    assert!(runtime.calls_of("remove_network").is_empty());
    assert!(runtime.calls_of("remove").is_empty());
}

#[tokio::test]
async fn test_up_again_reuses_everything() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    orchestrator.up(DETACHED).await.unwrap();
    let report = orchestrator.up(DETACHED).await.unwrap();

    assert_eq!(runtime.calls_of("create_network").len(), 1);
    assert_eq!(runtime.calls_of("create_volume").len(), 1);
    assert_eq!(runtime.calls_of("create_container").len(), 3);
    assert_eq!(runtime.calls_of("start").len(), 3);
    assert!(report.images.values().all(|a| *a == convoy_core::images::ImageAction::Present));
}

#[tokio::test]
async fn test_up_in_fresh_process_restarts_existing_containers() {
    let runtime = Arc::new(MockRuntime::default());
    orchestrator(THREE_TIER, &runtime).up(DETACHED).await.unwrap();
    orchestrator(THREE_TIER, &runtime).stop().await.unwrap();

    let fresh = orchestrator(THREE_TIER, &runtime);
    let report = fresh.up(DETACHED).await.unwrap();

    assert_eq!(report.levels.len(), 3);
    assert_eq!(runtime.count("create_container"), 3);
    let restarts = runtime.calls_of("start").split_off(3);
    assert_eq!(
        restarts,
        vec!["start mern-mongodb-1", "start mern-backend-1", "start mern-frontend-1"]
    );
    for name in ["mongodb", "backend", "frontend"] {
        assert_eq!(state(&fresh, name).await, ServiceState::Running, "{}", name);
    }

    // Already running: nothing is created or started
    orchestrator(THREE_TIER, &runtime).up(DETACHED).await.unwrap();
    assert_eq!(runtime.count("create_container"), 3);
    assert_eq!(runtime.count("start"), 6);
}

#[tokio::test]
async fn test_down_keeps_named_volumes() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    orchestrator.up(DETACHED).await.unwrap();

    let report = orchestrator.down(false).await.unwrap();

    assert_eq!(
        runtime.calls_of("remove"),
        vec!["remove mern-frontend-1", "remove mern-backend-1", "remove mern-mongodb-1"]
    );
    assert_eq!(runtime.anonymous_volumes_removed().len(), 3);
    assert_eq!(runtime.calls_of("remove_network"), vec!["remove_network mern_default"]);
    assert!(runtime.calls_of("remove_volume").is_empty());
    assert!(runtime.has_volume("mern_mongo-data"));
    assert!(!runtime.has_container("mern-mongodb-1"));

    assert_eq!(report.removed, vec!["frontend", "backend", "mongodb"]);
    assert!(!report.volumes_removed);
    for name in ["mongodb", "backend", "frontend"] {
        assert_eq!(state(&orchestrator, name).await, ServiceState::Removed);
    }
}

#[tokio::test]
async fn test_down_with_volumes_removes_named_volumes() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    orchestrator.up(DETACHED).await.unwrap();

    let report = orchestrator.down(true).await.unwrap();

    assert_eq!(runtime.calls_of("remove_volume"), vec!["remove_volume mern_mongo-data"]);
    assert!(!runtime.has_volume("mern_mongo-data"));
    assert!(report.volumes_removed);
}

#[tokio::test]
async fn test_stop_timeout_kills_and_is_not_fatal() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.hang_on_stop("mern-mongodb-1");
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    orchestrator.up(DETACHED).await.unwrap();

    let report = orchestrator.stop().await.unwrap();

    assert_eq!(runtime.calls_of("kill"), vec!["kill mern-mongodb-1"]);
    assert_eq!(report.degraded().collect::<Vec<_>>(), vec!["mongodb"]);
    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Stopped);
}

const HEALTH_GATED: &str = r#"
services:
  mongodb:
    image: mongo:7
    healthcheck:
      test: ["CMD", "mongosh", "--eval", "db.adminCommand('ping')"]
      interval: 1s
  backend:
    image: api:1
    depends_on:
      mongodb:
        condition: service_healthy
"#;

#[tokio::test]
async fn test_service_healthy_dependency_waits_for_health() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.health_after_start("mern-mongodb-1", HealthStatus::Healthy);
    let orchestrator = orchestrator(HEALTH_GATED, &runtime);

    orchestrator.up(DETACHED).await.unwrap();

    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Healthy);
    assert_eq!(state(&orchestrator, "backend").await, ServiceState::Running);
    assert!(runtime.spec("mern-mongodb-1").unwrap().healthcheck.is_some());
}

#[tokio::test]
async fn test_unhealthy_dependency_blocks_dependents() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.health_after_start("mern-mongodb-1", HealthStatus::Unhealthy);
    let orchestrator = orchestrator(HEALTH_GATED, &runtime);

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    let ConvoyError::PartialFailure { failures } = err else {
        panic!("expected partial failure");
    };
    assert_eq!(failures[0].service, "mongodb");
    assert_eq!(failures[0].state, ServiceState::Running);

    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Failed);
    assert_eq!(state(&orchestrator, "backend").await, ServiceState::Pending);
}

#[tokio::test]
async fn test_crashed_dependency_blocks_dependents() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.exit_after_start("mern-mongodb-1", 1);
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    let ConvoyError::PartialFailure { failures } = &err else {
        panic!("expected partial failure, got {:?}", err);
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service, "mongodb");
    assert_eq!(failures[0].reason, "exited with code 1");
    assert_eq!(err.exit_code(), 5);

    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Failed);
    assert_eq!(state(&orchestrator, "backend").await, ServiceState::Pending);
    assert_eq!(state(&orchestrator, "frontend").await, ServiceState::Pending);
    assert_eq!(runtime.calls_of("create_container"), vec!["create_container mern-mongodb-1"]);
}

#[tokio::test]
async fn test_clean_exit_does_not_block_dependents() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.exit_after_start("mern-mongodb-1", 0);
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    orchestrator.up(DETACHED).await.unwrap();

    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Stopped);
    assert_eq!(state(&orchestrator, "frontend").await, ServiceState::Running);
}

#[tokio::test]
async fn test_level_timeout_fails_unfinished_services() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.delay_create("mern-mongodb-1", Duration::from_secs(10));
    let orchestrator = Orchestrator::with_settings(
        manifest(THREE_TIER),
        runtime.clone(),
        DriverSettings { level_timeout: Duration::from_millis(100), ..settings() },
    );

    let err = orchestrator.up(DETACHED).await.unwrap_err();
    let ConvoyError::PartialFailure { failures } = err else {
        panic!("expected partial failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service, "mongodb");
    assert!(failures[0].reason.contains("did not come up"));
    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Failed);
    assert_eq!(state(&orchestrator, "backend").await, ServiceState::Pending);
}

#[tokio::test]
async fn test_interrupt_tears_down_level_in_flight() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.delay_create("mern-mongodb-1", Duration::from_millis(300));
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    let cancel = orchestrator.cancel_handle();

    let (result, _) = tokio::join!(orchestrator.up(DETACHED), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = result.unwrap_err();
    assert!(matches!(err, ConvoyError::Cancelled), "{:?}", err);
    assert_eq!(err.exit_code(), 6);

    // The in-flight creation finished, then the level was torn down
    assert_eq!(runtime.calls_of("create_container"), vec!["create_container mern-mongodb-1"]);
    assert_eq!(runtime.calls_of("stop"), vec!["stop mern-mongodb-1"]);
    assert_eq!(runtime.calls_of("remove"), vec!["remove mern-mongodb-1"]);
    assert_eq!(state(&orchestrator, "mongodb").await, ServiceState::Removed);
    assert_eq!(state(&orchestrator, "backend").await, ServiceState::Pending);
}

#[tokio::test]
async fn test_fresh_orchestrator_adopts_existing_containers() {
    let runtime = Arc::new(MockRuntime::default());
    orchestrator(THREE_TIER, &runtime).up(DETACHED).await.unwrap();

    let fresh = orchestrator(THREE_TIER, &runtime);
    let statuses = fresh.ps().await.unwrap();
    assert_eq!(statuses.len(), 3);
    for status in &statuses {
        assert_eq!(status.state, ServiceState::Running, "{}", status.service);
        assert_eq!(status.container_id.as_deref(), Some(status.container_name.as_str()));
    }

    fresh.stop().await.unwrap();
    assert_eq!(
        runtime.calls_of("stop"),
        vec!["stop mern-frontend-1", "stop mern-backend-1", "stop mern-mongodb-1"]
    );
}

#[tokio::test]
async fn test_ps_reports_crashed_service() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);
    orchestrator.up(DETACHED).await.unwrap();

    runtime.exit("mern-backend-1", 1).unwrap();

    let statuses = orchestrator.ps().await.unwrap();
    let backend = statuses.iter().find(|s| s.service == "backend").unwrap();
    assert_eq!(backend.state, ServiceState::Failed);
    assert_eq!(backend.last_error.as_deref(), Some("exited with code 1"));

    // Independent services are left untouched
    let mongodb = statuses.iter().find(|s| s.service == "mongodb").unwrap();
    assert_eq!(mongodb.state, ServiceState::Running);
}

#[tokio::test]
async fn test_foreground_up_follows_logs_then_stops() {
    let runtime = Arc::new(MockRuntime::default());
    runtime.push_log_line("Compiled successfully");
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let report = orchestrator.up(UpOptions { detached: false, build: false }).await.unwrap();

    assert_eq!(report.attached.as_deref(), Some("frontend"));
    assert_eq!(runtime.calls_of("stream_logs"), vec!["stream_logs mern-frontend-1"]);
    for name in ["mongodb", "backend", "frontend"] {
        assert_eq!(state(&orchestrator, name).await, ServiceState::Stopped);
    }
}

#[tokio::test]
async fn test_config_renders_startup_order() {
    let runtime = Arc::new(MockRuntime::default());
    let orchestrator = orchestrator(THREE_TIER, &runtime);

    let yaml = orchestrator.config().unwrap();
    let mongodb = yaml.find("  mongodb:").unwrap();
    let frontend = yaml.find("  frontend:").unwrap();
    assert!(mongodb < frontend);
    assert!(yaml.contains("mern-backend:latest"));
    assert!(runtime.calls().is_empty());
}

/// Services `s0..count`: `s{i}` depends on `s{i+1}` around a ring over the
/// first `ring` services, plus acyclic edges towards lower indexes.
fn cyclic_compose(count: usize, ring: usize, edges: &[(usize, usize)]) -> String {
    let mut deps: Vec<std::collections::BTreeSet<usize>> = vec![Default::default(); count];
    for i in 0..ring {
        deps[i].insert((i + 1) % ring);
    }
    for &(a, b) in edges {
        if a > b {
            deps[a].insert(b);
        }
    }

    let mut yaml = String::from("services:\n");
    for (service, on) in deps.iter().enumerate() {
        yaml.push_str(&format!("  s{}:\n    image: app\n", service));
        if !on.is_empty() {
            let names: Vec<String> = on.iter().map(|d| format!("s{}", d)).collect();
            yaml.push_str(&format!("    depends_on: [{}]\n", names.join(", ")));
        }
    }
    yaml
}

fn arb_cyclic_graph() -> impl Strategy<Value = (usize, usize, Vec<(usize, usize)>)> {
    (1usize..8).prop_flat_map(|count| {
        (Just(count), 1..=count, prop::collection::vec((0..count, 0..count), 0..16))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cyclic_manifest_never_reaches_the_runtime((count, ring, edges) in arb_cyclic_graph()) {
        let compose = ComposeParser::parse(&cyclic_compose(count, ring, &edges)).unwrap();
        let manifest = Manifest::resolve(compose, Path::new("/srv/mern"), "mern").unwrap();
        let runtime = Arc::new(MockRuntime::default());
        let orchestrator = Orchestrator::with_settings(manifest, runtime.clone(), settings());

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        match rt.block_on(orchestrator.up(DETACHED)) {
            Err(ConvoyError::CycleDetected { participants }) => {
                for i in 0..ring {
                    let name = format!("s{}", i);
                    prop_assert!(participants.contains(&name), "{} missing from {:?}", name, participants);
                }
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
        prop_assert!(runtime.calls().is_empty());
    }
}

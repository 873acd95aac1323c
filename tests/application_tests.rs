use std::time::Duration;

use chrono::Utc;
use fleet_api::{HeartbeatRequest, RegisterRequest, SignatureAuthenticator};
use fleet_core::models::{InstructionType, MetricMap, TaskStatus};
use fleet_core::traits::ScriptRepository;
use fleet_core::AppConfig;
use fleet_scheduler::app::FleetApplication;
use fleet_scheduler::shutdown::ShutdownManager;
use fleet_testing_utils::{ScriptBuilder, TaskBuilder};

#[tokio::test]
async fn test_application_wires_device_and_operator_services() {
    let app = FleetApplication::new(AppConfig::default()).await.unwrap();
    app.scripts().create(&ScriptBuilder::new().build()).await.unwrap();

    let registered = app
        .devices()
        .register(RegisterRequest {
            device_code: "D1".to_string(),
            device_name: "lobby kiosk".to_string(),
            certificate_request: "csr".to_string(),
            group_id: None,
            hardware: Default::default(),
        })
        .await
        .unwrap();

    let task = app
        .operator()
        .create_task(TaskBuilder::new().targeting_all().spec())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.total_devices, 1);

    let mut heartbeat = HeartbeatRequest {
        device_code: "D1".to_string(),
        timestamp: Utc::now().timestamp(),
        signature: String::new(),
        metrics: MetricMap::new(),
        poll_timeout: Some(0),
    };
    heartbeat.signature = SignatureAuthenticator::sign(
        "D1",
        heartbeat.timestamp,
        &registered.certificate,
        &heartbeat.signed_fields(),
    )
    .unwrap();

    let response = app.devices().heartbeat(heartbeat).await.unwrap();
    let kinds: Vec<InstructionType> = response
        .instructions
        .iter()
        .map(|i| i.instruction_type)
        .collect();
    assert_eq!(kinds, vec![InstructionType::Welcome, InstructionType::ExecuteTask]);
}

#[tokio::test]
async fn test_scan_once_dispatches_due_tasks() {
    let app = FleetApplication::new(AppConfig::default()).await.unwrap();
    app.scripts().create(&ScriptBuilder::new().build()).await.unwrap();

    let summary = app.scan_once().await.unwrap();
    assert_eq!(summary.dispatched(), 0);

    let task = app
        .operator()
        .create_task(
            TaskBuilder::new()
                .targeting_all()
                .scheduled_at(Utc::now() - chrono::Duration::seconds(1))
                .spec(),
        )
        .await
        .unwrap();

    app.scan_once().await.unwrap();
    // 没有任何设备，分发失败并记录原因
    let stored = app.operator().get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("no available target devices"));
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let app = FleetApplication::new(AppConfig::default()).await.unwrap();
    let shutdown = ShutdownManager::new();
    let rx = shutdown.subscribe();

    let handle = tokio::spawn(async move { app.run(rx).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[test]
fn test_default_config_round_trips_through_toml() {
    let config = AppConfig::default();
    let rendered = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&rendered).unwrap();
    assert_eq!(parsed.queue.max_poll_timeout_seconds, 60);
    assert_eq!(parsed.auth.replay_window_seconds, 300);
}

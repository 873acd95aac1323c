use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_api::{
    DeviceService, HeartbeatRequest, OperatorService, RegisterRequest, ReportRequest,
    SignatureAuthenticator,
};
use fleet_core::config::QueueConfig;
use fleet_core::models::{ExecutionStatus, InstructionType, MetricMap, TaskStatus};
use fleet_core::FleetError;
use fleet_dispatcher::{ExecutionStatusStore, TaskDispatcher, TaskScheduler, TaskTargetResolver};
use fleet_testing_utils::{ScriptBuilder, TaskBuilder, TestBackends};
use serde_json::json;

struct Fleet {
    devices: Arc<DeviceService>,
    operator: OperatorService,
}

async fn fleet() -> Fleet {
    let backends = TestBackends::new();
    backends.add_script(ScriptBuilder::new().build()).await;

    let queue = backends.queue();
    let presence = backends.presence();
    let resolver = TaskTargetResolver::new(backends.directory.clone());
    let dispatcher = Arc::new(TaskDispatcher::new(
        backends.tasks.clone(),
        backends.scripts.clone(),
        resolver.clone(),
        queue.clone(),
        ExecutionStatusStore::new(
            backends.store.clone(),
            backends.keys.clone(),
            Duration::from_secs(3600),
        ),
        backends.lock(),
    ));
    let scheduler = Arc::new(TaskScheduler::new(
        backends.tasks.clone(),
        backends.scripts.clone(),
        resolver,
        dispatcher.clone(),
    ));

    let devices = Arc::new(DeviceService::new(
        backends.directory.clone(),
        SignatureAuthenticator::default(),
        presence.clone(),
        queue.clone(),
        dispatcher,
        QueueConfig::default(),
    ));
    let operator = OperatorService::new(
        scheduler,
        backends.directory.clone(),
        queue,
        presence,
        QueueConfig {
            preview_limit: 2,
            ..QueueConfig::default()
        },
    );

    Fleet { devices, operator }
}

fn register_request(code: &str) -> RegisterRequest {
    RegisterRequest {
        device_code: code.to_string(),
        device_name: format!("kiosk {code}"),
        certificate_request: format!("csr-{code}"),
        group_id: None,
        hardware: Default::default(),
    }
}

fn heartbeat(code: &str, certificate: &str, poll_timeout: Option<u64>) -> HeartbeatRequest {
    let mut request = HeartbeatRequest {
        device_code: code.to_string(),
        timestamp: Utc::now().timestamp(),
        signature: String::new(),
        metrics: MetricMap::new(),
        poll_timeout,
    };
    request.signature = SignatureAuthenticator::sign(
        code,
        request.timestamp,
        certificate,
        &request.signed_fields(),
    )
    .unwrap();
    request
}

fn signed_report(
    code: &str,
    certificate: &str,
    instruction_id: &str,
    status: ExecutionStatus,
) -> ReportRequest {
    let mut request = ReportRequest::new(code, instruction_id, status);
    request.signature = SignatureAuthenticator::sign(
        code,
        request.timestamp,
        certificate,
        &request.signed_fields(),
    )
    .unwrap();
    request
}

#[tokio::test]
async fn test_register_is_idempotent_and_welcomes_once() {
    let fleet = fleet().await;

    let first = fleet.devices.register(register_request("D1")).await.unwrap();
    let second = fleet.devices.register(register_request("D1")).await.unwrap();
    assert!(first.first_registration);
    assert!(!second.first_registration);
    assert_eq!(first.certificate, second.certificate);

    let response = fleet
        .devices
        .heartbeat(heartbeat("D1", &first.certificate, Some(0)))
        .await
        .unwrap();
    assert_eq!(response.instructions.len(), 1);
    assert_eq!(response.instructions[0].instruction_type, InstructionType::Welcome);
}

#[tokio::test]
async fn test_register_requires_device_code_and_request() {
    let fleet = fleet().await;

    let mut missing_code = register_request("D1");
    missing_code.device_code = " ".to_string();
    assert!(matches!(
        fleet.devices.register(missing_code).await,
        Err(FleetError::Validation(_))
    ));

    let mut missing_csr = register_request("D1");
    missing_csr.certificate_request.clear();
    assert!(matches!(
        fleet.devices.register(missing_csr).await,
        Err(FleetError::Validation(_))
    ));
}

#[tokio::test]
async fn test_heartbeat_rejects_bad_credentials() {
    let fleet = fleet().await;
    let registered = fleet.devices.register(register_request("D1")).await.unwrap();

    let unknown = fleet
        .devices
        .heartbeat(heartbeat("D9", &registered.certificate, Some(0)))
        .await
        .unwrap_err();
    assert!(unknown.is_authentication());

    let wrong_key = fleet
        .devices
        .heartbeat(heartbeat("D1", "not-the-certificate", Some(0)))
        .await
        .unwrap_err();
    assert!(wrong_key.is_authentication());

    let mut stale = heartbeat("D1", &registered.certificate, Some(0));
    stale.timestamp -= 600;
    stale.signature = SignatureAuthenticator::sign(
        "D1",
        stale.timestamp,
        &registered.certificate,
        &stale.signed_fields(),
    )
    .unwrap();
    assert!(fleet.devices.heartbeat(stale).await.unwrap_err().is_authentication());

    // 签名后改动轮询时长也会被识破
    let mut tampered = heartbeat("D1", &registered.certificate, Some(0));
    tampered.poll_timeout = Some(1);
    assert!(fleet
        .devices
        .heartbeat(tampered)
        .await
        .unwrap_err()
        .is_authentication());

    // 认证失败的请求不会取走指令
    let welcome = fleet.operator.preview_queue("D1", None).await.unwrap();
    assert_eq!(welcome.len(), 1);
}

#[tokio::test]
async fn test_heartbeat_records_presence_and_metrics() {
    let fleet = fleet().await;
    let registered = fleet.devices.register(register_request("D1")).await.unwrap();

    let mut request = heartbeat("D1", &registered.certificate, Some(0));
    request.metrics.insert("battery".to_string(), json!(87));
    request.signature = SignatureAuthenticator::sign(
        "D1",
        request.timestamp,
        &registered.certificate,
        &request.signed_fields(),
    )
    .unwrap();
    fleet.devices.heartbeat(request).await.unwrap();

    let status = fleet.operator.device_status("D1").await.unwrap();
    assert!(status.presence.online);
    assert_eq!(status.presence.metrics.get("battery"), Some(&json!(87)));
    assert_eq!(status.queued_instructions, 0);
    assert_eq!(fleet.operator.online_devices().await.unwrap(), vec!["D1"]);

    assert!(matches!(
        fleet.operator.device_status("D9").await,
        Err(FleetError::DeviceNotFound { .. })
    ));
}

#[tokio::test]
async fn test_long_poll_wakes_when_task_is_created() {
    let fleet = fleet().await;
    let registered = fleet.devices.register(register_request("D1")).await.unwrap();
    // 先取走欢迎指令
    fleet
        .devices
        .heartbeat(heartbeat("D1", &registered.certificate, Some(0)))
        .await
        .unwrap();

    let devices = fleet.devices.clone();
    let certificate = registered.certificate.clone();
    let waiting = tokio::spawn(async move {
        devices
            .heartbeat(heartbeat("D1", &certificate, Some(10)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    fleet
        .operator
        .create_task(TaskBuilder::new().targeting_devices(&["D1"]).spec())
        .await
        .unwrap();

    let response = waiting.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(response.instructions.len(), 1);
    assert_eq!(
        response.instructions[0].instruction_type,
        InstructionType::ExecuteTask
    );
}

#[tokio::test]
async fn test_full_round_trip_completes_task() {
    let fleet = fleet().await;
    let d1 = fleet.devices.register(register_request("D1")).await.unwrap();
    let d2 = fleet.devices.register(register_request("D2")).await.unwrap();

    let task = fleet
        .operator
        .create_task(TaskBuilder::new().targeting_all().spec())
        .await
        .unwrap();
    assert_eq!(task.total_devices, 2);

    let stats = fleet.operator.queue_stats().await.unwrap();
    assert_eq!(stats.total_pending, 4);
    assert_eq!(stats.busy_devices.len(), 2);

    for (code, certificate) in [("D1", &d1.certificate), ("D2", &d2.certificate)] {
        let response = fleet
            .devices
            .heartbeat(heartbeat(code, certificate, Some(0)))
            .await
            .unwrap();
        let execute = response
            .instructions
            .iter()
            .find(|i| i.instruction_type == InstructionType::ExecuteTask)
            .unwrap();
        assert_eq!(execute.task_id(), Some(task.id.as_str()));

        let outcome = fleet
            .devices
            .report(signed_report(code, certificate, &execute.id, ExecutionStatus::Success))
            .await
            .unwrap();
        assert!(outcome.counted);
    }

    let progress = fleet.operator.task_progress(&task.id).await.unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
    assert_eq!(progress.success_devices, 2);
    assert_eq!(progress.pending_devices, 0);
    assert_eq!(fleet.operator.queue_stats().await.unwrap().total_pending, 0);
}

#[tokio::test]
async fn test_tampered_report_is_rejected_and_not_counted() {
    let fleet = fleet().await;
    let d1 = fleet.devices.register(register_request("D1")).await.unwrap();
    let task = fleet
        .operator
        .create_task(TaskBuilder::new().targeting_devices(&["D1"]).spec())
        .await
        .unwrap();

    let response = fleet
        .devices
        .heartbeat(heartbeat("D1", &d1.certificate, Some(0)))
        .await
        .unwrap();
    let execute = response
        .instructions
        .iter()
        .find(|i| i.instruction_type == InstructionType::ExecuteTask)
        .unwrap();

    let mut report = signed_report("D1", &d1.certificate, &execute.id, ExecutionStatus::Failed);
    report.status = ExecutionStatus::Success;
    let err = fleet.devices.report(report).await.unwrap_err();
    assert!(err.is_authentication());

    let progress = fleet.operator.task_progress(&task.id).await.unwrap();
    assert_eq!(progress.status, TaskStatus::Running);
    assert_eq!(progress.success_devices + progress.failed_devices, 0);
}

#[tokio::test]
async fn test_operator_queue_controls() {
    let fleet = fleet().await;
    fleet.devices.register(register_request("D1")).await.unwrap();
    for _ in 0..2 {
        fleet
            .operator
            .create_task(TaskBuilder::new().targeting_devices(&["D1"]).spec())
            .await
            .unwrap();
    }

    // 预览条数受配置上限约束，且不改变队列
    let preview = fleet.operator.preview_queue("D1", Some(10)).await.unwrap();
    assert_eq!(preview.len(), 2);
    assert_eq!(fleet.operator.device_status("D1").await.unwrap().queued_instructions, 3);

    let first = preview[0].clone();
    assert!(fleet.operator.cancel_instruction("D1", &first.id).await.unwrap());
    assert!(!fleet.operator.cancel_instruction("D1", &first.id).await.unwrap());

    assert_eq!(fleet.operator.clear_queue("D1").await.unwrap(), 2);
    assert!(fleet.operator.queue_stats().await.unwrap().busy_devices.is_empty());
}

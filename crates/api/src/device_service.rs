//! 设备侧接口：注册、心跳（附带长轮询）、执行结果回报

use std::sync::Arc;

use chrono::Utc;
use fleet_core::config::QueueConfig;
use fleet_core::models::{Device, Instruction};
use fleet_core::traits::DeviceDirectory;
use fleet_core::{FleetError, FleetResult};
use fleet_dispatcher::{ReportOutcome, TaskDispatcher};
use fleet_infrastructure::{InstructionQueue, PresenceTracker};
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::auth::{SignatureAuthenticator, SignedFields};
use crate::types::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, ReportRequest,
};

pub struct DeviceService {
    directory: Arc<dyn DeviceDirectory>,
    authenticator: SignatureAuthenticator,
    presence: PresenceTracker,
    queue: InstructionQueue,
    dispatcher: Arc<TaskDispatcher>,
    queue_config: QueueConfig,
}

impl DeviceService {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        authenticator: SignatureAuthenticator,
        presence: PresenceTracker,
        queue: InstructionQueue,
        dispatcher: Arc<TaskDispatcher>,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            directory,
            authenticator,
            presence,
            queue,
            dispatcher,
            queue_config,
        }
    }

    /// 注册或重新注册设备，返回新签发的证书
    ///
    /// 按设备编码幂等：已存在的设备更新描述信息并重签证书。只有首次注册会收到欢迎指令。
    #[instrument(skip(self, request), fields(device_code = %request.device_code))]
    pub async fn register(&self, request: RegisterRequest) -> FleetResult<RegisterResponse> {
        if request.device_code.trim().is_empty() {
            return Err(FleetError::Validation("设备编码不能为空".to_string()));
        }
        if request.certificate_request.is_empty() {
            return Err(FleetError::Validation("证书请求不能为空".to_string()));
        }

        let certificate = SignatureAuthenticator::generate_certificate(
            &request.device_code,
            &request.certificate_request,
        );

        let existing = self.directory.get_device(&request.device_code).await?;
        let first_registration = existing.is_none();
        let mut device = existing
            .unwrap_or_else(|| Device::new(&request.device_code, &request.device_name));
        device.name = request.device_name.clone();
        device.hardware = request.hardware.clone();
        device.certificate = Some(certificate.clone());
        if request.group_id.is_some() {
            device.group_id = request.group_id.clone();
        }
        device.updated_at = Utc::now();
        let device = self.directory.upsert_device(&device).await?;

        if first_registration {
            let welcome = Instruction::welcome(&device.code, &device.name);
            if let Err(e) = self.queue.enqueue(&device.code, &welcome, false).await {
                warn!("设备 {} 的欢迎指令入队失败: {}", device.code, e);
            }
        }
        self.presence.touch(&device.code).await?;

        counter!("fleet_device_registrations_total").increment(1);
        info!(first_registration, "设备已注册");

        Ok(RegisterResponse {
            device_code: device.code,
            certificate,
            first_registration,
        })
    }

    /// 心跳：记录在线状态和指标，然后长轮询待执行指令
    #[instrument(skip(self, request), fields(device_code = %request.device_code))]
    pub async fn heartbeat(&self, request: HeartbeatRequest) -> FleetResult<HeartbeatResponse> {
        self.authenticate(
            &request.device_code,
            request.timestamp,
            &request.signature,
            &request.signed_fields(),
        )
        .await?;

        self.presence.touch(&request.device_code).await?;
        if !request.metrics.is_empty() {
            self.presence
                .record_metrics(&request.device_code, &request.metrics)
                .await?;
        }

        let timeout = self.queue_config.clamp_poll_timeout(request.poll_timeout);
        let instructions = self.queue.long_poll(&request.device_code, timeout).await?;
        debug!("设备 {} 收到 {} 条指令", request.device_code, instructions.len());

        Ok(HeartbeatResponse {
            instructions,
            server_time: Utc::now(),
        })
    }

    /// 执行结果回报
    #[instrument(skip(self, request), fields(device_code = %request.device_code, instruction_id = %request.instruction_id))]
    pub async fn report(&self, request: ReportRequest) -> FleetResult<ReportOutcome> {
        self.authenticate(
            &request.device_code,
            request.timestamp,
            &request.signature,
            &request.signed_fields(),
        )
        .await?;

        self.presence.touch(&request.device_code).await?;
        self.dispatcher
            .handle_report(&request.device_code, &request.to_report())
            .await
    }

    /// 未注册的设备与签名错误一样按认证失败处理
    async fn authenticate(
        &self,
        device_code: &str,
        timestamp: i64,
        signature: &str,
        fields: &SignedFields,
    ) -> FleetResult<Device> {
        let Some(device) = self.directory.get_device(device_code).await? else {
            return Err(FleetError::Authentication(format!("设备 {device_code} 未注册")));
        };
        self.authenticator.verify(
            device_code,
            timestamp,
            device.certificate.as_deref(),
            signature,
            fields,
        )?;
        Ok(device)
    }
}

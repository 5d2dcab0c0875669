//! 克隆编排
//!
//! 两条流水线都按固定顺序推进，每一步都以上一步成功为前提:
//!
//! ```text
//! Requested → NameResolved → PreconditionSatisfied → Copied → Registered
//!           → (Reconfigured) → (Snapshotted) → Started → Done
//! ```
//!
//! 任一步骤失败都会中止流水线，错误携带失败步骤与两端虚拟机名称。
//! 已完成的步骤不会回滚。整条流水线期间持有源虚拟机锁与目标名称租约。

use std::fmt;

use tracing::{error, info};
use vcm_vimclient::{
    ConfigSpec, DatastorePath, DeviceChange, DeviceKind, DeviceOperation, PowerState,
    RegisterSpec, VmRef,
};

use crate::context::Context;
use crate::error::{CloneStep, OrchestratorError, Result};
use crate::file_copy::{CopyRequest, FileCopyPipeline};
use crate::naming::NameAllocator;
use crate::poller::TaskPoller;
use crate::power::PowerOps;
use crate::precondition::StatePrecondition;
use crate::snapshot_ops::SnapshotOps;

/// 快速克隆在目标虚拟机上设置的扩展配置，要求重新生成 UUID
const UUID_ACTION_KEY: &str = "uuid.action";
const UUID_ACTION_CREATE: &str = "create";

/// 克隆请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    /// 源虚拟机名称
    pub source: String,

    /// 目标名称，为空时自动生成
    pub destination_name: Option<String>,

    /// 目标目录，默认与目标名称相同
    pub destination_directory: Option<String>,

    /// 磁盘适配器类型，默认从源控制器推导
    pub disk_adapter_type: Option<String>,

    /// 克隆完成后是否开机
    pub power_on: bool,

    /// 注册为模板 (模板不会开机)
    pub template: bool,
}

impl CloneSpec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination_name: None,
            destination_directory: None,
            disk_adapter_type: None,
            power_on: true,
            template: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.destination_name = Some(name.into());
        self
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.destination_directory = Some(directory.into());
        self
    }

    pub fn with_adapter_type(mut self, adapter_type: impl Into<String>) -> Self {
        self.disk_adapter_type = Some(adapter_type.into());
        self
    }

    pub fn with_power_on(mut self, power_on: bool) -> Self {
        self.power_on = power_on;
        self
    }

    pub fn as_template(mut self, template: bool) -> Self {
        self.template = template;
        self
    }

    fn should_start(&self) -> bool {
        self.power_on && !self.template
    }

    fn copy_request(&self, name: &str) -> CopyRequest {
        let mut request = CopyRequest::new(name);
        if let Some(directory) = &self.destination_directory {
            request = request.with_directory(directory.clone());
        }
        if let Some(adapter) = &self.disk_adapter_type {
            request = request.with_adapter_type(adapter.clone());
        }
        request
    }
}

/// 克隆结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    /// 目标虚拟机名称
    pub name: String,

    /// 目标描述文件路径
    pub descriptor_path: DatastorePath,

    /// 前置检查后的源虚拟机状态
    pub source_state: PowerState,

    /// 是否对目标执行了冷重置
    pub reset_issued: bool,

    /// 目标是否已开机
    pub powered_on: bool,
}

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    Requested,
    NameResolved,
    PreconditionSatisfied,
    Copied,
    Registered,
    Reconfigured,
    Snapshotted,
    Started,
    Done,
}

impl fmt::Display for CloneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "Requested",
            Self::NameResolved => "NameResolved",
            Self::PreconditionSatisfied => "PreconditionSatisfied",
            Self::Copied => "Copied",
            Self::Registered => "Registered",
            Self::Reconfigured => "Reconfigured",
            Self::Snapshotted => "Snapshotted",
            Self::Started => "Started",
            Self::Done => "Done",
        };
        f.write_str(s)
    }
}

/// 单条流水线的运行状态
struct Run<'a> {
    source: &'a str,
    destination: String,
    state: CloneState,
}

impl<'a> Run<'a> {
    fn new(spec: &'a CloneSpec) -> Self {
        Self {
            source: &spec.source,
            destination: spec.destination_name.clone().unwrap_or_default(),
            state: CloneState::Requested,
        }
    }

    fn advance(&mut self, next: CloneState) {
        info!(
            "克隆 {} -> {}: {} → {}",
            self.source, self.destination, self.state, next
        );
        self.state = next;
    }

    /// 错误附加步骤信息并记录
    fn fail(&self, step: CloneStep) -> impl Fn(OrchestratorError) -> OrchestratorError + '_ {
        move |e| {
            let e = e.at_step(step, self.source, &self.destination);
            error!("克隆中止于状态 {}: {}", self.state, e);
            e
        }
    }
}

/// 克隆编排器
pub struct CloneOrchestrator {
    ctx: Context,
    allocator: NameAllocator,
    precondition: StatePrecondition,
    files: FileCopyPipeline,
    snapshots: SnapshotOps,
    power: PowerOps,
    poller: TaskPoller,
}

impl CloneOrchestrator {
    pub fn new(ctx: Context) -> Self {
        Self {
            allocator: NameAllocator::new(ctx.clone()),
            precondition: StatePrecondition::new(ctx.clone()),
            files: FileCopyPipeline::new(ctx.clone()),
            snapshots: SnapshotOps::new(ctx.clone()),
            power: PowerOps::new(ctx.clone()),
            poller: TaskPoller::new(ctx.clone()),
            ctx,
        }
    }

    /// 替换名称分配器
    pub fn with_allocator(mut self, allocator: NameAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// 完整克隆
    pub async fn full_clone(&self, spec: &CloneSpec) -> Result<CloneOutcome> {
        let _source_guard = self.ctx.source_locks().lock(&spec.source).await;
        let mut run = Run::new(spec);

        let lease = self
            .allocator
            .resolve(spec.destination_name.as_deref())
            .await
            .map_err(run.fail(CloneStep::ResolveName))?;
        run.destination = lease.name().to_string();
        run.advance(CloneState::NameResolved);

        let source = self
            .ctx
            .find_vm(&spec.source)
            .await
            .map_err(run.fail(CloneStep::Precondition))?;
        let source_state = self
            .precondition
            .ensure_quiescent(&source)
            .await
            .map_err(run.fail(CloneStep::Precondition))?;
        self.check_free_space(&source)
            .await
            .map_err(run.fail(CloneStep::SpaceCheck))?;
        run.advance(CloneState::PreconditionSatisfied);

        let descriptor_path = self
            .files
            .full_copy_with(&source, &spec.copy_request(&run.destination))
            .await
            .map_err(run.fail(CloneStep::CopyDescriptor))?;
        run.advance(CloneState::Copied);

        let destination = self
            .register(spec, &run.destination, &descriptor_path)
            .await
            .map_err(run.fail(CloneStep::Register))?;
        run.advance(CloneState::Registered);

        let (powered_on, reset_issued) = self
            .start(spec, &destination, source_state, &mut run)
            .await?;

        run.advance(CloneState::Done);
        Ok(CloneOutcome {
            name: run.destination.clone(),
            descriptor_path,
            source_state,
            reset_issued,
            powered_on,
        })
    }

    /// 快速 (差分) 克隆
    ///
    /// 源虚拟机已有快照时直接拒绝，不产生任何副作用。
    pub async fn quick_clone(&self, spec: &CloneSpec) -> Result<CloneOutcome> {
        let _source_guard = self.ctx.source_locks().lock(&spec.source).await;
        let mut run = Run::new(spec);

        let lease = self
            .allocator
            .resolve(spec.destination_name.as_deref())
            .await
            .map_err(run.fail(CloneStep::ResolveName))?;
        run.destination = lease.name().to_string();
        run.advance(CloneState::NameResolved);

        let source = self
            .ctx
            .find_vm(&spec.source)
            .await
            .map_err(run.fail(CloneStep::Precondition))?;
        self.guard_snapshots(&source)
            .await
            .map_err(run.fail(CloneStep::SnapshotGuard))?;
        let source_state = self
            .precondition
            .ensure_quiescent(&source)
            .await
            .map_err(run.fail(CloneStep::Precondition))?;
        self.check_free_space(&source)
            .await
            .map_err(run.fail(CloneStep::SpaceCheck))?;
        run.advance(CloneState::PreconditionSatisfied);

        let descriptor_path = self
            .files
            .quick_copy_with(&source, &spec.copy_request(&run.destination))
            .await
            .map_err(run.fail(CloneStep::CopyDescriptor))?;
        run.advance(CloneState::Copied);

        self.annotate_master(&source)
            .await
            .map_err(run.fail(CloneStep::AnnotateMaster))?;

        let destination = self
            .register(spec, &run.destination, &descriptor_path)
            .await
            .map_err(run.fail(CloneStep::Register))?;
        run.advance(CloneState::Registered);

        self.share_source_disks(&source, &destination)
            .await
            .map_err(run.fail(CloneStep::Reconfigure))?;
        run.advance(CloneState::Reconfigured);

        let config = self.ctx.config();
        self.snapshots
            .create_on(
                &destination,
                Some(config.quick_clone_snapshot_name.as_str()),
                Some(config.quick_clone_snapshot_description.as_str()),
                true,
            )
            .await
            .map_err(run.fail(CloneStep::Snapshot))?;
        run.advance(CloneState::Snapshotted);

        let (powered_on, reset_issued) = self
            .start(spec, &destination, source_state, &mut run)
            .await?;

        run.advance(CloneState::Done);
        Ok(CloneOutcome {
            name: run.destination.clone(),
            descriptor_path,
            source_state,
            reset_issued,
            powered_on,
        })
    }

    async fn guard_snapshots(&self, source: &VmRef) -> Result<()> {
        if self.snapshots.has_any(source).await? {
            return Err(OrchestratorError::Precondition(format!(
                "虚拟机 {} 已有快照，不能快速克隆，请先删除快照",
                source
            )));
        }
        Ok(())
    }

    async fn check_free_space(&self, source: &VmRef) -> Result<()> {
        let Some(required) = self.ctx.config().min_free_space_bytes() else {
            return Ok(());
        };
        let datastore = self
            .ctx
            .server()
            .list_datastores(source)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::NotFound(format!("虚拟机 {} 的数据存储", source)))?;

        if datastore.free_bytes < required {
            return Err(OrchestratorError::Precondition(format!(
                "数据存储 {} 剩余空间 {} 字节，低于 {} 字节",
                datastore.name, datastore.free_bytes, required
            )));
        }
        Ok(())
    }

    async fn annotate_master(&self, source: &VmRef) -> Result<()> {
        let spec =
            ConfigSpec::default().with_annotation(&self.ctx.config().quick_clone_master_annotation);
        info!("标记母盘: {}", source);
        let task = self.ctx.server().reconfigure_vm(source, &spec).await?;
        self.poller
            .wait_success(&task, Some(source), &format!("标记母盘 {}", source))
            .await
    }

    async fn register(
        &self,
        spec: &CloneSpec,
        name: &str,
        descriptor_path: &DatastorePath,
    ) -> Result<VmRef> {
        let config = self.ctx.config();
        let request = RegisterSpec {
            path: descriptor_path.clone(),
            name: name.to_string(),
            as_template: spec.template,
            host: config.default_host.clone(),
            resource_pool: config.default_resource_pool.clone(),
        };

        info!("注册虚拟机: {} ({})", name, descriptor_path);
        let task = self.ctx.server().register_vm(&request).await?;
        self.poller
            .wait_success(&task, None, &format!("注册虚拟机 {}", name))
            .await?;
        self.ctx.find_vm(name).await
    }

    /// 目标虚拟机的每块磁盘改为引用源虚拟机同键磁盘的后端文件
    async fn share_source_disks(&self, source: &VmRef, destination: &VmRef) -> Result<()> {
        let server = self.ctx.server();
        let source_config = server.vm_config(source).await?;
        let destination_config = server.vm_config(destination).await?;

        let mut changes = Vec::new();
        for disk in source_config.disks() {
            let source_file = disk
                .disk_backing()
                .and_then(|backing| backing.flat_file())
                .ok_or_else(|| {
                    OrchestratorError::UnsupportedDiskFormat(format!(
                        "虚拟机 {} 的磁盘 {} 不是平面文件格式",
                        source, disk.key
                    ))
                })?;

            let mut device = destination_config.device(disk.key).cloned().ok_or_else(|| {
                OrchestratorError::NotFound(format!("虚拟机 {} 的磁盘 {}", destination, disk.key))
            })?;
            let rewritten = match &mut device.kind {
                DeviceKind::Disk { backing } => {
                    backing.set_flat_file(source_file.clone())
                }
                _ => false,
            };
            if !rewritten {
                return Err(OrchestratorError::UnsupportedDiskFormat(format!(
                    "虚拟机 {} 的设备 {} 不是平面文件磁盘",
                    destination, disk.key
                )));
            }

            changes.push(DeviceChange {
                operation: DeviceOperation::Edit,
                device,
            });
        }

        let spec = ConfigSpec {
            annotation: Some(format!("Type: Quick Cloned VM\n Master VM: {}", source.name)),
            device_changes: changes,
            extra_config: Vec::new(),
        }
        .with_extra(UUID_ACTION_KEY, UUID_ACTION_CREATE);

        info!(
            "重新配置 {}: {} 块磁盘改为共享 {} 的磁盘",
            destination,
            spec.device_changes.len(),
            source
        );
        let task = server.reconfigure_vm(destination, &spec).await?;
        self.poller
            .wait_success(&task, Some(destination), &format!("重新配置 {}", destination))
            .await
    }

    /// 开机，源虚拟机处于挂起状态时再冷重置以获取新的网络身份
    async fn start(
        &self,
        spec: &CloneSpec,
        destination: &VmRef,
        source_state: PowerState,
        run: &mut Run<'_>,
    ) -> Result<(bool, bool)> {
        if !spec.should_start() {
            info!("目标 {} 不开机 (模板: {})", destination, spec.template);
            return Ok((false, false));
        }

        self.power
            .start_vm(destination)
            .await
            .map_err(run.fail(CloneStep::PowerOn))?;
        run.advance(CloneState::Started);

        let reset_issued = source_state == PowerState::Suspended;
        if reset_issued {
            self.power
                .reset_vm(destination)
                .await
                .map_err(run.fail(CloneStep::Reset))?;
        }
        Ok((true, reset_issued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_spec_defaults() {
        let spec = CloneSpec::new("master");
        assert!(spec.power_on);
        assert!(!spec.template);
        assert!(spec.should_start());

        let request = spec.copy_request("clone-01");
        assert_eq!(request.destination_name, "clone-01");
        assert_eq!(request.directory, None);
        assert_eq!(request.adapter_type, None);
    }

    #[test]
    fn test_template_never_started() {
        let spec = CloneSpec::new("master")
            .with_name("tpl")
            .with_directory("templates/tpl")
            .with_adapter_type("busLogic")
            .as_template(true);
        assert!(!spec.should_start());

        let request = spec.copy_request("tpl");
        assert_eq!(request.directory.as_deref(), Some("templates/tpl"));
        assert_eq!(request.adapter_type.as_deref(), Some("busLogic"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CloneState::PreconditionSatisfied.to_string(), "PreconditionSatisfied");
        assert_eq!(CloneState::Done.to_string(), "Done");
    }
}

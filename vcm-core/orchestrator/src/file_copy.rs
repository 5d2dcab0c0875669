//! 虚拟机文件复制
//!
//! 把源虚拟机的文件复制到 `[源数据存储] 目标目录` 下：
//!
//! - 完整复制: 逐个复制虚拟磁盘，适配器类型取自磁盘所属控制器
//! - 快速复制: 不复制磁盘，克隆随后改为引用源磁盘
//!
//! 两种方式都会尝试复制 NVRAM 与挂起状态文件 (失败只记录警告)，最后复制
//! 描述文件 (失败即中止)。已复制的文件不会回滚。

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};
use vcm_vimclient::{DatastorePath, DiskSpec, VirtualDevice, VmConfig, VmRef};

use crate::context::Context;
use crate::error::{CloneStep, OrchestratorError, Result};
use crate::poller::{TaskOutcome, TaskPoller};

/// 复制请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    /// 目标虚拟机名称
    pub destination_name: String,

    /// 目标目录，默认与名称相同
    pub directory: Option<String>,

    /// 磁盘适配器类型，默认从控制器推导
    pub adapter_type: Option<String>,
}

impl CopyRequest {
    pub fn new(destination_name: impl Into<String>) -> Self {
        Self {
            destination_name: destination_name.into(),
            directory: None,
            adapter_type: None,
        }
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_adapter_type(mut self, adapter_type: impl Into<String>) -> Self {
        self.adapter_type = Some(adapter_type.into());
        self
    }

    fn directory(&self) -> &str {
        self.directory.as_deref().unwrap_or(&self.destination_name)
    }
}

static ADAPTER_PREFIX_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn adapter_prefix_regex() -> Option<&'static Regex> {
    ADAPTER_PREFIX_RE
        .get_or_init(|| Regex::new(r"^([A-Za-z]{3})(.*)$").ok())
        .as_ref()
}

/// 控制器摘要 → 适配器类型标签
///
/// 去掉空白后把前三个字母转为小写，例如 "LSI Logic" → "lsiLogic"、
/// "BusLogic" → "busLogic"。
pub fn normalize_adapter_type(summary: &str) -> Option<String> {
    let compact: String = summary.split_whitespace().collect();
    let caps = adapter_prefix_regex()?.captures(&compact)?;
    Some(format!("{}{}", caps[1].to_lowercase(), &caps[2]))
}

/// 比较点分数字版本号，缺失的段按 0 处理
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    fn parts(version: &str) -> Vec<u64> {
        version
            .trim()
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    }

    let (left, right) = (parts(left), parts(right));
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// 源虚拟机的复制计划
struct SourceLayout {
    config: VmConfig,
    destination: DatastorePath,
}

/// 文件复制流水线
pub struct FileCopyPipeline {
    ctx: Context,
    poller: TaskPoller,
}

impl FileCopyPipeline {
    pub fn new(ctx: Context) -> Self {
        Self {
            poller: TaskPoller::new(ctx.clone()),
            ctx,
        }
    }

    /// 完整复制到与名称同名的目录
    pub async fn full_copy(&self, source: &VmRef, destination_name: &str) -> Result<DatastorePath> {
        self.full_copy_with(source, &CopyRequest::new(destination_name))
            .await
    }

    /// 快速复制到与名称同名的目录
    pub async fn quick_copy(
        &self,
        source: &VmRef,
        destination_name: &str,
    ) -> Result<DatastorePath> {
        self.quick_copy_with(source, &CopyRequest::new(destination_name))
            .await
    }

    /// 完整复制，返回目标描述文件路径
    pub async fn full_copy_with(
        &self,
        source: &VmRef,
        request: &CopyRequest,
    ) -> Result<DatastorePath> {
        let layout = self.prepare(source, request).await?;
        let at = |step: CloneStep| {
            move |e: OrchestratorError| e.at_step(step, &source.name, &request.destination_name)
        };

        let disks: Vec<&VirtualDevice> = layout.config.disks().collect();
        if !disks.is_empty() {
            let disk_type = self.disk_type().await.map_err(at(CloneStep::CopyDisk))?;
            for disk in disks {
                let spec = DiskSpec {
                    adapter_type: match &request.adapter_type {
                        Some(adapter) => adapter.clone(),
                        None => adapter_type_for(&layout.config, disk)
                            .map_err(at(CloneStep::CopyDisk))?,
                    },
                    disk_type: disk_type.clone(),
                };
                self.copy_disk(&layout, disk, &spec)
                    .await
                    .map_err(at(CloneStep::CopyDisk))?;
            }
        }

        self.finish(source, request, &layout).await
    }

    /// 快速复制，返回目标描述文件路径
    pub async fn quick_copy_with(
        &self,
        source: &VmRef,
        request: &CopyRequest,
    ) -> Result<DatastorePath> {
        let layout = self.prepare(source, request).await?;
        info!("快速复制跳过虚拟磁盘: {} -> {}", source, layout.destination);
        self.finish(source, request, &layout).await
    }

    /// 读取源配置、校验磁盘格式并创建目标目录
    async fn prepare(&self, source: &VmRef, request: &CopyRequest) -> Result<SourceLayout> {
        let server = self.ctx.server();
        let at = |step: CloneStep| {
            move |e: OrchestratorError| e.at_step(step, &source.name, &request.destination_name)
        };

        let config = server
            .vm_config(source)
            .await
            .map_err(OrchestratorError::from)
            .map_err(at(CloneStep::InspectSource))?;
        for disk in config.disks() {
            if let Some(backing) = disk.disk_backing() {
                if backing.flat_file().is_none() {
                    let err = OrchestratorError::UnsupportedDiskFormat(format!(
                        "虚拟机 {} 的磁盘 {} 使用 {} 格式",
                        source,
                        disk.key,
                        backing.tag()
                    ));
                    return Err(at(CloneStep::InspectSource)(err));
                }
            }
        }

        // 假定源虚拟机只位于一个数据存储上
        let datastore = server
            .list_datastores(source)
            .await
            .map_err(OrchestratorError::from)
            .and_then(|stores| {
                stores.into_iter().next().ok_or_else(|| {
                    OrchestratorError::NotFound(format!("虚拟机 {} 的数据存储", source))
                })
            })
            .map_err(at(CloneStep::InspectSource))?;

        let destination = DatastorePath::directory(datastore.name, request.directory());
        info!("创建目标目录: {}", destination);
        server
            .make_directory(&destination)
            .await
            .map_err(OrchestratorError::from)
            .map_err(at(CloneStep::MakeDirectory))?;

        Ok(SourceLayout {
            config,
            destination,
        })
    }

    /// 复制附属文件与描述文件
    async fn finish(
        &self,
        source: &VmRef,
        request: &CopyRequest,
        layout: &SourceLayout,
    ) -> Result<DatastorePath> {
        let config = &layout.config;

        // 扩展配置中的 nvram 即使文件不存在也会被设置
        if let Some(nvram) = config.extra("nvram") {
            let from = config.directory().join(nvram);
            let to = layout.destination.join(nvram);
            self.copy_auxiliary("NVRAM", &from, &to).await;
        }
        if let Some(vmss) = config.extra("checkpoint.vmState") {
            let from = config.files.suspend_directory.join(vmss);
            let to = layout.destination.join(vmss);
            self.copy_auxiliary("挂起状态", &from, &to).await;
        }

        let from = &config.files.descriptor_path;
        let file_name = from.file_name().unwrap_or(&request.destination_name);
        let to = layout.destination.join(file_name);
        info!("复制描述文件: {} -> {}", from, to);
        self.copy_file(from, &to, "复制描述文件")
            .await
            .map_err(|e| {
                e.at_step(
                    CloneStep::CopyDescriptor,
                    &source.name,
                    &request.destination_name,
                )
            })?;

        Ok(to)
    }

    async fn disk_type(&self) -> Result<Option<String>> {
        let version = self.ctx.server().about().await?.version;
        let threshold = &self.ctx.config().preallocated_min_version;
        Ok(
            (compare_versions(&version, threshold) == Ordering::Greater)
                .then(|| "preallocated".to_string()),
        )
    }

    async fn copy_disk(
        &self,
        layout: &SourceLayout,
        disk: &VirtualDevice,
        spec: &DiskSpec,
    ) -> Result<()> {
        let from = disk
            .disk_backing()
            .and_then(|backing| backing.flat_file())
            .ok_or_else(|| {
                OrchestratorError::UnsupportedDiskFormat(format!("磁盘 {} 没有后端文件", disk.key))
            })?;
        let file_name = from.file_name().ok_or_else(|| {
            OrchestratorError::UnsupportedDiskFormat(format!("磁盘后端不是文件: {}", from))
        })?;
        let to = layout.destination.join(file_name);

        info!(
            "复制虚拟磁盘: {} -> {} (适配器 {}, 类型 {})",
            from,
            to,
            spec.adapter_type,
            spec.disk_type.as_deref().unwrap_or("默认")
        );
        let task = self
            .ctx
            .server()
            .copy_virtual_disk(from, &to, spec)
            .await?;
        self.poller
            .wait_success(&task, None, &format!("复制虚拟磁盘 {}", from))
            .await
    }

    async fn copy_file(
        &self,
        from: &DatastorePath,
        to: &DatastorePath,
        operation: &str,
    ) -> Result<()> {
        let task = self.ctx.server().copy_datastore_file(from, to).await?;
        self.poller
            .wait_success(&task, None, &format!("{} {}", operation, from))
            .await
    }

    /// 附属文件复制失败只记录警告
    async fn copy_auxiliary(&self, label: &str, from: &DatastorePath, to: &DatastorePath) {
        let task = match self.ctx.server().copy_datastore_file(from, to).await {
            Ok(task) => task,
            Err(e) => {
                warn!("跳过{}文件 {}: {}", label, from, e);
                return;
            }
        };
        match self.poller.wait(&task, None).await {
            Ok(TaskOutcome::Success) => info!("已复制{}文件: {} -> {}", label, from, to),
            Ok(TaskOutcome::Failure(reason)) => {
                warn!("跳过{}文件 {}: {}", label, from, reason)
            }
            Err(e) => warn!("跳过{}文件 {}: {}", label, from, e),
        }
    }
}

/// 磁盘所属控制器的适配器类型
pub fn adapter_type_for(config: &VmConfig, disk: &VirtualDevice) -> Result<String> {
    let controller = disk
        .controller_key
        .and_then(|key| config.device(key))
        .ok_or_else(|| {
            OrchestratorError::UnsupportedDiskFormat(format!("磁盘 {} 找不到所属控制器", disk.key))
        })?;
    normalize_adapter_type(&controller.summary).ok_or_else(|| {
        OrchestratorError::UnsupportedDiskFormat(format!(
            "无法识别的磁盘适配器: {}",
            controller.summary
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adapter_type() {
        assert_eq!(normalize_adapter_type("LSI Logic").as_deref(), Some("lsiLogic"));
        assert_eq!(normalize_adapter_type("BusLogic").as_deref(), Some("busLogic"));
        assert_eq!(normalize_adapter_type(" IDE 0 ").as_deref(), Some("ide0"));
        assert_eq!(normalize_adapter_type("  "), None);
        assert_eq!(normalize_adapter_type("12 SCSI"), None);
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("4.1.0", "4.0.0"), Ordering::Greater);
        assert_eq!(compare_versions("4.0.0", "4.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("4.0", "4.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("3.5.0", "4.0.0"), Ordering::Less);
        // 数值比较，不是字典序
        assert_eq!(compare_versions("10.0.0", "4.0.0"), Ordering::Greater);
        assert_eq!(compare_versions("4.0.0u1", "4.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_copy_request_directory_defaults_to_name() {
        let request = CopyRequest::new("clone-01");
        assert_eq!(request.directory(), "clone-01");

        let request = request.with_directory("pool/clone-01").with_adapter_type("pvscsi");
        assert_eq!(request.directory(), "pool/clone-01");
        assert_eq!(request.adapter_type.as_deref(), Some("pvscsi"));
    }
}

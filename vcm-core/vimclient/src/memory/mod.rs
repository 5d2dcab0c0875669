//! 内存管理服务器
//!
//! 在进程内模拟管理服务器的清单、数据存储文件与异步任务。虚拟机的配置保存在
//! 其描述文件中，复制描述文件即复制配置，注册时从描述文件重建虚拟机。
//!
//! 支持的故障注入：
//! - 按操作名与目标子串让任务以错误结束 (不产生副作用)
//! - 任务状态读取连续失败
//! - 挂起请求成功但状态不变
//! - 开机时抛出交互式问题，问题回答前任务保持运行
//!
//! 可选开启差分磁盘模式：创建快照时当前磁盘切换到虚拟机目录下的新差分文件，
//! 快照保留创建时的配置。
//!
//! 所有调用都记录在调用日志中，便于断言副作用。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{Result, VimError};
use crate::models::{
    ConfigSpec, DatastoreInfo, DatastorePath, DeviceKind, DeviceOperation, DiskBacking, DiskSpec,
    GuestNic, OptionValue, PowerState, Question, RegisterSpec, ServerAbout, SnapshotInfo, TaskInfo,
    TaskRef, TaskState, VirtualDevice, VmConfig, VmFiles, VmRef, VmRuntime,
};
use crate::server::ManagementServer;

const DEFAULT_FREE_BYTES: u64 = 500 * 1024 * 1024 * 1024;

/// 一次服务器调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// 操作名，与 trait 方法同名
    pub op: &'static str,

    /// 操作目标 (虚拟机名、路径或 `源 -> 目标`)
    pub target: String,
}

/// 数据存储中的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredFile {
    /// 虚拟机描述文件，内容即虚拟机配置
    Descriptor(VmConfig),

    /// 虚拟磁盘，记录复制时使用的参数
    Disk(Option<DiskSpec>),

    /// 其他文件
    Data,
}

#[derive(Debug, Clone)]
struct FaultRule {
    op: &'static str,
    target_contains: String,
    reason: String,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    id: String,
    name: String,
    description: String,
    parent: Option<String>,
    created: chrono::DateTime<Utc>,
    /// 创建时的虚拟机配置
    config: VmConfig,
}

#[derive(Debug, Clone)]
struct VmRecord {
    vm: VmRef,
    descriptor: DatastorePath,
    power_state: PowerState,
    question: Option<Question>,
    template: bool,
    snapshots: Vec<SnapshotRecord>,
    current_snapshot: Option<String>,
    guest_nics: Vec<GuestNic>,
}

#[derive(Debug)]
struct TaskRecord {
    running_polls: u32,
    outcome: std::result::Result<(), String>,
    blocked_on: Option<String>,
}

#[derive(Debug, Default)]
struct Inventory {
    about: Option<ServerAbout>,
    logged_in: bool,
    vms: BTreeMap<String, VmRecord>,
    files: BTreeMap<DatastorePath, StoredFile>,
    directories: BTreeSet<DatastorePath>,
    datastores: Vec<DatastoreInfo>,
    tasks: HashMap<String, TaskRecord>,
    faults: Vec<FaultRule>,
    calls: Vec<Call>,
    task_running_polls: u32,
    failing_task_reads: u32,
    suspend_noop: bool,
    delta_disks_on_snapshot: bool,
    question_on_power_on: Option<(String, Question)>,
    next_id: u64,
}

impl Inventory {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn record(&mut self, op: &'static str, target: impl Into<String>) {
        let target = target.into();
        debug!("内存服务器调用: {} {}", op, target);
        self.calls.push(Call { op, target });
    }

    fn fault(&self, op: &'static str, target: &str) -> Option<String> {
        self.faults
            .iter()
            .find(|rule| rule.op == op && target.contains(&rule.target_contains))
            .map(|rule| rule.reason.clone())
    }

    fn vm(&self, vm: &VmRef) -> Result<&VmRecord> {
        self.vms
            .get(&vm.id)
            .ok_or_else(|| VimError::NotFound(format!("虚拟机 {}", vm.name)))
    }

    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut VmRecord> {
        self.vms
            .get_mut(&vm.id)
            .ok_or_else(|| VimError::NotFound(format!("虚拟机 {}", vm.name)))
    }

    fn config(&self, descriptor: &DatastorePath) -> Result<&VmConfig> {
        match self.files.get(descriptor) {
            Some(StoredFile::Descriptor(config)) => Ok(config),
            _ => Err(VimError::NotFound(format!("描述文件 {}", descriptor))),
        }
    }

    fn config_mut(&mut self, descriptor: &DatastorePath) -> Result<&mut VmConfig> {
        match self.files.get_mut(descriptor) {
            Some(StoredFile::Descriptor(config)) => Ok(config),
            _ => Err(VimError::NotFound(format!("描述文件 {}", descriptor))),
        }
    }

    fn directory_exists(&self, dir: &DatastorePath) -> bool {
        dir.directory.is_empty() || self.directories.contains(dir)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.vms.values().any(|record| record.vm.name == name)
    }

    fn set_extra(&mut self, descriptor: &DatastorePath, key: &str, value: &str) -> Result<()> {
        let config = self.config_mut(descriptor)?;
        apply_extra(&mut config.extra_config, key, value);
        Ok(())
    }

    /// 提交任务：`effect` 仅在没有注入故障时执行，其错误使任务以错误结束
    fn submit<F>(&mut self, op: &'static str, target: String, effect: F) -> TaskRef
    where
        F: FnOnce(&mut Inventory) -> std::result::Result<Option<String>, String>,
    {
        self.record(op, target.clone());
        let (outcome, blocked_on) = match self.fault(op, &target) {
            Some(reason) => (Err(reason), None),
            None => match effect(self) {
                Ok(blocked_on) => (Ok(()), blocked_on),
                Err(reason) => (Err(reason), None),
            },
        };
        let id = self.next_id("task");
        self.tasks.insert(
            id.clone(),
            TaskRecord {
                running_polls: self.task_running_polls,
                outcome,
                blocked_on,
            },
        );
        TaskRef::new(id)
    }

    fn snapshot_forest(&self, record: &VmRecord) -> Vec<SnapshotInfo> {
        let mut children: HashMap<Option<&str>, Vec<&SnapshotRecord>> = HashMap::new();
        for snapshot in &record.snapshots {
            children
                .entry(snapshot.parent.as_deref())
                .or_default()
                .push(snapshot);
        }

        // 先序遍历，然后逆序自底向上组装
        let mut order = Vec::new();
        let mut stack: Vec<&SnapshotRecord> = children
            .get(&None)
            .map(|roots| roots.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            order.push(node);
            if let Some(kids) = children.get(&Some(node.id.as_str())) {
                stack.extend(kids.iter().rev().copied());
            }
        }

        let mut built: HashMap<&str, SnapshotInfo> = HashMap::new();
        for node in order.iter().rev() {
            let kids: Vec<SnapshotInfo> = children
                .get(&Some(node.id.as_str()))
                .map(|kids| {
                    kids.iter()
                        .filter_map(|kid| built.remove(kid.id.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            built.insert(
                node.id.as_str(),
                SnapshotInfo {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    description: node.description.clone(),
                    create_time: Some(node.created),
                    children: kids,
                },
            );
        }

        children
            .get(&None)
            .map(|roots| {
                roots
                    .iter()
                    .filter_map(|root| built.remove(root.id.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 当前平面文件磁盘切换到虚拟机目录下第 `generation` 代差分文件
    fn switch_to_delta_disks(&mut self, descriptor: &DatastorePath, generation: usize) -> Result<()> {
        let config = self.config_mut(descriptor)?;
        let own = config.directory();
        let mut created = Vec::new();
        for device in config.devices.iter_mut() {
            if let DeviceKind::Disk { backing } = &mut device.kind {
                let delta = backing
                    .flat_file()
                    .and_then(|file| file.file_name())
                    .map(|file| own.join(&delta_file_name(file, generation)));
                if let Some(delta) = delta {
                    backing.set_flat_file(delta.clone());
                    created.push(delta);
                }
            }
        }
        for delta in created {
            self.files.insert(delta, StoredFile::Disk(None));
        }
        Ok(())
    }

    fn remove_within(&mut self, dir: &DatastorePath) {
        self.files.retain(|path, _| !path.is_within(dir));
        self.directories.retain(|path| !path.is_within(dir));
    }
}

/// `master.vmdk` / `master-000001.vmdk` 的第 `generation` 代差分文件名
fn delta_file_name(file_name: &str, generation: usize) -> String {
    let stem = file_name.strip_suffix(".vmdk").unwrap_or(file_name);
    let base = match stem.rsplit_once('-') {
        Some((base, suffix)) if suffix.len() == 6 && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            base
        }
        _ => stem,
    };
    format!("{}-{:06}.vmdk", base, generation)
}

fn apply_extra(entries: &mut Vec<OptionValue>, key: &str, value: &str) {
    entries.retain(|entry| entry.key != key);
    if !value.is_empty() {
        entries.push(OptionValue::new(key, value));
    }
}

/// 内存管理服务器
pub struct InMemoryServer {
    state: Mutex<Inventory>,
}

impl InMemoryServer {
    pub fn builder() -> InMemoryServerBuilder {
        InMemoryServerBuilder::default()
    }

    fn inventory(&self) -> MutexGuard<'_, Inventory> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // 调用日志
    // ============================================

    /// 全部调用记录
    pub fn calls(&self) -> Vec<Call> {
        self.inventory().calls.clone()
    }

    /// 某个操作的调用次数
    pub fn call_count(&self, op: &str) -> usize {
        self.inventory().calls.iter().filter(|c| c.op == op).count()
    }

    /// 某个操作的调用目标
    pub fn call_targets(&self, op: &str) -> Vec<String> {
        self.inventory()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    /// 清空调用日志
    pub fn clear_calls(&self) {
        self.inventory().calls.clear();
    }

    // ============================================
    // 故障注入
    // ============================================

    /// 目标包含 `target_contains` 的 `op` 操作失败
    pub fn fail_operation(&self, op: &'static str, target_contains: &str, reason: &str) {
        self.inventory().faults.push(FaultRule {
            op,
            target_contains: target_contains.to_string(),
            reason: reason.to_string(),
        });
    }

    /// 接下来 `count` 次任务状态读取失败
    pub fn fail_task_reads(&self, count: u32) {
        self.inventory().failing_task_reads = count;
    }

    /// 任务进入终态前保持运行的读取次数
    pub fn set_task_running_polls(&self, polls: u32) {
        self.inventory().task_running_polls = polls;
    }

    /// 挂起请求成功但虚拟机保持开机
    pub fn set_suspend_noop(&self, noop: bool) {
        self.inventory().suspend_noop = noop;
    }

    /// 创建快照时当前磁盘切换到新的差分文件
    pub fn set_delta_disks_on_snapshot(&self, enabled: bool) {
        self.inventory().delta_disks_on_snapshot = enabled;
    }

    /// 指定虚拟机下次开机时抛出问题
    pub fn raise_question_on_power_on(&self, vm_name: &str, question: Question) {
        self.inventory().question_on_power_on = Some((vm_name.to_string(), question));
    }

    /// 直接在虚拟机上放置待回答问题
    pub fn set_question(&self, vm_name: &str, question: Question) -> Result<()> {
        let mut inv = self.inventory();
        let record = inv
            .vms
            .values_mut()
            .find(|record| record.vm.name == vm_name)
            .ok_or_else(|| VimError::NotFound(format!("虚拟机 {}", vm_name)))?;
        record.question = Some(question);
        Ok(())
    }

    // ============================================
    // 状态查询
    // ============================================

    pub fn file(&self, path: &DatastorePath) -> Option<StoredFile> {
        self.inventory().files.get(path).cloned()
    }

    pub fn file_exists(&self, path: &DatastorePath) -> bool {
        self.inventory().files.contains_key(path)
    }

    pub fn directory_exists(&self, path: &DatastorePath) -> bool {
        self.inventory().directories.contains(path)
    }

    /// 当前是否处于登录会话中
    pub fn is_logged_in(&self) -> bool {
        self.inventory().logged_in
    }

    /// 虚拟机是否为模板
    pub fn is_template(&self, vm_name: &str) -> bool {
        self.inventory()
            .vms
            .values()
            .any(|record| record.vm.name == vm_name && record.template)
    }
}

#[async_trait]
impl ManagementServer for InMemoryServer {
    async fn login(&self, username: &str, _password: &str) -> Result<()> {
        let mut inv = self.inventory();
        inv.record("login", username);
        inv.logged_in = true;
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let mut inv = self.inventory();
        inv.record("logout", "");
        inv.logged_in = false;
        Ok(())
    }

    async fn about(&self) -> Result<ServerAbout> {
        let mut inv = self.inventory();
        inv.record("about", "");
        Ok(inv.about.clone().unwrap_or_else(|| ServerAbout {
            version: "6.7.0".to_string(),
            hostname: Some("esx-memory.local".to_string()),
            ip: Some("127.0.0.1".to_string()),
        }))
    }

    async fn list_vm_names(&self) -> Result<Vec<String>> {
        let mut inv = self.inventory();
        inv.record("list_vm_names", "");
        Ok(inv.vms.values().map(|record| record.vm.name.clone()).collect())
    }

    async fn find_vm_by_name(&self, name: &str) -> Result<Option<VmRef>> {
        let mut inv = self.inventory();
        inv.record("find_vm_by_name", name);
        Ok(inv
            .vms
            .values()
            .find(|record| record.vm.name == name)
            .map(|record| record.vm.clone()))
    }

    async fn runtime(&self, vm: &VmRef) -> Result<VmRuntime> {
        let mut inv = self.inventory();
        inv.record("runtime", vm.name.clone());
        let record = inv.vm(vm)?;
        Ok(VmRuntime {
            power_state: record.power_state,
            question: record.question.clone(),
        })
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig> {
        let mut inv = self.inventory();
        inv.record("vm_config", vm.name.clone());
        let descriptor = inv.vm(vm)?.descriptor.clone();
        inv.config(&descriptor).cloned()
    }

    async fn list_datastores(&self, vm: &VmRef) -> Result<Vec<DatastoreInfo>> {
        let mut inv = self.inventory();
        inv.record("list_datastores", vm.name.clone());
        let datastore = inv.vm(vm)?.descriptor.datastore.clone();
        Ok(inv
            .datastores
            .iter()
            .filter(|ds| ds.name == datastore)
            .cloned()
            .collect())
    }

    async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>> {
        let mut inv = self.inventory();
        inv.record("guest_nics", vm.name.clone());
        Ok(inv.vm(vm)?.guest_nics.clone())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        Ok(inv.submit("power_on", vm.name.clone(), move |inv| {
            let raises = matches!(&inv.question_on_power_on, Some((name, _)) if *name == vm.name);
            let question = if raises {
                inv.question_on_power_on.take().map(|(_, q)| q)
            } else {
                None
            };
            let record = inv.vm_mut(&vm).map_err(|e| e.to_string())?;
            if record.template {
                return Err("模板不能开机".to_string());
            }
            match record.power_state {
                PowerState::PoweredOff | PowerState::Suspended => {
                    record.power_state = PowerState::PoweredOn;
                }
                state => return Err(format!("当前电源状态不允许开机: {}", state)),
            }
            let descriptor = record.descriptor.clone();
            let blocked_on = question.map(|q| {
                record.question = Some(q);
                vm.id.clone()
            });
            inv.set_extra(&descriptor, "checkpoint.vmState", "")
                .map_err(|e| e.to_string())?;
            Ok(blocked_on)
        }))
    }

    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        Ok(inv.submit("power_off", vm.name.clone(), move |inv| {
            let record = inv.vm_mut(&vm).map_err(|e| e.to_string())?;
            match record.power_state {
                PowerState::PoweredOn | PowerState::Suspended => {
                    record.power_state = PowerState::PoweredOff;
                    Ok(None)
                }
                state => Err(format!("当前电源状态不允许关机: {}", state)),
            }
        }))
    }

    async fn suspend(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        Ok(inv.submit("suspend", vm.name.clone(), move |inv| {
            let noop = inv.suspend_noop;
            let record = inv.vm_mut(&vm).map_err(|e| e.to_string())?;
            if record.power_state != PowerState::PoweredOn {
                return Err(format!("当前电源状态不允许挂起: {}", record.power_state));
            }
            if noop {
                return Ok(None);
            }
            record.power_state = PowerState::Suspended;
            let descriptor = record.descriptor.clone();
            let vmss = format!("{}.vmss", vm.name);
            let suspend_dir = inv
                .config(&descriptor)
                .map_err(|e| e.to_string())?
                .files
                .suspend_directory
                .clone();
            inv.files.insert(suspend_dir.join(&vmss), StoredFile::Data);
            inv.set_extra(&descriptor, "checkpoint.vmState", &vmss)
                .map_err(|e| e.to_string())?;
            Ok(None)
        }))
    }

    async fn reset(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        Ok(inv.submit("reset", vm.name.clone(), move |inv| {
            let record = inv.vm(&vm).map_err(|e| e.to_string())?;
            if record.power_state != PowerState::PoweredOn {
                return Err(format!("当前电源状态不允许重置: {}", record.power_state));
            }
            Ok(None)
        }))
    }

    async fn answer_question(&self, vm: &VmRef, question_id: &str, choice: &str) -> Result<()> {
        let mut inv = self.inventory();
        inv.record("answer_question", format!("{}:{}", vm.name, choice));
        let record = inv.vm_mut(vm)?;
        match &record.question {
            Some(question) if question.id == question_id => {
                record.question = None;
                Ok(())
            }
            _ => Err(VimError::Fault(format!("问题不存在: {}", question_id))),
        }
    }

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
        description: &str,
        _quiesce: bool,
        _memory: bool,
    ) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        let name = name.to_string();
        let description = description.to_string();
        Ok(inv.submit(
            "create_snapshot",
            format!("{}/{}", vm.name, name),
            move |inv| {
                let id = inv.next_id("snapshot");
                let (descriptor, generation) = {
                    let record = inv.vm(&vm).map_err(|e| e.to_string())?;
                    (record.descriptor.clone(), record.snapshots.len() + 1)
                };
                let config = inv.config(&descriptor).map_err(|e| e.to_string())?.clone();
                if inv.delta_disks_on_snapshot {
                    inv.switch_to_delta_disks(&descriptor, generation)
                        .map_err(|e| e.to_string())?;
                }

                let record = inv.vm_mut(&vm).map_err(|e| e.to_string())?;
                record.snapshots.push(SnapshotRecord {
                    id: id.clone(),
                    name,
                    description,
                    parent: record.current_snapshot.clone(),
                    created: Utc::now(),
                    config,
                });
                record.current_snapshot = Some(id);
                Ok(None)
            },
        ))
    }

    async fn snapshot_forest(&self, vm: &VmRef) -> Result<Vec<SnapshotInfo>> {
        let mut inv = self.inventory();
        inv.record("snapshot_forest", vm.name.clone());
        let record = inv.vm(vm)?;
        Ok(inv.snapshot_forest(record))
    }

    async fn snapshot_config(&self, vm: &VmRef, snapshot_id: &str) -> Result<VmConfig> {
        let mut inv = self.inventory();
        inv.record("snapshot_config", format!("{}/{}", vm.name, snapshot_id));
        inv.vm(vm)?
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .map(|s| s.config.clone())
            .ok_or_else(|| VimError::NotFound(format!("快照 {}", snapshot_id)))
    }

    async fn revert_snapshot(&self, vm: &VmRef, snapshot_id: &str) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        let snapshot_id = snapshot_id.to_string();
        Ok(inv.submit(
            "revert_snapshot",
            format!("{}/{}", vm.name, snapshot_id),
            move |inv| {
                let record = inv.vm_mut(&vm).map_err(|e| e.to_string())?;
                if !record.snapshots.iter().any(|s| s.id == snapshot_id) {
                    return Err(format!("快照不存在: {}", snapshot_id));
                }
                record.current_snapshot = Some(snapshot_id);
                Ok(None)
            },
        ))
    }

    async fn remove_snapshot(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        remove_children: bool,
    ) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        let snapshot_id = snapshot_id.to_string();
        Ok(inv.submit(
            "remove_snapshot",
            format!("{}/{}", vm.name, snapshot_id),
            move |inv| {
                let record = inv.vm_mut(&vm).map_err(|e| e.to_string())?;
                let parent = record
                    .snapshots
                    .iter()
                    .find(|s| s.id == snapshot_id)
                    .map(|s| s.parent.clone())
                    .ok_or_else(|| format!("快照不存在: {}", snapshot_id))?;

                let mut doomed = vec![snapshot_id.clone()];
                if remove_children {
                    let mut i = 0;
                    while i < doomed.len() {
                        let current = doomed[i].clone();
                        doomed.extend(
                            record
                                .snapshots
                                .iter()
                                .filter(|s| s.parent.as_deref() == Some(current.as_str()))
                                .map(|s| s.id.clone()),
                        );
                        i += 1;
                    }
                } else {
                    for child in record
                        .snapshots
                        .iter_mut()
                        .filter(|s| s.parent.as_deref() == Some(snapshot_id.as_str()))
                    {
                        child.parent = parent.clone();
                    }
                }

                record.snapshots.retain(|s| !doomed.contains(&s.id));
                let orphaned = record
                    .current_snapshot
                    .as_ref()
                    .map_or(false, |current| doomed.contains(current));
                if orphaned {
                    record.current_snapshot = parent;
                }
                Ok(None)
            },
        ))
    }

    async fn rename_snapshot(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        new_name: &str,
        description: &str,
    ) -> Result<()> {
        let mut inv = self.inventory();
        inv.record("rename_snapshot", format!("{}/{} -> {}", vm.name, snapshot_id, new_name));
        if let Some(reason) = inv.fault("rename_snapshot", new_name) {
            return Err(VimError::Fault(reason));
        }
        let record = inv.vm_mut(vm)?;
        let snapshot = record
            .snapshots
            .iter_mut()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| VimError::NotFound(format!("快照 {}", snapshot_id)))?;
        snapshot.name = new_name.to_string();
        snapshot.description = description.to_string();
        Ok(())
    }

    async fn register_vm(&self, spec: &RegisterSpec) -> Result<TaskRef> {
        let mut inv = self.inventory();
        let spec = spec.clone();
        Ok(inv.submit(
            "register_vm",
            format!("{} ({})", spec.name, spec.path),
            move |inv| {
                if inv.name_taken(&spec.name) {
                    return Err(format!("名称已存在: {}", spec.name));
                }
                let new_dir = spec.path.parent();
                let config = inv.config_mut(&spec.path).map_err(|e| e.to_string())?;
                let old_dir = config.directory();

                // 描述文件中的磁盘以相对路径引用，重新注册后指向新目录
                for device in config.devices.iter_mut() {
                    if let DeviceKind::Disk { backing } = &mut device.kind {
                        let rebased = backing
                            .flat_file()
                            .filter(|file| file.parent() == old_dir)
                            .and_then(|file| file.file_name().map(|f| new_dir.join(f)));
                        if let Some(path) = rebased {
                            backing.set_flat_file(path);
                        }
                    }
                }
                config.files = VmFiles {
                    descriptor_path: spec.path.clone(),
                    suspend_directory: new_dir,
                };
                let suspended = config.extra("checkpoint.vmState").is_some();

                let id = inv.next_id("vm");
                inv.vms.insert(
                    id.clone(),
                    VmRecord {
                        vm: VmRef::new(id, spec.name.clone()),
                        descriptor: spec.path.clone(),
                        power_state: if suspended {
                            PowerState::Suspended
                        } else {
                            PowerState::PoweredOff
                        },
                        question: None,
                        template: spec.as_template,
                        snapshots: Vec::new(),
                        current_snapshot: None,
                        guest_nics: Vec::new(),
                    },
                );
                Ok(None)
            },
        ))
    }

    async fn unregister_vm(&self, vm: &VmRef) -> Result<()> {
        let mut inv = self.inventory();
        inv.record("unregister_vm", vm.name.clone());
        if let Some(reason) = inv.fault("unregister_vm", &vm.name) {
            return Err(VimError::Fault(reason));
        }
        if inv.vm(vm)?.power_state == PowerState::PoweredOn {
            return Err(VimError::Fault(format!("虚拟机正在运行: {}", vm.name)));
        }
        inv.vms.remove(&vm.id);
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut inv = self.inventory();
        inv.vm(vm)?;
        let vm = vm.clone();
        Ok(inv.submit("destroy_vm", vm.name.clone(), move |inv| {
            let record = inv.vm(&vm).map_err(|e| e.to_string())?;
            if record.power_state == PowerState::PoweredOn {
                return Err(format!("虚拟机正在运行: {}", vm.name));
            }
            let dir = record.descriptor.parent();
            inv.vms.remove(&vm.id);
            inv.remove_within(&dir);
            Ok(None)
        }))
    }

    async fn reconfigure_vm(&self, vm: &VmRef, spec: &ConfigSpec) -> Result<TaskRef> {
        let mut inv = self.inventory();
        let descriptor = inv.vm(vm)?.descriptor.clone();
        let spec = spec.clone();
        Ok(inv.submit("reconfigure_vm", vm.name.clone(), move |inv| {
            let config = inv.config_mut(&descriptor).map_err(|e| e.to_string())?;
            let mut devices = config.devices.clone();
            for change in &spec.device_changes {
                let position = devices.iter().position(|d| d.key == change.device.key);
                match (change.operation, position) {
                    (DeviceOperation::Add, None) => devices.push(change.device.clone()),
                    (DeviceOperation::Edit, Some(i)) => devices[i] = change.device.clone(),
                    (DeviceOperation::Remove, Some(i)) => {
                        devices.remove(i);
                    }
                    (operation, _) => {
                        return Err(format!(
                            "设备变更无效: {:?} key={}",
                            operation, change.device.key
                        ))
                    }
                }
            }
            config.devices = devices;
            if let Some(annotation) = &spec.annotation {
                config.annotation = Some(annotation.clone());
            }
            for entry in &spec.extra_config {
                apply_extra(&mut config.extra_config, &entry.key, &entry.value);
            }
            Ok(None)
        }))
    }

    async fn make_directory(&self, path: &DatastorePath) -> Result<()> {
        let mut inv = self.inventory();
        inv.record("make_directory", path.to_string());
        if let Some(reason) = inv.fault("make_directory", &path.to_string()) {
            return Err(VimError::Fault(reason));
        }
        if !inv.datastores.iter().any(|ds| ds.name == path.datastore) {
            return Err(VimError::NotFound(format!("数据存储 {}", path.datastore)));
        }
        if inv.directories.contains(path) {
            return Err(VimError::Fault(format!("目录已存在: {}", path)));
        }
        let mut current = path.clone();
        while !current.directory.is_empty() {
            inv.directories.insert(current.clone());
            current = current.parent();
        }
        Ok(())
    }

    async fn copy_virtual_disk(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
        spec: &DiskSpec,
    ) -> Result<TaskRef> {
        let mut inv = self.inventory();
        let (source, destination, spec) = (source.clone(), destination.clone(), spec.clone());
        Ok(inv.submit(
            "copy_virtual_disk",
            format!("{} -> {}", source, destination),
            move |inv| {
                if !matches!(inv.files.get(&source), Some(StoredFile::Disk(_))) {
                    return Err(format!("源磁盘不存在: {}", source));
                }
                if !inv.directory_exists(&destination.parent()) {
                    return Err(format!("目标目录不存在: {}", destination.parent()));
                }
                inv.files.insert(destination, StoredFile::Disk(Some(spec)));
                Ok(None)
            },
        ))
    }

    async fn copy_datastore_file(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
    ) -> Result<TaskRef> {
        let mut inv = self.inventory();
        let (source, destination) = (source.clone(), destination.clone());
        Ok(inv.submit(
            "copy_datastore_file",
            format!("{} -> {}", source, destination),
            move |inv| {
                let file = inv
                    .files
                    .get(&source)
                    .cloned()
                    .ok_or_else(|| format!("源文件不存在: {}", source))?;
                if !inv.directory_exists(&destination.parent()) {
                    return Err(format!("目标目录不存在: {}", destination.parent()));
                }
                inv.files.insert(destination, file);
                Ok(None)
            },
        ))
    }

    async fn delete_datastore_file(&self, path: &DatastorePath) -> Result<TaskRef> {
        let mut inv = self.inventory();
        let path = path.clone();
        Ok(inv.submit("delete_datastore_file", path.to_string(), move |inv| {
            if inv.files.remove(&path).is_some() {
                return Ok(None);
            }
            let as_dir = DatastorePath::directory(path.datastore.clone(), path.relative_path());
            if inv.directories.contains(&as_dir) {
                inv.remove_within(&as_dir);
                return Ok(None);
            }
            Err(format!("文件不存在: {}", path))
        }))
    }

    async fn search_datastore(&self, directory: &DatastorePath) -> Result<Vec<DatastorePath>> {
        let mut inv = self.inventory();
        inv.record("search_datastore", directory.to_string());
        if !inv.directory_exists(directory) {
            return Err(VimError::NotFound(format!("目录 {}", directory)));
        }
        let mut found: Vec<DatastorePath> = inv
            .directories
            .iter()
            .filter(|dir| *dir != directory && dir.is_within(directory))
            .cloned()
            .collect();
        found.extend(
            inv.files
                .keys()
                .filter(|file| file.is_within(directory))
                .cloned(),
        );
        found.sort();
        Ok(found)
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo> {
        let mut inv = self.inventory();
        inv.record("task_info", task.as_str());
        if inv.failing_task_reads > 0 {
            inv.failing_task_reads -= 1;
            return Err(VimError::HttpError("任务状态读取失败".to_string()));
        }

        let blocked = {
            let record = inv
                .tasks
                .get(task.as_str())
                .ok_or_else(|| VimError::NotFound(format!("任务 {}", task)))?;
            record
                .blocked_on
                .as_ref()
                .and_then(|id| inv.vms.get(id))
                .map(|vm| vm.question.is_some())
                .unwrap_or(false)
        };

        let record = inv
            .tasks
            .get_mut(task.as_str())
            .ok_or_else(|| VimError::NotFound(format!("任务 {}", task)))?;
        if blocked {
            return Ok(TaskInfo {
                state: TaskState::Running,
                error: None,
            });
        }
        if record.running_polls > 0 {
            record.running_polls -= 1;
            return Ok(TaskInfo {
                state: TaskState::Running,
                error: None,
            });
        }
        Ok(match &record.outcome {
            Ok(()) => TaskInfo {
                state: TaskState::Success,
                error: None,
            },
            Err(reason) => TaskInfo {
                state: TaskState::Error,
                error: Some(reason.clone()),
            },
        })
    }
}

// ============================================
// 构建器与夹具
// ============================================

/// 虚拟机夹具
///
/// 默认布局: `[datastore1] {name}/{name}.vmx`、`{name}.vmdk` (flatVer2，挂在
/// "LSI Logic" 控制器下) 与 `{name}.nvram`。
#[derive(Debug, Clone)]
pub struct VmFixture {
    name: String,
    datastore: String,
    power_state: PowerState,
    question: Option<Question>,
    template: bool,
    controller_summary: String,
    disk_backing: Option<DiskBacking>,
    nvram_present: bool,
    snapshots: Vec<(String, Option<String>)>,
    guest_nics: Vec<GuestNic>,
    annotation: Option<String>,
}

impl VmFixture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datastore: "datastore1".to_string(),
            power_state: PowerState::PoweredOff,
            question: None,
            template: false,
            controller_summary: "LSI Logic".to_string(),
            disk_backing: None,
            nvram_present: true,
            snapshots: Vec::new(),
            guest_nics: Vec::new(),
            annotation: None,
        }
    }

    pub fn datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = datastore.into();
        self
    }

    pub fn power_state(mut self, state: PowerState) -> Self {
        self.power_state = state;
        self
    }

    pub fn question(mut self, question: Question) -> Self {
        self.question = Some(question);
        self
    }

    pub fn template(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn controller_summary(mut self, summary: impl Into<String>) -> Self {
        self.controller_summary = summary.into();
        self
    }

    /// 覆盖磁盘后端 (例如不支持的格式)
    pub fn disk_backing(mut self, backing: DiskBacking) -> Self {
        self.disk_backing = Some(backing);
        self
    }

    /// 扩展配置中引用 NVRAM，但文件不存在
    pub fn missing_nvram(mut self) -> Self {
        self.nvram_present = false;
        self
    }

    /// 添加快照，`parent` 为父快照名称
    pub fn snapshot(mut self, name: impl Into<String>, parent: Option<&str>) -> Self {
        self.snapshots.push((name.into(), parent.map(str::to_string)));
        self
    }

    pub fn guest_nic(mut self, mac: impl Into<String>, ips: &[&str]) -> Self {
        self.guest_nics.push(GuestNic {
            mac_address: mac.into(),
            ip_addresses: ips.iter().map(|ip| ip.to_string()).collect(),
        });
        self
    }

    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    fn install(self, inv: &mut Inventory) {
        let dir = DatastorePath::directory(self.datastore.clone(), self.name.clone());
        let descriptor = dir.join(&format!("{}.vmx", self.name));
        let disk = dir.join(&format!("{}.vmdk", self.name));
        let nvram = format!("{}.nvram", self.name);

        if !inv.datastores.iter().any(|ds| ds.name == self.datastore) {
            inv.datastores.push(DatastoreInfo {
                name: self.datastore.clone(),
                free_bytes: DEFAULT_FREE_BYTES,
            });
        }

        let backing = self.disk_backing.clone().unwrap_or(DiskBacking::FlatV2 {
            file_name: disk.clone(),
        });
        let mut extra_config = vec![OptionValue::new("nvram", nvram.clone())];
        if self.power_state == PowerState::Suspended {
            let vmss = format!("{}.vmss", self.name);
            inv.files.insert(dir.join(&vmss), StoredFile::Data);
            extra_config.push(OptionValue::new("checkpoint.vmState", vmss));
        }

        let config = VmConfig {
            files: VmFiles {
                descriptor_path: descriptor.clone(),
                suspend_directory: dir.clone(),
            },
            devices: vec![
                VirtualDevice {
                    key: 1000,
                    controller_key: None,
                    summary: self.controller_summary.clone(),
                    kind: DeviceKind::Controller,
                },
                VirtualDevice {
                    key: 2000,
                    controller_key: Some(1000),
                    summary: "16,777,216 KB".to_string(),
                    kind: DeviceKind::Disk { backing },
                },
                VirtualDevice {
                    key: 4000,
                    controller_key: None,
                    summary: "VM Network".to_string(),
                    kind: DeviceKind::Other,
                },
            ],
            extra_config,
            annotation: self.annotation.clone(),
        };

        inv.directories.insert(dir.clone());
        inv.files.insert(descriptor.clone(), StoredFile::Descriptor(config.clone()));
        inv.files.insert(disk, StoredFile::Disk(None));
        if self.nvram_present {
            inv.files.insert(dir.join(&nvram), StoredFile::Data);
        }

        let mut snapshots: Vec<SnapshotRecord> = Vec::new();
        for (name, parent) in &self.snapshots {
            let id = inv.next_id("snapshot");
            let parent = parent.as_ref().and_then(|parent| {
                snapshots
                    .iter()
                    .find(|s| &s.name == parent)
                    .map(|s| s.id.clone())
            });
            snapshots.push(SnapshotRecord {
                id,
                name: name.clone(),
                description: name.clone(),
                parent,
                created: Utc::now(),
                config: config.clone(),
            });
        }

        let id = inv.next_id("vm");
        inv.vms.insert(
            id.clone(),
            VmRecord {
                vm: VmRef::new(id, self.name.clone()),
                descriptor,
                power_state: self.power_state,
                question: self.question,
                template: self.template,
                current_snapshot: snapshots.last().map(|s| s.id.clone()),
                snapshots,
                guest_nics: self.guest_nics,
            },
        );
    }
}

/// 内存服务器构建器
#[derive(Debug, Default)]
pub struct InMemoryServerBuilder {
    version: Option<String>,
    datastores: Vec<DatastoreInfo>,
    vms: Vec<VmFixture>,
    task_running_polls: u32,
}

impl InMemoryServerBuilder {
    /// 服务器版本号
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn datastore(mut self, name: impl Into<String>, free_bytes: u64) -> Self {
        self.datastores.push(DatastoreInfo {
            name: name.into(),
            free_bytes,
        });
        self
    }

    pub fn vm(mut self, fixture: VmFixture) -> Self {
        self.vms.push(fixture);
        self
    }

    /// 任务进入终态前保持运行的读取次数
    pub fn task_running_polls(mut self, polls: u32) -> Self {
        self.task_running_polls = polls;
        self
    }

    pub fn build(self) -> InMemoryServer {
        let mut inv = Inventory {
            about: self.version.map(|version| ServerAbout {
                version,
                hostname: Some("esx-memory.local".to_string()),
                ip: Some("127.0.0.1".to_string()),
            }),
            datastores: self.datastores,
            task_running_polls: self.task_running_polls,
            ..Default::default()
        };
        for fixture in self.vms {
            fixture.install(&mut inv);
        }
        InMemoryServer {
            state: Mutex::new(inv),
        }
    }
}

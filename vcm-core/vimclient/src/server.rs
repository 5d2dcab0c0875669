//! 管理服务器接口
//!
//! 编排引擎只通过这个 trait 与虚拟化管理服务器交互。长时间运行的变更操作
//! 返回 [`TaskRef`]，调用方必须通过任务轮询器消费它。

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    ConfigSpec, DatastoreInfo, DatastorePath, DiskSpec, GuestNic, RegisterSpec, ServerAbout,
    SnapshotInfo, TaskInfo, TaskRef, VmConfig, VmRef, VmRuntime,
};

/// 虚拟化管理服务器
#[async_trait]
pub trait ManagementServer: Send + Sync {
    // ============================================
    // 会话
    // ============================================

    /// 登录
    async fn login(&self, username: &str, password: &str) -> Result<()>;

    /// 注销
    async fn logout(&self) -> Result<()>;

    /// 服务器版本与主机信息
    async fn about(&self) -> Result<ServerAbout>;

    // ============================================
    // 清单与状态
    // ============================================

    /// 所有已注册虚拟机的名称
    async fn list_vm_names(&self) -> Result<Vec<String>>;

    /// 按名称查找虚拟机
    async fn find_vm_by_name(&self, name: &str) -> Result<Option<VmRef>>;

    /// 电源状态与待回答问题
    async fn runtime(&self, vm: &VmRef) -> Result<VmRuntime>;

    /// 虚拟机配置 (描述文件路径、设备、扩展配置)
    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig>;

    /// 虚拟机所在的数据存储
    async fn list_datastores(&self, vm: &VmRef) -> Result<Vec<DatastoreInfo>>;

    /// 客户机网卡
    async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>>;

    // ============================================
    // 电源
    // ============================================

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn suspend(&self, vm: &VmRef) -> Result<TaskRef>;

    /// 冷重置
    async fn reset(&self, vm: &VmRef) -> Result<TaskRef>;

    /// 回答待处理问题
    async fn answer_question(&self, vm: &VmRef, question_id: &str, choice: &str) -> Result<()>;

    // ============================================
    // 快照
    // ============================================

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
        description: &str,
        quiesce: bool,
        memory: bool,
    ) -> Result<TaskRef>;

    /// 快照森林 (根列表有序)
    async fn snapshot_forest(&self, vm: &VmRef) -> Result<Vec<SnapshotInfo>>;

    /// 快照创建时的虚拟机配置 (包括当时的磁盘后端)
    async fn snapshot_config(&self, vm: &VmRef, snapshot_id: &str) -> Result<VmConfig>;

    async fn revert_snapshot(&self, vm: &VmRef, snapshot_id: &str) -> Result<TaskRef>;

    async fn remove_snapshot(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        remove_children: bool,
    ) -> Result<TaskRef>;

    async fn rename_snapshot(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        new_name: &str,
        description: &str,
    ) -> Result<()>;

    // ============================================
    // 注册与配置
    // ============================================

    async fn register_vm(&self, spec: &RegisterSpec) -> Result<TaskRef>;

    async fn unregister_vm(&self, vm: &VmRef) -> Result<()>;

    async fn destroy_vm(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn reconfigure_vm(&self, vm: &VmRef, spec: &ConfigSpec) -> Result<TaskRef>;

    // ============================================
    // 数据存储文件
    // ============================================

    async fn make_directory(&self, path: &DatastorePath) -> Result<()>;

    async fn copy_virtual_disk(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
        spec: &DiskSpec,
    ) -> Result<TaskRef>;

    async fn copy_datastore_file(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
    ) -> Result<TaskRef>;

    async fn delete_datastore_file(&self, path: &DatastorePath) -> Result<TaskRef>;

    /// 递归列出目录下的所有文件与子目录
    async fn search_datastore(&self, directory: &DatastorePath) -> Result<Vec<DatastorePath>>;

    // ============================================
    // 任务
    // ============================================

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo>;
}

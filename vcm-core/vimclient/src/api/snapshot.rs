//! 快照管理 API
//!
//! 提供虚拟机快照管理功能，包括：
//! - 创建快照
//! - 查询快照树与快照时的配置
//! - 恢复到快照
//! - 重命名、删除快照

use reqwest::Method;
use tracing::info;

use crate::client::VimClient;
use crate::error::Result;
use crate::models::{SnapshotInfo, TaskRef, VmConfig, VmRef};

/// 快照管理 API
pub struct SnapshotApi<'a> {
    client: &'a VimClient,
}

impl<'a> SnapshotApi<'a> {
    pub(crate) fn new(client: &'a VimClient) -> Self {
        Self { client }
    }

    fn base(vm: &VmRef) -> String {
        format!("/api/v1/vm/{}/snapshot", urlencoding::encode(&vm.id))
    }

    /// 获取虚拟机快照森林
    pub async fn list(&self, vm: &VmRef) -> Result<Vec<SnapshotInfo>> {
        info!("获取虚拟机快照列表: {}", vm);
        self.client
            .request(Method::GET, &Self::base(vm), None::<()>)
            .await
    }

    /// 获取快照创建时的虚拟机配置
    pub async fn config(&self, vm: &VmRef, snapshot_id: &str) -> Result<VmConfig> {
        self.client
            .request(
                Method::GET,
                &format!("{}/{}/config", Self::base(vm), urlencoding::encode(snapshot_id)),
                None::<()>,
            )
            .await
    }

    /// 创建快照
    pub async fn create(
        &self,
        vm: &VmRef,
        name: &str,
        description: &str,
        quiesce: bool,
        memory: bool,
    ) -> Result<TaskRef> {
        info!("创建虚拟机快照: {} -> {}", vm, name);
        self.client
            .request_task(
                Method::POST,
                &Self::base(vm),
                Some(serde_json::json!({
                    "name": name,
                    "description": description,
                    "quiesce": quiesce,
                    "memory": memory,
                })),
            )
            .await
    }

    /// 恢复到快照
    pub async fn revert(&self, vm: &VmRef, snapshot_id: &str) -> Result<TaskRef> {
        info!("恢复虚拟机快照: {} -> {}", vm, snapshot_id);
        self.client
            .request_task(
                Method::POST,
                &format!("{}/{}/revert", Self::base(vm), urlencoding::encode(snapshot_id)),
                None::<()>,
            )
            .await
    }

    /// 删除快照
    pub async fn remove(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        remove_children: bool,
    ) -> Result<TaskRef> {
        info!("删除虚拟机快照: {} -> {}", vm, snapshot_id);
        self.client
            .request_task(
                Method::DELETE,
                &format!(
                    "{}/{}?removeChildren={}",
                    Self::base(vm),
                    urlencoding::encode(snapshot_id),
                    remove_children
                ),
                None::<()>,
            )
            .await
    }

    /// 重命名快照
    pub async fn rename(
        &self,
        vm: &VmRef,
        snapshot_id: &str,
        new_name: &str,
        description: &str,
    ) -> Result<()> {
        info!("重命名虚拟机快照: {} -> {}", snapshot_id, new_name);
        self.client
            .execute(
                Method::PUT,
                &format!("{}/{}", Self::base(vm), urlencoding::encode(snapshot_id)),
                Some(serde_json::json!({
                    "name": new_name,
                    "description": description,
                })),
            )
            .await
    }
}

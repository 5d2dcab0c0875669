//! 快照生命周期

use std::collections::BTreeMap;

use tracing::info;
use vcm_vimclient::VmRef;

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::lease::NameLease;
use crate::naming::NameAllocator;
use crate::poller::TaskPoller;
use crate::snapshot_tree::SnapshotForest;

/// 快照操作
pub struct SnapshotOps {
    ctx: Context,
    poller: TaskPoller,
    allocator: NameAllocator,
}

impl SnapshotOps {
    pub fn new(ctx: Context) -> Self {
        Self {
            poller: TaskPoller::new(ctx.clone()),
            allocator: NameAllocator::new(ctx.clone()),
            ctx,
        }
    }

    /// 创建快照，返回快照名称
    ///
    /// 未给出名称时自动分配；给出名称且未忽略冲突时先校验命名空间。
    /// 描述默认与名称相同，始终请求静默与内存快照。
    pub async fn create(
        &self,
        vm_name: &str,
        name: Option<&str>,
        description: Option<&str>,
        ignore_collisions: bool,
    ) -> Result<String> {
        let vm = self.ctx.find_vm(vm_name).await?;
        self.create_on(&vm, name, description, ignore_collisions)
            .await
    }

    pub async fn create_on(
        &self,
        vm: &VmRef,
        name: Option<&str>,
        description: Option<&str>,
        ignore_collisions: bool,
    ) -> Result<String> {
        let (name, _lease): (String, Option<NameLease>) = match name {
            Some(name) if ignore_collisions => (name.to_string(), None),
            Some(name) => {
                let lease = self.allocator.claim(name).await?;
                (name.to_string(), Some(lease))
            }
            None => {
                let lease = self.allocator.allocate().await?;
                (lease.name().to_string(), Some(lease))
            }
        };
        let description = description.unwrap_or(&name);

        info!("创建快照: {} -> {}", vm, name);
        let task = self
            .ctx
            .server()
            .create_snapshot(vm, &name, description, true, true)
            .await?;
        self.poller
            .wait_success(&task, Some(vm), &format!("创建快照 {}", name))
            .await?;
        Ok(name)
    }

    /// 快照森林
    pub async fn forest(&self, vm_name: &str) -> Result<SnapshotForest> {
        let vm = self.ctx.find_vm(vm_name).await?;
        self.forest_of(&vm).await
    }

    pub async fn forest_of(&self, vm: &VmRef) -> Result<SnapshotForest> {
        let roots = self.ctx.server().snapshot_forest(vm).await?;
        Ok(SnapshotForest::from_info(&roots))
    }

    /// 是否存在任何快照
    pub async fn has_any(&self, vm: &VmRef) -> Result<bool> {
        Ok(!self.forest_of(vm).await?.is_empty())
    }

    /// 根快照名称 → 直接子快照名称，没有快照时为空
    pub async fn list(&self, vm_name: &str) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.forest(vm_name).await?.root_summary())
    }

    /// 恢复到快照
    pub async fn revert(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        let vm = self.ctx.find_vm(vm_name).await?;
        let handle = self.find_handle(&vm, snapshot).await?;

        info!("恢复快照: {} -> {}", vm, snapshot);
        let task = self.ctx.server().revert_snapshot(&vm, &handle).await?;
        self.poller
            .wait_success(&task, Some(&vm), &format!("恢复快照 {}", snapshot))
            .await
    }

    /// 重命名快照，返回新名称
    pub async fn rename(
        &self,
        vm_name: &str,
        old_name: &str,
        new_name: Option<&str>,
        description: Option<&str>,
    ) -> Result<String> {
        let vm = self.ctx.find_vm(vm_name).await?;
        let lease = self.allocator.resolve(new_name).await?;
        let new_name = lease.name().to_string();
        let description = description.unwrap_or(&new_name);

        let handle = self.find_handle(&vm, old_name).await?;
        info!("重命名快照: {} / {} -> {}", vm, old_name, new_name);
        self.ctx
            .server()
            .rename_snapshot(&vm, &handle, &new_name, description)
            .await?;
        Ok(new_name)
    }

    /// 删除快照
    pub async fn remove(&self, vm_name: &str, snapshot: &str, remove_children: bool) -> Result<()> {
        let vm = self.ctx.find_vm(vm_name).await?;
        let handle = self.find_handle(&vm, snapshot).await?;

        info!(
            "删除快照: {} / {} (含子快照: {})",
            vm, snapshot, remove_children
        );
        let task = self
            .ctx
            .server()
            .remove_snapshot(&vm, &handle, remove_children)
            .await?;
        self.poller
            .wait_success(&task, Some(&vm), &format!("删除快照 {}", snapshot))
            .await
    }

    async fn find_handle(&self, vm: &VmRef, snapshot: &str) -> Result<String> {
        let forest = self.forest_of(vm).await?;
        forest
            .find_by_name(snapshot)
            .map(|id| forest.node(id).handle.clone())
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("虚拟机 {} 的快照 {}", vm, snapshot))
            })
    }
}

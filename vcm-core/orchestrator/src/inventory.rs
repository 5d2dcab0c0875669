//! 清单查询与销毁

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use vcm_vimclient::{DatastorePath, PowerState, ServerAbout, VmConfig, VmRef};

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::poller::TaskPoller;
use crate::power::PowerOps;
use crate::snapshot_tree::SnapshotForest;

/// 清单操作
pub struct InventoryOps {
    ctx: Context,
    poller: TaskPoller,
    power: PowerOps,
}

impl InventoryOps {
    pub fn new(ctx: Context) -> Self {
        Self {
            poller: TaskPoller::new(ctx.clone()),
            power: PowerOps::new(ctx.clone()),
            ctx,
        }
    }

    /// 虚拟机是否已注册
    pub async fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.ctx.server().find_vm_by_name(name).await?.is_some())
    }

    /// 所有已注册虚拟机的名称 (已排序)
    pub async fn list_registered(&self) -> Result<Vec<String>> {
        let mut names = self.ctx.server().list_vm_names().await?;
        names.sort();
        Ok(names)
    }

    /// 描述文件路径
    pub async fn descriptor_path(&self, name: &str) -> Result<DatastorePath> {
        let vm = self.ctx.find_vm(name).await?;
        Ok(self.ctx.server().vm_config(&vm).await?.files.descriptor_path)
    }

    /// 是否为快速克隆
    ///
    /// 当前配置或任一快照时的配置中，有虚拟磁盘不是平面文件格式，
    /// 或后端文件不在虚拟机自身目录中时成立。
    pub async fn is_quick_clone(&self, name: &str) -> Result<bool> {
        let vm = self.ctx.find_vm(name).await?;
        let config = self.ctx.server().vm_config(&vm).await?;
        self.shares_foreign_disks(&vm, &config).await
    }

    /// 快照后当前磁盘是自身目录中的差分文件，共享母盘只出现在快照配置里
    async fn shares_foreign_disks(&self, vm: &VmRef, config: &VmConfig) -> Result<bool> {
        if has_foreign_backing(config) {
            return Ok(true);
        }

        let server = self.ctx.server();
        let forest = SnapshotForest::from_info(&server.snapshot_forest(vm).await?);
        for id in forest.preorder() {
            let node = forest.node(id);
            let snapshot_config = server.snapshot_config(vm, &node.handle).await?;
            if has_foreign_backing(&snapshot_config) {
                debug!("虚拟机 {} 的快照 {} 引用外部磁盘", vm, node.name);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 销毁虚拟机
    ///
    /// 运行中的虚拟机先关机。快速克隆只删除自身目录，共享的母盘磁盘保留；
    /// 其他虚拟机交给服务器的销毁任务。
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let vm = self.ctx.find_vm(name).await?;
        if self.power.state_of(&vm).await? == PowerState::PoweredOn {
            self.power.stop_vm(&vm).await?;
        }

        let config = self.ctx.server().vm_config(&vm).await?;
        if self.shares_foreign_disks(&vm, &config).await? {
            return self.delete_quick_clone(&vm, &config).await;
        }

        info!("销毁虚拟机: {}", vm);
        let task = self.ctx.server().destroy_vm(&vm).await?;
        self.poller
            .wait_success(&task, Some(&vm), &format!("销毁虚拟机 {}", vm))
            .await
    }

    /// 注销快速克隆并删除其目录，按路径倒序删除以保证子项先于父目录
    async fn delete_quick_clone(&self, vm: &VmRef, config: &VmConfig) -> Result<()> {
        let server = self.ctx.server();
        let directory = config.directory();

        info!("注销快速克隆: {} ({})", vm, directory);
        server.unregister_vm(vm).await?;

        let mut paths = server.search_datastore(&directory).await?;
        paths.push(directory);
        paths.sort_by_key(|path| std::cmp::Reverse(path.to_string()));

        for path in &paths {
            let task = server.delete_datastore_file(path).await?;
            self.poller
                .wait_success(&task, None, &format!("删除文件 {}", path))
                .await
                .map_err(|e| {
                    warn!("删除快速克隆 {} 的文件失败: {}", vm, e);
                    e
                })?;
        }
        info!("已删除快速克隆 {} 的 {} 个文件", vm, paths.len());
        Ok(())
    }

    /// 虚拟机所在数据存储的剩余空间 (字节)
    pub async fn datastore_space(&self, name: &str) -> Result<BTreeMap<String, u64>> {
        let vm = self.ctx.find_vm(name).await?;
        Ok(self
            .ctx
            .server()
            .list_datastores(&vm)
            .await?
            .into_iter()
            .map(|store| (store.name, store.free_bytes))
            .collect())
    }

    /// 第一块网卡的 MAC 地址
    pub async fn mac_address(&self, name: &str) -> Result<Option<String>> {
        let vm = self.ctx.find_vm(name).await?;
        let nics = self.ctx.server().guest_nics(&vm).await?;
        Ok(nics.into_iter().next().map(|nic| nic.mac_address))
    }

    /// 第一块网卡的第一个 IP 地址
    pub async fn ip_address(&self, name: &str) -> Result<Option<String>> {
        let vm = self.ctx.find_vm(name).await?;
        let nics = self.ctx.server().guest_nics(&vm).await?;
        Ok(nics
            .into_iter()
            .next()
            .and_then(|nic| nic.ip_addresses.into_iter().next()))
    }

    /// 管理服务器版本与主机信息
    pub async fn server_identity(&self) -> Result<ServerAbout> {
        self.ctx.server().about().await.map_err(OrchestratorError::from)
    }
}

fn has_foreign_backing(config: &VmConfig) -> bool {
    let own = config.directory();
    config.disks().any(|disk| {
        match disk.disk_backing().and_then(|backing| backing.flat_file()) {
            Some(file) => file.parent() != own,
            None => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcm_vimclient::{DeviceKind, DiskBacking, VirtualDevice, VmFiles};

    fn config_with(backing: DiskBacking) -> VmConfig {
        VmConfig {
            files: VmFiles {
                descriptor_path: DatastorePath::file("ds", "clone", "clone.vmx"),
                suspend_directory: DatastorePath::directory("ds", "clone"),
            },
            devices: vec![VirtualDevice {
                key: 2000,
                controller_key: Some(1000),
                summary: String::new(),
                kind: DeviceKind::Disk { backing },
            }],
            extra_config: vec![],
            annotation: None,
        }
    }

    #[test]
    fn test_own_directory_backing_is_not_quick_clone() {
        let config = config_with(DiskBacking::FlatV2 {
            file_name: DatastorePath::file("ds", "clone", "clone.vmdk"),
        });
        assert!(!has_foreign_backing(&config));
    }

    #[test]
    fn test_foreign_backing_is_quick_clone() {
        let config = config_with(DiskBacking::FlatV1 {
            file_name: DatastorePath::file("ds", "master", "master.vmdk"),
        });
        assert!(has_foreign_backing(&config));

        let config = config_with(DiskBacking::Other {
            tag: "rawDiskMapping".to_string(),
        });
        assert!(has_foreign_backing(&config));
    }
}

//! 虚拟机管理 API
//!
//! 提供虚拟机管理功能，包括：
//! - 清单查询：列表、按名称查找
//! - 运行时：电源状态、待回答问题、客户机网卡
//! - 电源操作：开机、关机、挂起、重置
//! - 注册、注销、销毁、重新配置

use reqwest::Method;
use tracing::info;

use crate::client::VimClient;
use crate::error::Result;
use crate::models::{
    ConfigSpec, DatastoreInfo, GuestNic, RegisterSpec, TaskRef, VmConfig, VmRef, VmRuntime,
};

/// 虚拟机管理 API
pub struct VmApi<'a> {
    client: &'a VimClient,
}

impl<'a> VmApi<'a> {
    pub(crate) fn new(client: &'a VimClient) -> Self {
        Self { client }
    }

    fn base(vm: &VmRef) -> String {
        format!("/api/v1/vm/{}", urlencoding::encode(&vm.id))
    }

    /// 查询所有已注册虚拟机
    pub async fn list(&self) -> Result<Vec<VmRef>> {
        info!("查询虚拟机列表");
        self.client
            .request(Method::GET, "/api/v1/vm", None::<()>)
            .await
    }

    /// 按名称查找虚拟机
    pub async fn find_by_name(&self, name: &str) -> Result<Option<VmRef>> {
        let matches: Vec<VmRef> = self
            .client
            .request(
                Method::GET,
                &format!("/api/v1/vm?name={}", urlencoding::encode(name)),
                None::<()>,
            )
            .await?;
        Ok(matches.into_iter().find(|vm| vm.name == name))
    }

    /// 查询运行时状态
    pub async fn runtime(&self, vm: &VmRef) -> Result<VmRuntime> {
        self.client
            .request(Method::GET, &format!("{}/runtime", Self::base(vm)), None::<()>)
            .await
    }

    /// 查询虚拟机配置
    pub async fn config(&self, vm: &VmRef) -> Result<VmConfig> {
        self.client
            .request(Method::GET, &format!("{}/config", Self::base(vm)), None::<()>)
            .await
    }

    /// 查询虚拟机所在数据存储
    pub async fn datastores(&self, vm: &VmRef) -> Result<Vec<DatastoreInfo>> {
        self.client
            .request(
                Method::GET,
                &format!("{}/datastores", Self::base(vm)),
                None::<()>,
            )
            .await
    }

    /// 查询客户机网卡
    pub async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>> {
        self.client
            .request(
                Method::GET,
                &format!("{}/guest/nics", Self::base(vm)),
                None::<()>,
            )
            .await
    }

    /// 电源操作 (`on` / `off` / `suspend` / `reset`)
    pub async fn power(&self, vm: &VmRef, action: &str) -> Result<TaskRef> {
        info!("虚拟机电源操作: {} -> {}", vm, action);
        self.client
            .request_task(
                Method::POST,
                &format!("{}/power/{}", Self::base(vm), action),
                None::<()>,
            )
            .await
    }

    /// 回答待处理问题
    pub async fn answer(&self, vm: &VmRef, question_id: &str, choice: &str) -> Result<()> {
        info!("回答虚拟机问题: {} [{}] -> {}", vm, question_id, choice);
        self.client
            .execute(
                Method::POST,
                &format!(
                    "{}/question/{}/answer",
                    Self::base(vm),
                    urlencoding::encode(question_id)
                ),
                Some(serde_json::json!({ "choice": choice })),
            )
            .await
    }

    /// 注册虚拟机
    pub async fn register(&self, spec: &RegisterSpec) -> Result<TaskRef> {
        info!("注册虚拟机: {} ({})", spec.name, spec.path);
        self.client
            .request_task(Method::POST, "/api/v1/vm/register", Some(spec))
            .await
    }

    /// 注销虚拟机 (保留文件)
    pub async fn unregister(&self, vm: &VmRef) -> Result<()> {
        info!("注销虚拟机: {}", vm);
        self.client
            .execute(
                Method::POST,
                &format!("{}/unregister", Self::base(vm)),
                None::<()>,
            )
            .await
    }

    /// 销毁虚拟机 (删除文件)
    pub async fn destroy(&self, vm: &VmRef) -> Result<TaskRef> {
        info!("销毁虚拟机: {}", vm);
        self.client
            .request_task(Method::DELETE, &Self::base(vm), None::<()>)
            .await
    }

    /// 重新配置虚拟机
    pub async fn reconfigure(&self, vm: &VmRef, spec: &ConfigSpec) -> Result<TaskRef> {
        info!("重新配置虚拟机: {}", vm);
        self.client
            .request_task(
                Method::POST,
                &format!("{}/reconfigure", Self::base(vm)),
                Some(spec),
            )
            .await
    }
}

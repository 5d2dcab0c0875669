//! 编排上下文
//!
//! 管理服务器、配置、时钟与进程内租约集中在一个显式构造的上下文中，
//! 由各组件的构造函数接收。

use std::sync::Arc;

use vcm_vimclient::{ManagementServer, VmRef};

use crate::clock::{Clock, TokioClock};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::lease::{NameLeases, SourceLocks};

/// 编排上下文
#[derive(Clone)]
pub struct Context {
    server: Arc<dyn ManagementServer>,
    config: Arc<OrchestratorConfig>,
    clock: Arc<dyn Clock>,
    leases: NameLeases,
    locks: SourceLocks,
}

impl Context {
    pub fn new(server: Arc<dyn ManagementServer>, config: OrchestratorConfig) -> Self {
        Self {
            server,
            config: Arc::new(config),
            clock: Arc::new(TokioClock),
            leases: NameLeases::new(),
            locks: SourceLocks::new(),
        }
    }

    /// 替换时钟
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn server(&self) -> &dyn ManagementServer {
        self.server.as_ref()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn leases(&self) -> &NameLeases {
        &self.leases
    }

    pub fn source_locks(&self) -> &SourceLocks {
        &self.locks
    }

    /// 按名称查找虚拟机，不存在时返回 `NotFound`
    pub async fn find_vm(&self, name: &str) -> Result<VmRef> {
        self.server
            .find_vm_by_name(name)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("虚拟机 {}", name)))
    }
}

//! 名称分配
//!
//! 虚拟机名称与快照名称共享同一个命名空间: 目标名称必须同时避开清单中
//! 所有虚拟机名称和所有虚拟机上的所有快照名称。分配结果以租约形式返回，
//! 租约存续期间同一进程内的其他流水线不会拿到同一名称。

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::lease::NameLease;
use crate::snapshot_tree::inventory_snapshot_names;

type NameGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// 生成 32 位十六进制随机名称
pub fn generate_name() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 名称分配器
pub struct NameAllocator {
    ctx: Context,
    generator: NameGenerator,
}

impl NameAllocator {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            generator: Arc::new(generate_name),
        }
    }

    /// 替换名称生成函数
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generator = Arc::new(generator);
        self
    }

    /// 虚拟机名称与快照名称的并集
    pub async fn taken_names(&self) -> Result<HashSet<String>> {
        let server = self.ctx.server();
        let mut taken: HashSet<String> = server.list_vm_names().await?.into_iter().collect();
        taken.extend(inventory_snapshot_names(server).await?);
        Ok(taken)
    }

    /// 生成一个当前未被占用的名称
    pub async fn allocate(&self) -> Result<NameLease> {
        let taken = self.taken_names().await?;
        let policy = &self.ctx.config().name_retry;

        let mut attempt = 1u32;
        while policy.allows(attempt) {
            let candidate = (self.generator)();
            if !taken.contains(&candidate) {
                if let Some(lease) = self.ctx.leases().try_acquire(&candidate) {
                    info!("分配名称: {} (第 {} 次尝试)", candidate, attempt);
                    return Ok(lease);
                }
            }
            debug!("候选名称 {} 已被占用", candidate);
            attempt = attempt.saturating_add(1);
        }

        Err(OrchestratorError::NameCollision(format!(
            "尝试 {} 次后仍未找到可用名称",
            attempt - 1
        )))
    }

    /// 校验名称未被任何虚拟机或快照使用
    pub async fn validate(&self, candidate: &str) -> Result<()> {
        let server = self.ctx.server();
        if server.list_vm_names().await?.iter().any(|n| n == candidate) {
            return Err(OrchestratorError::NameCollision(format!(
                "{} 与已有虚拟机重名",
                candidate
            )));
        }
        if inventory_snapshot_names(server).await?.contains(candidate) {
            return Err(OrchestratorError::NameCollision(format!(
                "{} 与已有快照重名",
                candidate
            )));
        }
        Ok(())
    }

    /// 校验并租用给定名称
    pub async fn claim(&self, candidate: &str) -> Result<NameLease> {
        if candidate.trim().is_empty() {
            return Err(OrchestratorError::NameCollision("名称不能为空".to_string()));
        }
        let lease = self.ctx.leases().try_acquire(candidate).ok_or_else(|| {
            OrchestratorError::NameCollision(format!("{} 正被其他操作使用", candidate))
        })?;
        self.validate(candidate).await?;
        Ok(lease)
    }

    /// 有名称时校验并租用，没有时分配
    pub async fn resolve(&self, requested: Option<&str>) -> Result<NameLease> {
        match requested {
            Some(name) => self.claim(name).await,
            None => self.allocate().await,
        }
    }
}

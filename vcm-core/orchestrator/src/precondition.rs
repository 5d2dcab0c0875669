//! 电源状态前置条件
//!
//! 复制磁盘前源虚拟机必须处于非运行状态。运行中的虚拟机会被挂起，挂起
//! 失败或挂起后仍在运行时返回 `Precondition`，此时调用方尚未修改任何
//! 目标状态。

use tracing::{info, warn};
use vcm_vimclient::{PowerState, VmRef};

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::poller::{TaskOutcome, TaskPoller};
use crate::question::QuestionResponder;

/// 电源状态前置条件
pub struct StatePrecondition {
    ctx: Context,
    poller: TaskPoller,
    responder: QuestionResponder,
}

impl StatePrecondition {
    pub fn new(ctx: Context) -> Self {
        Self {
            poller: TaskPoller::new(ctx.clone()),
            responder: QuestionResponder::new(ctx.clone()),
            ctx,
        }
    }

    /// 确保虚拟机处于关机或挂起状态，返回生效的状态
    pub async fn ensure_quiescent(&self, vm: &VmRef) -> Result<PowerState> {
        let server = self.ctx.server();
        let mut runtime = server.runtime(vm).await?;

        if let Some(question) = runtime.question.take() {
            self.responder.resolve(vm, &question).await?;
            runtime = server.runtime(vm).await?;
        }

        match runtime.effective_state() {
            state @ (PowerState::PoweredOff | PowerState::Suspended) => {
                info!("虚拟机 {} 当前状态 {}，无需挂起", vm, state);
                Ok(state)
            }
            PowerState::PendingQuestion => Err(OrchestratorError::Precondition(format!(
                "虚拟机 {} 回答问题后仍有待处理问题",
                vm
            ))),
            PowerState::PoweredOn => self.suspend(vm).await,
        }
    }

    async fn suspend(&self, vm: &VmRef) -> Result<PowerState> {
        info!("虚拟机 {} 正在运行，尝试挂起", vm);
        let server = self.ctx.server();

        let task = server.suspend(vm).await.map_err(|e| {
            OrchestratorError::Precondition(format!("虚拟机 {} 挂起请求失败: {}", vm, e))
        })?;
        // 轮询通道失效也视为挂起失败；未知问题保持原错误
        let outcome = self.poller.wait(&task, Some(vm)).await.map_err(|e| match e {
            OrchestratorError::TransientPollError { .. } => {
                OrchestratorError::Precondition(format!("虚拟机 {} 挂起任务状态未知: {}", vm, e))
            }
            other => other,
        })?;
        if let TaskOutcome::Failure(reason) = outcome {
            warn!("虚拟机 {} 挂起失败: {}", vm, reason);
            return Err(OrchestratorError::Precondition(format!(
                "虚拟机 {} 挂起失败: {}",
                vm, reason
            )));
        }

        let state = server.runtime(vm).await?.effective_state();
        if state != PowerState::Suspended {
            warn!("虚拟机 {} 挂起任务完成但状态为 {}", vm, state);
            return Err(OrchestratorError::Precondition(format!(
                "虚拟机 {} 挂起后状态为 {}",
                vm, state
            )));
        }
        Ok(PowerState::Suspended)
    }
}

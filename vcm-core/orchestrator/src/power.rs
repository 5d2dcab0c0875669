//! 电源生命周期
//!
//! 所有异步步骤都经过任务轮询器，运行中出现的问题会被自动回答。

use tracing::info;
use vcm_vimclient::{PowerState, VmRef};

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::poller::TaskPoller;
use crate::question::QuestionResponder;

/// 电源操作
pub struct PowerOps {
    ctx: Context,
    poller: TaskPoller,
    responder: QuestionResponder,
}

impl PowerOps {
    pub fn new(ctx: Context) -> Self {
        Self {
            poller: TaskPoller::new(ctx.clone()),
            responder: QuestionResponder::new(ctx.clone()),
            ctx,
        }
    }

    /// 当前状态 (含待回答问题)
    pub async fn state(&self, name: &str) -> Result<PowerState> {
        let vm = self.ctx.find_vm(name).await?;
        self.state_of(&vm).await
    }

    pub async fn state_of(&self, vm: &VmRef) -> Result<PowerState> {
        Ok(self.ctx.server().runtime(vm).await?.effective_state())
    }

    /// 开机，已开机时直接返回
    pub async fn start(&self, name: &str) -> Result<()> {
        let vm = self.ctx.find_vm(name).await?;
        self.start_vm(&vm).await
    }

    pub async fn start_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state_of(vm).await?;
        if state == PowerState::PendingQuestion {
            self.responder.answer(vm).await?;
            state = self.state_of(vm).await?;
        }
        if state == PowerState::PoweredOn {
            info!("虚拟机 {} 已开机", vm);
            return Ok(());
        }

        info!("开机: {}", vm);
        let task = self.ctx.server().power_on(vm).await?;
        self.poller
            .wait_success(&task, Some(vm), &format!("开机 {}", vm))
            .await
    }

    /// 关机，已关机时直接返回；挂起的虚拟机先恢复再关机
    pub async fn stop(&self, name: &str) -> Result<()> {
        let vm = self.ctx.find_vm(name).await?;
        self.stop_vm(&vm).await
    }

    pub async fn stop_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state_of(vm).await?;
        if state == PowerState::PendingQuestion {
            self.responder.answer(vm).await?;
            state = self.state_of(vm).await?;
        }
        match state {
            PowerState::PoweredOff => {
                info!("虚拟机 {} 已关机", vm);
                return Ok(());
            }
            PowerState::Suspended => self.start_vm(vm).await?,
            _ => {}
        }

        info!("关机: {}", vm);
        let task = self.ctx.server().power_off(vm).await?;
        self.poller
            .wait_success(&task, Some(vm), &format!("关机 {}", vm))
            .await
    }

    /// 挂起，已挂起时直接返回；关机状态不能挂起
    pub async fn suspend(&self, name: &str) -> Result<()> {
        let vm = self.ctx.find_vm(name).await?;
        self.suspend_vm(&vm).await
    }

    pub async fn suspend_vm(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.state_of(vm).await?;
        if state == PowerState::PendingQuestion {
            self.responder.answer(vm).await?;
            state = self.state_of(vm).await?;
        }
        match state {
            PowerState::Suspended => {
                info!("虚拟机 {} 已挂起", vm);
                return Ok(());
            }
            PowerState::PoweredOff => {
                return Err(OrchestratorError::Precondition(format!(
                    "虚拟机 {} 已关机，不能挂起",
                    vm
                )))
            }
            _ => {}
        }

        info!("挂起: {}", vm);
        let task = self.ctx.server().suspend(vm).await?;
        self.poller
            .wait_success(&task, Some(vm), &format!("挂起 {}", vm))
            .await
    }

    /// 冷重置
    pub async fn reset(&self, name: &str) -> Result<()> {
        let vm = self.ctx.find_vm(name).await?;
        self.reset_vm(&vm).await
    }

    pub async fn reset_vm(&self, vm: &VmRef) -> Result<()> {
        info!("冷重置: {}", vm);
        let task = self.ctx.server().reset(vm).await?;
        self.poller
            .wait_success(&task, Some(vm), &format!("重置 {}", vm))
            .await
    }
}
